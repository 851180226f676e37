//! kube-rs backed [`ClusterClient`]
//!
//! Node and deployment access goes through the Kubernetes API. Storage state
//! (safety flag, health, quorum, OSD up/in) is read by running `ceph` in the
//! toolbox pod and parsing its JSON output.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, AttachParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument};

use super::ceph;
use super::{
    ClusterClient, NodeInfo, OsdStatus, PermissionCheck, QuorumStatus, ReplicaAnnotation,
    StorageHealth,
};
use crate::config::{MaintenanceConfig, ORIGINAL_REPLICAS_ANNOTATION};
use crate::error::{Error, Result};

/// Cluster client talking to a real Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    toolbox_namespace: String,
    toolbox_selector: String,
}

impl KubeClusterClient {
    pub fn new(client: Client, config: &MaintenanceConfig) -> Self {
        Self {
            client,
            toolbox_namespace: config.namespace.clone(),
            toolbox_selector: config.toolbox_selector.clone(),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account
    pub async fn try_default(config: &MaintenanceConfig) -> Result<Self> {
        let client = Client::try_default().await.map_err(Error::KubeError)?;
        Ok(Self::new(client, config))
    }

    /// Pick a running toolbox pod to exec into
    async fn toolbox_pod(&self) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.toolbox_namespace);
        let list = pods
            .list(&ListParams::default().labels(&self.toolbox_selector))
            .await?;

        list.items
            .iter()
            .find(|p| {
                p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
                    && p.metadata.deletion_timestamp.is_none()
            })
            .map(|p| p.name_any())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no running toolbox pod matching '{}' in {}",
                    self.toolbox_selector, self.toolbox_namespace
                ))
            })
    }

    /// Run a `ceph` command in the toolbox pod and return its stdout
    #[instrument(skip(self))]
    async fn ceph(&self, args: &[&str]) -> Result<String> {
        let pod = self.toolbox_pod().await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.toolbox_namespace);

        let mut command = vec!["ceph"];
        command.extend_from_slice(args);

        let mut process = pods
            .exec(
                &pod,
                command,
                &AttachParams::default().stdin(false).stderr(false),
            )
            .await?;

        let status = process.take_status();

        let mut output = String::new();
        if let Some(mut stdout) = process.stdout() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| Error::CommandError(format!("reading output of ceph {args:?}: {e}")))?;
        }

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    return Err(Error::CommandError(format!(
                        "ceph {}: {}",
                        args.join(" "),
                        status.message.unwrap_or_default()
                    )));
                }
            }
        }

        process
            .join()
            .await
            .map_err(|e| Error::CommandError(format!("ceph {}: {e}", args.join(" "))))?;

        debug!("ceph {} returned {} bytes", args.join(" "), output.len());
        Ok(output)
    }
}

fn node_info(node: &Node) -> NodeInfo {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false);
    let cordoned = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);

    NodeInfo {
        name: node.name_any(),
        ready,
        cordoned,
    }
}

/// Merge patch setting replicas and the original-replicas annotation together
pub(crate) fn scale_patch(replicas: i32, annotation: ReplicaAnnotation) -> serde_json::Value {
    match annotation {
        ReplicaAnnotation::Record(original) => json!({
            "metadata": {
                "annotations": { ORIGINAL_REPLICAS_ANNOTATION: original.to_string() }
            },
            "spec": { "replicas": replicas }
        }),
        // A null value removes the key in a JSON merge patch
        ReplicaAnnotation::Clear => json!({
            "metadata": {
                "annotations": { ORIGINAL_REPLICAS_ANNOTATION: null }
            },
            "spec": { "replicas": replicas }
        }),
        ReplicaAnnotation::Keep => json!({
            "spec": { "replicas": replicas }
        }),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get_opt(name).await?.as_ref().map(node_info))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(node_info).collect())
    }

    #[instrument(skip(self))]
    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        nodes
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(
            "Node {} {}",
            name,
            if unschedulable { "cordoned" } else { "uncordoned" }
        );
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.get_opt(name).await?.is_some())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments.list(&ListParams::default()).await?.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments.get_opt(name).await?)
    }

    #[instrument(skip(self))]
    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        annotation: ReplicaAnnotation,
    ) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = scale_patch(replicas, annotation);
        deployments
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!("Scaled deployment {}/{} to {}", namespace, name, replicas);
        Ok(())
    }

    async fn safety_flag_set(&self, flag: &str) -> Result<bool> {
        let dump = self.ceph(&["osd", "dump", "--format", "json"]).await?;
        ceph::osd_flag_set(&dump, flag)
    }

    #[instrument(skip(self))]
    async fn set_safety_flag(&self, flag: &str, enabled: bool) -> Result<()> {
        let verb = if enabled { "set" } else { "unset" };
        self.ceph(&["osd", verb, flag]).await?;
        info!("Storage flag {} {}", flag, verb);
        Ok(())
    }

    async fn storage_health(&self) -> Result<StorageHealth> {
        let status = self.ceph(&["status", "--format", "json"]).await?;
        ceph::parse_status(&status)
    }

    async fn quorum_status(&self) -> Result<QuorumStatus> {
        let status = self.ceph(&["quorum_status", "--format", "json"]).await?;
        ceph::parse_quorum_status(&status)
    }

    async fn osd_status(&self) -> Result<Vec<OsdStatus>> {
        let dump = self.ceph(&["osd", "dump", "--format", "json"]).await?;
        ceph::parse_osd_status(&dump)
    }

    async fn can_i(&self, check: &PermissionCheck) -> Result<bool> {
        let reviews: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    group: Some(check.group.clone()),
                    resource: Some(check.resource.clone()),
                    subresource: check.subresource.clone(),
                    verb: Some(check.verb.clone()),
                    namespace: check.namespace.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = reviews.create(&PostParams::default(), &review).await?;
        Ok(response.status.map(|s| s.allowed).unwrap_or(false))
    }
}
