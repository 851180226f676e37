//! In-memory [`ClusterClient`] for unit tests
//!
//! Holds nodes, namespaces, deployments and storage state behind a mutex,
//! records every mutating call, and can inject failures per operation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec,
    PodTemplateSpec,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use super::{
    CephHealth, ClusterClient, NodeInfo, OsdStatus, PermissionCheck, QuorumStatus,
    ReplicaAnnotation, StorageHealth,
};
use crate::config::{HOSTNAME_LABEL, ORIGINAL_REPLICAS_ANNOTATION};
use crate::error::{Error, Result};

pub(crate) struct FakeState {
    pub nodes: Vec<NodeInfo>,
    pub namespaces: BTreeSet<String>,
    /// Kept in insertion order so listing order is predictable
    pub deployments: Vec<Deployment>,
    pub flags: BTreeSet<String>,
    pub storage: StorageHealth,
    pub quorum: QuorumStatus,
    pub osds: Vec<OsdStatus>,
    /// Permission checks (by `describe()`) that are denied
    pub denied: BTreeSet<String>,
    /// Operations that fail, e.g. `list_deployments` or `scale:rook-ceph-osd-2`
    pub failing: BTreeSet<String>,
    /// Log of mutating calls in the order they were issued
    pub mutations: Vec<String>,
    /// Cancel the token once this many mutations have been issued
    pub cancel_after: Option<(usize, CancellationToken)>,
}

pub(crate) struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    /// A healthy cluster with the default namespaces and no nodes
    pub fn new() -> Self {
        let namespaces = ["rook-ceph".to_string()].into_iter().collect();
        Self {
            state: Mutex::new(FakeState {
                nodes: Vec::new(),
                namespaces,
                deployments: Vec::new(),
                flags: BTreeSet::new(),
                storage: StorageHealth {
                    status: CephHealth::Ok,
                    checks: Vec::new(),
                },
                quorum: QuorumStatus {
                    in_quorum: vec!["a".to_string(), "b".to_string(), "c".to_string()],
                    monitors: vec!["a".to_string(), "b".to_string(), "c".to_string()],
                },
                osds: Vec::new(),
                denied: BTreeSet::new(),
                failing: BTreeSet::new(),
                mutations: Vec::new(),
                cancel_after: None,
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_node(&self, name: &str, ready: bool, cordoned: bool) {
        self.with(|s| {
            s.nodes.push(NodeInfo {
                name: name.to_string(),
                ready,
                cordoned,
            })
        });
    }

    pub fn add_deployment(&self, deployment: Deployment) {
        self.with(|s| s.deployments.push(deployment));
    }

    pub fn remove_deployment(&self, name: &str) {
        self.with(|s| s.deployments.retain(|d| d.name_any() != name));
    }

    pub fn set_flag(&self, flag: &str) {
        self.with(|s| s.flags.insert(flag.to_string()));
    }

    pub fn fail(&self, operation: &str) {
        self.with(|s| s.failing.insert(operation.to_string()));
    }

    pub fn heal(&self, operation: &str) {
        self.with(|s| s.failing.remove(operation));
    }

    pub fn deny(&self, permission: &str) {
        self.with(|s| s.denied.insert(permission.to_string()));
    }

    pub fn cancel_after(&self, mutations: usize, token: CancellationToken) {
        self.with(|s| s.cancel_after = Some((mutations, token)));
    }

    pub fn mutations(&self) -> Vec<String> {
        self.with(|s| s.mutations.clone())
    }

    pub fn replicas(&self, name: &str) -> Option<i32> {
        self.with(|s| {
            s.deployments
                .iter()
                .find(|d| d.name_any() == name)
                .and_then(|d| d.spec.as_ref().and_then(|spec| spec.replicas))
        })
    }

    pub fn annotation(&self, name: &str) -> Option<String> {
        self.with(|s| {
            s.deployments
                .iter()
                .find(|d| d.name_any() == name)
                .and_then(|d| d.annotations().get(ORIGINAL_REPLICAS_ANNOTATION).cloned())
        })
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.with(|s| s.failing.contains(operation)) {
            return Err(Error::ClusterError(format!("injected failure: {operation}")));
        }
        Ok(())
    }

    fn record(&self, mutation: String) {
        self.with(|s| {
            s.mutations.push(mutation);
            if let Some((limit, token)) = &s.cancel_after {
                if s.mutations.len() >= *limit {
                    token.cancel();
                }
            }
        });
    }
}

/// Deployment pinned with a hostname node selector
pub(crate) fn pinned(namespace: &str, name: &str, node: &str, replicas: Option<i32>) -> Deployment {
    let mut selector = BTreeMap::new();
    selector.insert(HOSTNAME_LABEL.to_string(), node.to_string());
    deployment(
        namespace,
        name,
        replicas,
        PodSpec {
            node_selector: Some(selector),
            ..Default::default()
        },
    )
}

/// Deployment pinned with a required node-affinity term
pub(crate) fn affinity_pinned(
    namespace: &str,
    name: &str,
    key: &str,
    operator: &str,
    values: Vec<&str>,
    replicas: Option<i32>,
) -> Deployment {
    deployment(
        namespace,
        name,
        replicas,
        PodSpec {
            affinity: Some(required_affinity(key, operator, values)),
            ..Default::default()
        },
    )
}

pub(crate) fn required_affinity(key: &str, operator: &str, values: Vec<&str>) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: key.to_string(),
                        operator: operator.to_string(),
                        values: Some(values.into_iter().map(String::from).collect()),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn deployment(
    namespace: &str,
    name: &str,
    replicas: Option<i32>,
    pod_spec: PodSpec,
) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas,
            template: PodTemplateSpec {
                spec: Some(pod_spec),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            ready_replicas: replicas,
            ..Default::default()
        }),
    }
}

/// Attach the original-replicas annotation to a deployment
pub(crate) fn with_original(mut deployment: Deployment, original: i32) -> Deployment {
    deployment
        .annotations_mut()
        .insert(ORIGINAL_REPLICAS_ANNOTATION.to_string(), original.to_string());
    deployment
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        self.check("get_node")?;
        Ok(self.with(|s| s.nodes.iter().find(|n| n.name == name).cloned()))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.check("list_nodes")?;
        Ok(self.with(|s| s.nodes.clone()))
    }

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        self.check("set_node_unschedulable")?;
        let verb = if unschedulable { "cordon" } else { "uncordon" };
        self.record(format!("{verb} {name}"));
        self.with(|s| match s.nodes.iter_mut().find(|n| n.name == name) {
            Some(node) => {
                node.cordoned = unschedulable;
                Ok(())
            }
            None => Err(Error::NotFound(format!("node {name}"))),
        })
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        self.check("namespace_exists")?;
        Ok(self.with(|s| s.namespaces.contains(name)))
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        self.check("list_deployments")?;
        Ok(self.with(|s| {
            s.deployments
                .iter()
                .filter(|d| d.namespace().as_deref() == Some(namespace))
                .cloned()
                .collect()
        }))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.check("get_deployment")?;
        Ok(self.with(|s| {
            s.deployments
                .iter()
                .find(|d| d.namespace().as_deref() == Some(namespace) && d.name_any() == name)
                .cloned()
        }))
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        annotation: ReplicaAnnotation,
    ) -> Result<()> {
        self.record(format!("scale {name} {replicas}"));
        self.check(&format!("scale:{name}"))?;
        self.with(|s| {
            let deployment = s
                .deployments
                .iter_mut()
                .find(|d| d.namespace().as_deref() == Some(namespace) && d.name_any() == name)
                .ok_or_else(|| Error::NotFound(format!("deployment {namespace}/{name}")))?;

            if let Some(spec) = deployment.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
            match annotation {
                ReplicaAnnotation::Record(original) => {
                    deployment.annotations_mut().insert(
                        ORIGINAL_REPLICAS_ANNOTATION.to_string(),
                        original.to_string(),
                    );
                }
                ReplicaAnnotation::Clear => {
                    deployment
                        .annotations_mut()
                        .remove(ORIGINAL_REPLICAS_ANNOTATION);
                }
                ReplicaAnnotation::Keep => {}
            }
            Ok(())
        })
    }

    async fn safety_flag_set(&self, flag: &str) -> Result<bool> {
        self.check("safety_flag_set")?;
        Ok(self.with(|s| s.flags.contains(flag)))
    }

    async fn set_safety_flag(&self, flag: &str, enabled: bool) -> Result<()> {
        let verb = if enabled { "set" } else { "unset" };
        self.record(format!("{verb} {flag}"));
        self.check("set_safety_flag")?;
        self.with(|s| {
            if enabled {
                s.flags.insert(flag.to_string());
            } else {
                s.flags.remove(flag);
            }
        });
        Ok(())
    }

    async fn storage_health(&self) -> Result<StorageHealth> {
        self.check("storage_health")?;
        Ok(self.with(|s| s.storage.clone()))
    }

    async fn quorum_status(&self) -> Result<QuorumStatus> {
        self.check("quorum_status")?;
        Ok(self.with(|s| s.quorum.clone()))
    }

    async fn osd_status(&self) -> Result<Vec<OsdStatus>> {
        self.check("osd_status")?;
        Ok(self.with(|s| s.osds.clone()))
    }

    async fn can_i(&self, check: &PermissionCheck) -> Result<bool> {
        self.check("can_i")?;
        Ok(self.with(|s| !s.denied.contains(&check.describe())))
    }
}
