//! Cluster client capability
//!
//! The orchestration engine and the monitor only talk to the cluster through
//! [`ClusterClient`]. [`KubeClusterClient`] is the production implementation;
//! tests use an in-memory fake.

pub mod ceph;
#[cfg(test)]
pub(crate) mod fake;
mod kubernetes;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use kubernetes::KubeClusterClient;
pub use ceph::{CephHealth, HealthCheck, OsdStatus, QuorumStatus, StorageHealth};

/// Observed state of a Kubernetes node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
    pub cordoned: bool,
}

/// How a replica scale call treats the original-replicas annotation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaAnnotation {
    /// Record the given count as the pre-maintenance replica count
    Record(i32),
    /// Remove the annotation
    Clear,
    /// Leave the annotation untouched
    Keep,
}

/// A single authorization question: may the caller `verb` the `resource`?
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PermissionCheck {
    pub group: String,
    pub resource: String,
    pub subresource: Option<String>,
    pub verb: String,
    pub namespace: Option<String>,
}

impl PermissionCheck {
    pub fn new(group: &str, resource: &str, verb: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            subresource: None,
            verb: verb.to_string(),
            namespace: None,
        }
    }

    pub fn subresource(mut self, subresource: &str) -> Self {
        self.subresource = Some(subresource.to_string());
        self
    }

    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Human readable form, e.g. `create pods/exec in rook-ceph`
    pub fn describe(&self) -> String {
        let resource = match &self.subresource {
            Some(sub) => format!("{}/{}", self.resource, sub),
            None => self.resource.clone(),
        };
        match &self.namespace {
            Some(ns) => format!("{} {} in {}", self.verb, resource, ns),
            None => format!("{} {}", self.verb, resource),
        }
    }
}

/// Everything the maintenance engine needs from the cluster.
///
/// Implementations return typed values; no caller parses wire payloads.
/// Cancellation is cooperative: callers check their token before issuing a
/// mutating call and may drop an in-progress future.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a node, `None` when it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>>;

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Cordon (`true`) or uncordon (`false`) a node
    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()>;

    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Set a deployment's replica count and update the original-replicas
    /// annotation in the same patch
    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        annotation: ReplicaAnnotation,
    ) -> Result<()>;

    /// Whether the named cluster-wide safety flag is set
    async fn safety_flag_set(&self, flag: &str) -> Result<bool>;

    async fn set_safety_flag(&self, flag: &str, enabled: bool) -> Result<()>;

    async fn storage_health(&self) -> Result<StorageHealth>;

    async fn quorum_status(&self) -> Result<QuorumStatus>;

    async fn osd_status(&self) -> Result<Vec<OsdStatus>>;

    /// Authorization query for the current identity
    async fn can_i(&self, check: &PermissionCheck) -> Result<bool>;
}
