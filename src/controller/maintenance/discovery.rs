//! Pinned workload discovery
//!
//! A workload is pinned to a node when its pod template constrains it to
//! that node's hostname, either with a `nodeSelector` or a required node
//! affinity term. The cluster's own scheduling metadata is the only source of
//! truth; nothing is cached between calls.

use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

use super::types::ManagedWorkload;
use crate::client::ClusterClient;
use crate::config::HOSTNAME_LABEL;
use crate::error::Result;

/// Resolve the node a deployment is pinned to.
///
/// A `nodeSelector` on the hostname label takes precedence. Otherwise the
/// first required node-affinity expression on the hostname key with the `In`
/// operator and at least one value yields its first value. Preferred-only
/// affinity, other keys, other operators and empty value lists are not pins.
pub fn resolve_target_node(deployment: &Deployment) -> Option<String> {
    let pod_spec = deployment.spec.as_ref()?.template.spec.as_ref()?;

    if let Some(node) = pod_spec
        .node_selector
        .as_ref()
        .and_then(|selector| selector.get(HOSTNAME_LABEL))
        .filter(|node| !node.is_empty())
    {
        return Some(node.clone());
    }

    let required = pod_spec
        .affinity
        .as_ref()?
        .node_affinity
        .as_ref()?
        .required_during_scheduling_ignored_during_execution
        .as_ref()?;

    required
        .node_selector_terms
        .iter()
        .flat_map(|term| term.match_expressions.iter().flatten())
        .filter(|expr| expr.key == HOSTNAME_LABEL && expr.operator == "In")
        .find_map(|expr| expr.values.as_ref().and_then(|v| v.first()).cloned())
}

fn matches_prefixes(name: &str, prefixes: &[String]) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|p| name.starts_with(p.as_str()))
}

/// Workloads in `namespace` pinned to `node`.
///
/// An empty prefix filter returns every pinned workload. Replica counts are
/// reported as-is, including zero. Client errors are propagated.
pub async fn list_pinned(
    client: &dyn ClusterClient,
    namespace: &str,
    node: &str,
    prefixes: &[String],
) -> Result<Vec<ManagedWorkload>> {
    let deployments = client.list_deployments(namespace).await?;

    let pinned: Vec<ManagedWorkload> = deployments
        .iter()
        .filter_map(|d| {
            let target = resolve_target_node(d)?;
            (target == node).then(|| ManagedWorkload::from_deployment(d, Some(target)))
        })
        .filter(|w| matches_prefixes(&w.name, prefixes))
        .collect();

    debug!(
        "Found {} pinned workloads for node {} in {}",
        pinned.len(),
        node,
        namespace
    );
    Ok(pinned)
}

/// Pinned workloads that are explicitly scaled to zero.
///
/// A deployment without an explicit replica count defaults to 1 and is not
/// considered scaled down.
pub async fn list_scaled_down(
    client: &dyn ClusterClient,
    namespace: &str,
    node: &str,
    prefixes: &[String],
) -> Result<Vec<ManagedWorkload>> {
    let deployments = client.list_deployments(namespace).await?;

    Ok(deployments
        .iter()
        .filter(|d| d.spec.as_ref().and_then(|s| s.replicas) == Some(0))
        .filter_map(|d| {
            let target = resolve_target_node(d)?;
            (target == node).then(|| ManagedWorkload::from_deployment(d, Some(target)))
        })
        .filter(|w| matches_prefixes(&w.name, prefixes))
        .collect())
}
