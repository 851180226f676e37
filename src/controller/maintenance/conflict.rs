//! Detection of maintenance already in progress elsewhere in the cluster
//!
//! Advisory only: a conflict never blocks a plan, it is shown at
//! confirmation time so the operator can decide.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::discovery::resolve_target_node;
use super::types::{ConflictWarning, OtherNodeMaintenance};
use crate::client::ClusterClient;
use crate::config::MaintenanceConfig;
use crate::error::Result;

/// Report the safety-flag state and every node other than `exclude_node` that
/// is cordoned or has pinned workloads at zero replicas.
///
/// Errors degrade to an empty warning.
pub async fn check_other_nodes_in_maintenance(
    client: &dyn ClusterClient,
    config: &MaintenanceConfig,
    exclude_node: &str,
) -> ConflictWarning {
    match detect(client, config, exclude_node).await {
        Ok(warning) => {
            if warning.has_conflicts() {
                warn!("Possible concurrent maintenance: {}", warning.summary());
            }
            warning
        }
        Err(e) => {
            warn!("Conflict check failed, continuing without it: {}", e);
            ConflictWarning::default()
        }
    }
}

async fn detect(
    client: &dyn ClusterClient,
    config: &MaintenanceConfig,
    exclude_node: &str,
) -> Result<ConflictWarning> {
    let safety_flag_set = client.safety_flag_set(&config.safety_flag).await?;
    let nodes = client.list_nodes().await?;
    let deployments = client.list_deployments(&config.namespace).await?;

    // Scaled-down pinned workloads grouped by the node they are pinned to
    let mut scaled_down: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for deployment in &deployments {
        if deployment.spec.as_ref().and_then(|s| s.replicas) != Some(0) {
            continue;
        }
        if let Some(node) = resolve_target_node(deployment) {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            scaled_down.entry(node).or_default().push(name);
        }
    }

    let other_nodes: Vec<OtherNodeMaintenance> = nodes
        .into_iter()
        .filter(|n| n.name != exclude_node)
        .filter_map(|n| {
            let workloads = scaled_down.remove(&n.name).unwrap_or_default();
            (n.cordoned || !workloads.is_empty()).then(|| OtherNodeMaintenance {
                node: n.name,
                cordoned: n.cordoned,
                scaled_down: workloads,
            })
        })
        .collect();

    debug!(
        "Conflict check for {}: flag set {}, {} other node(s) in maintenance",
        exclude_node,
        safety_flag_set,
        other_nodes.len()
    );

    Ok(ConflictWarning {
        safety_flag_set,
        other_nodes,
    })
}
