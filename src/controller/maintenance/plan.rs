//! Maintenance plans and the review/confirm step
//!
//! A plan is captured once, shown to the operator, and executed exactly as
//! captured. Execution never re-derives it from cluster state, so changes made
//! between confirmation and execution cannot alter which workloads are acted
//! upon.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, info};

use super::discovery::{list_pinned, list_scaled_down};
use super::ordering::{order_for_down, order_for_up};
use super::phase::{DownPhase, UpPhase};
use super::types::{ConflictWarning, ManagedWorkload, ValidationResults};
use crate::client::ClusterClient;
use crate::config::{MaintenanceConfig, ORIGINAL_REPLICAS_ANNOTATION};
use crate::error::{Error, Result};

/// Storage operator deployment as captured at plan time
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperatorSnapshot {
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
    /// Replica count to bring the operator back to
    pub restore_replicas: i32,
}

impl OperatorSnapshot {
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Ordered plan for taking a node out of service
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DownPlan {
    node: String,
    workloads: Vec<ManagedWorkload>,
    operator: Option<OperatorSnapshot>,
    node_cordoned: bool,
    safety_flag: String,
    safety_flag_set: bool,
    captured_at: DateTime<Utc>,
}

impl DownPlan {
    pub fn new(
        node: &str,
        workloads: Vec<ManagedWorkload>,
        operator: Option<OperatorSnapshot>,
        node_cordoned: bool,
        safety_flag: &str,
        safety_flag_set: bool,
    ) -> Self {
        Self {
            node: node.to_string(),
            workloads: order_for_down(workloads),
            operator,
            node_cordoned,
            safety_flag: safety_flag.to_string(),
            safety_flag_set,
            captured_at: Utc::now(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Workloads in the order they will be scaled down
    pub fn workloads(&self) -> &[ManagedWorkload] {
        &self.workloads
    }

    pub fn operator(&self) -> Option<&OperatorSnapshot> {
        self.operator.as_ref()
    }

    pub fn node_cordoned(&self) -> bool {
        self.node_cordoned
    }

    pub fn safety_flag(&self) -> &str {
        &self.safety_flag
    }

    pub fn safety_flag_set(&self) -> bool {
        self.safety_flag_set
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Every step of the down phase has already been applied
    pub fn is_nothing_to_do(&self) -> bool {
        self.node_cordoned
            && self.safety_flag_set
            && self.operator.as_ref().map_or(true, |o| o.replicas == 0)
            && self.workloads.iter().all(ManagedWorkload::is_scaled_down)
    }
}

/// A workload and the replica count it is restored to
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RestoreTarget {
    pub workload: ManagedWorkload,
    pub replicas: i32,
}

/// Ordered plan for bringing a node back into service
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UpPlan {
    node: String,
    targets: Vec<RestoreTarget>,
    operator: Option<OperatorSnapshot>,
    safety_flag: String,
    /// Other nodes are still in maintenance, so the flag stays set
    leave_safety_flag: bool,
    captured_at: DateTime<Utc>,
}

impl UpPlan {
    pub fn new(
        node: &str,
        workloads: Vec<ManagedWorkload>,
        operator: Option<OperatorSnapshot>,
        safety_flag: &str,
        leave_safety_flag: bool,
    ) -> Self {
        let targets = order_for_up(workloads)
            .into_iter()
            .map(|workload| RestoreTarget {
                replicas: workload.restore_replicas(),
                workload,
            })
            .collect();

        Self {
            node: node.to_string(),
            targets,
            operator,
            safety_flag: safety_flag.to_string(),
            leave_safety_flag,
            captured_at: Utc::now(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Workloads in the order they will be restored
    pub fn targets(&self) -> &[RestoreTarget] {
        &self.targets
    }

    pub fn operator(&self) -> Option<&OperatorSnapshot> {
        self.operator.as_ref()
    }

    pub fn safety_flag(&self) -> &str {
        &self.safety_flag
    }

    pub fn leave_safety_flag(&self) -> bool {
        self.leave_safety_flag
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// The operator's answer at the confirmation step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Accept { acknowledge_conflicts: bool },
    Decline,
}

/// Result of confirming a review
#[derive(Clone, Debug)]
pub enum Confirmation<T> {
    Confirmed(T),
    Declined,
    NothingToDo,
}

/// Everything shown to the operator before the down phase starts
#[derive(Clone, Debug)]
pub struct DownReview {
    pub plan: Arc<DownPlan>,
    /// Preflight warm-up; preflight runs again before any mutation
    pub validation: ValidationResults,
    pub conflicts: ConflictWarning,
}

impl DownReview {
    /// `Confirm`, or `NothingToDo` when every step is already applied
    pub fn state(&self) -> DownPhase {
        if self.plan.is_nothing_to_do() {
            DownPhase::NothingToDo
        } else {
            DownPhase::Confirm
        }
    }

    pub fn confirm(self, decision: Decision) -> Result<Confirmation<ConfirmedDown>> {
        if self.state() == DownPhase::NothingToDo {
            return Ok(Confirmation::NothingToDo);
        }
        match decision {
            Decision::Decline => {
                info!("Down plan for {} declined", self.plan.node());
                Ok(Confirmation::Declined)
            }
            Decision::Accept {
                acknowledge_conflicts,
            } => {
                if self.conflicts.has_conflicts() && !acknowledge_conflicts {
                    return Err(Error::ConflictNotAcknowledged(self.conflicts.summary()));
                }
                info!(
                    "Down plan for {} confirmed with {} workload(s)",
                    self.plan.node(),
                    self.plan.workloads().len()
                );
                Ok(Confirmation::Confirmed(ConfirmedDown { plan: self.plan }))
            }
        }
    }
}

/// Everything shown to the operator before the up phase starts
#[derive(Clone, Debug)]
pub struct UpReview {
    pub plan: Arc<UpPlan>,
    pub validation: ValidationResults,
    pub conflicts: ConflictWarning,
}

impl UpReview {
    pub fn state(&self) -> UpPhase {
        UpPhase::Confirm
    }

    /// The safety flag is expected to be set while bringing a node back, so
    /// only other nodes in maintenance need acknowledging
    pub fn confirm(self, decision: Decision) -> Result<Confirmation<ConfirmedUp>> {
        match decision {
            Decision::Decline => {
                info!("Up plan for {} declined", self.plan.node());
                Ok(Confirmation::Declined)
            }
            Decision::Accept {
                acknowledge_conflicts,
            } => {
                if !self.conflicts.other_nodes.is_empty() && !acknowledge_conflicts {
                    return Err(Error::ConflictNotAcknowledged(self.conflicts.summary()));
                }
                info!(
                    "Up plan for {} confirmed with {} workload(s)",
                    self.plan.node(),
                    self.plan.targets().len()
                );
                Ok(Confirmation::Confirmed(ConfirmedUp {
                    plan: self.plan,
                    skip_missing: BTreeSet::new(),
                }))
            }
        }
    }
}

/// A down plan the operator accepted; reused unchanged on retry
#[derive(Clone, Debug)]
pub struct ConfirmedDown {
    plan: Arc<DownPlan>,
}

impl ConfirmedDown {
    pub fn plan(&self) -> &Arc<DownPlan> {
        &self.plan
    }
}

/// An up plan the operator accepted, plus missing workloads they agreed to skip
#[derive(Clone, Debug)]
pub struct ConfirmedUp {
    plan: Arc<UpPlan>,
    skip_missing: BTreeSet<String>,
}

impl ConfirmedUp {
    pub fn plan(&self) -> &Arc<UpPlan> {
        &self.plan
    }

    pub fn skipped(&self) -> &BTreeSet<String> {
        &self.skip_missing
    }

    pub fn is_skipped(&self, workload: &ManagedWorkload) -> bool {
        self.skip_missing.contains(&workload.id())
    }

    /// Acknowledge workloads (by `namespace/name`) that no longer exist
    pub fn acknowledge_missing<I, S>(mut self, missing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_missing.extend(missing.into_iter().map(Into::into));
        self
    }
}

/// Capture the storage operator deployment, `None` if it is not installed
pub(crate) async fn capture_operator(
    client: &dyn ClusterClient,
    config: &MaintenanceConfig,
) -> Result<Option<OperatorSnapshot>> {
    let deployment = client
        .get_deployment(&config.operator_namespace, &config.operator_deployment)
        .await?;

    Ok(deployment.map(|d| {
        let replicas = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let recorded = d
            .annotations()
            .get(ORIGINAL_REPLICAS_ANNOTATION)
            .and_then(|v| v.parse::<i32>().ok())
            .filter(|n| *n > 0);
        OperatorSnapshot {
            namespace: config.operator_namespace.clone(),
            name: config.operator_deployment.clone(),
            replicas,
            restore_replicas: recorded.unwrap_or(replicas.max(1)),
        }
    }))
}

/// Pinned workloads the per-workload steps act on; the toolbox and operator
/// are handled separately
fn managed(workloads: Vec<ManagedWorkload>) -> Vec<ManagedWorkload> {
    workloads
        .into_iter()
        .filter(|w| !w.category.is_management())
        .collect()
}

pub(crate) async fn build_down_plan(
    client: &dyn ClusterClient,
    config: &MaintenanceConfig,
    node: &str,
) -> Result<DownPlan> {
    let discovery = |what: &str, e: Error| Error::DiscoveryError(format!("{what}: {e}"));

    let workloads = list_pinned(client, &config.namespace, node, &config.workload_prefixes)
        .await
        .map_err(|e| discovery("listing pinned workloads", e))?;
    let node_cordoned = client
        .get_node(node)
        .await
        .map_err(|e| discovery("reading node", e))?
        .map(|n| n.cordoned)
        .unwrap_or(false);
    let safety_flag_set = client
        .safety_flag_set(&config.safety_flag)
        .await
        .map_err(|e| discovery("reading safety flag", e))?;
    let operator = capture_operator(client, config)
        .await
        .map_err(|e| discovery("reading operator deployment", e))?;

    let plan = DownPlan::new(
        node,
        managed(workloads),
        operator,
        node_cordoned,
        &config.safety_flag,
        safety_flag_set,
    );
    debug!(
        "Down plan for {}: {} workload(s), nothing to do: {}",
        node,
        plan.workloads().len(),
        plan.is_nothing_to_do()
    );
    Ok(plan)
}

pub(crate) async fn build_up_plan(
    client: &dyn ClusterClient,
    config: &MaintenanceConfig,
    node: &str,
    conflicts: &ConflictWarning,
) -> Result<UpPlan> {
    let discovery = |what: &str, e: Error| Error::DiscoveryError(format!("{what}: {e}"));

    let workloads = list_scaled_down(client, &config.namespace, node, &config.workload_prefixes)
        .await
        .map_err(|e| discovery("listing scaled-down workloads", e))?;
    let operator = capture_operator(client, config)
        .await
        .map_err(|e| discovery("reading operator deployment", e))?;

    let leave_safety_flag = !conflicts.nodes_with_scaled_down_workloads().is_empty();
    let plan = UpPlan::new(
        node,
        managed(workloads),
        operator,
        &config.safety_flag,
        leave_safety_flag,
    );
    debug!(
        "Up plan for {}: {} workload(s), leave safety flag: {}",
        node,
        plan.targets().len(),
        leave_safety_flag
    );
    Ok(plan)
}
