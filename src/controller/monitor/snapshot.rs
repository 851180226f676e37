//! Immutable monitor snapshots and the health summary derived from them

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::{CephHealth, NodeInfo, OsdStatus, QuorumStatus, StorageHealth};
use crate::controller::maintenance::WorkloadCategory;

/// Last failure of a monitor source
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Latest known value of one source plus its most recent error.
///
/// A failed poll keeps the last good value and only records the error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceSlot<T> {
    pub value: Option<Arc<T>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<SourceError>,
}

impl<T> Default for SourceSlot<T> {
    fn default() -> Self {
        Self {
            value: None,
            updated_at: None,
            error: None,
        }
    }
}

impl<T> SourceSlot<T> {
    /// The last poll failed; `value` may be out of date
    pub fn is_stale(&self) -> bool {
        self.error.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_deref()
    }

    fn apply(&mut self, result: Result<T, String>, at: DateTime<Utc>) {
        match result {
            Ok(value) => {
                self.value = Some(Arc::new(value));
                self.updated_at = Some(at);
                self.error = None;
            }
            Err(message) => self.error = Some(SourceError { message, at }),
        }
    }
}

/// Desired and ready replicas of one category of workloads on the node
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkloadHealth {
    pub category: WorkloadCategory,
    pub desired: i32,
    pub ready: i32,
}

impl WorkloadHealth {
    pub fn is_degraded(&self) -> bool {
        self.ready < self.desired
    }
}

/// Aggregate per-category replica counts from `(category, desired, ready)`
pub fn workload_health<I>(workloads: I) -> Vec<WorkloadHealth>
where
    I: IntoIterator<Item = (WorkloadCategory, i32, i32)>,
{
    let mut totals: BTreeMap<WorkloadCategory, (i32, i32)> = BTreeMap::new();
    for (category, desired, ready) in workloads {
        let entry = totals.entry(category).or_default();
        entry.0 += desired;
        entry.1 += ready;
    }
    totals
        .into_iter()
        .map(|(category, (desired, ready))| WorkloadHealth {
            category,
            desired,
            ready,
        })
        .collect()
}

/// OSD and monitor quorum state
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub osds: Vec<OsdStatus>,
    pub quorum: QuorumStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "Unknown"),
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Critical => write!(f, "Critical"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
}

impl Default for HealthSummary {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            reasons: vec!["no data received yet".to_string()],
        }
    }
}

/// A message from one poller to the merger
#[derive(Clone, Debug)]
pub enum SourceUpdate {
    Node(Result<NodeInfo, String>),
    Storage(Result<StorageHealth, String>),
    Workloads(Result<Vec<WorkloadHealth>, String>),
    Daemons(Result<DaemonStatus, String>),
}

impl SourceUpdate {
    pub fn source(&self) -> &'static str {
        match self {
            SourceUpdate::Node(_) => "node",
            SourceUpdate::Storage(_) => "storage",
            SourceUpdate::Workloads(_) => "workloads",
            SourceUpdate::Daemons(_) => "daemons",
        }
    }
}

/// Everything the monitor knows at one point in time
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub node: SourceSlot<NodeInfo>,
    pub storage: SourceSlot<StorageHealth>,
    pub workloads: SourceSlot<Vec<WorkloadHealth>>,
    pub daemons: SourceSlot<DaemonStatus>,
    pub summary: HealthSummary,
    /// When the last update of any source was merged; `None` before the first
    pub updated_at: Option<DateTime<Utc>>,
}

impl MonitorSnapshot {
    /// A new snapshot with `update` applied to its source only
    pub fn with_update(&self, update: SourceUpdate, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        match update {
            SourceUpdate::Node(r) => next.node.apply(r, at),
            SourceUpdate::Storage(r) => next.storage.apply(r, at),
            SourceUpdate::Workloads(r) => next.workloads.apply(r, at),
            SourceUpdate::Daemons(r) => next.daemons.apply(r, at),
        }
        next.summary = next.summarize();
        next.updated_at = Some(at);
        next
    }

    pub fn has_data(&self) -> bool {
        self.node.value.is_some()
            || self.storage.value.is_some()
            || self.workloads.value.is_some()
            || self.daemons.value.is_some()
    }

    /// Derive the overall health from every source
    pub fn summarize(&self) -> HealthSummary {
        if !self.has_data() {
            let mut summary = HealthSummary::default();
            summary.reasons.extend(self.stale_reasons());
            return summary;
        }

        let mut status = HealthStatus::Healthy;
        let mut reasons = Vec::new();
        let mut raise = |level: HealthStatus, reason: String| {
            status = status.max(level);
            reasons.push(reason);
        };

        if let Some(node) = self.node.get() {
            if !node.ready {
                raise(HealthStatus::Critical, format!("node {} is NotReady", node.name));
            }
            if node.cordoned {
                raise(HealthStatus::Degraded, format!("node {} is cordoned", node.name));
            }
        }

        if let Some(storage) = self.storage.get() {
            let level = match storage.status {
                CephHealth::Ok => None,
                CephHealth::Warn => Some(HealthStatus::Degraded),
                CephHealth::Err => Some(HealthStatus::Critical),
                CephHealth::Unknown(_) => Some(HealthStatus::Degraded),
            };
            if let Some(level) = level {
                let codes: Vec<&str> = storage.checks.iter().map(|c| c.code.as_str()).collect();
                let reason = if codes.is_empty() {
                    format!("storage health is {}", storage.status)
                } else {
                    format!("storage health is {} ({})", storage.status, codes.join(", "))
                };
                raise(level, reason);
            }
        }

        if let Some(daemons) = self.daemons.get() {
            if !daemons.quorum.has_majority() {
                raise(
                    HealthStatus::Critical,
                    format!(
                        "monitor quorum lost: {}/{} in quorum",
                        daemons.quorum.in_quorum.len(),
                        daemons.quorum.monitors.len()
                    ),
                );
            } else {
                let out = daemons.quorum.out_of_quorum();
                if !out.is_empty() {
                    raise(
                        HealthStatus::Degraded,
                        format!("monitors out of quorum: {}", out.join(", ")),
                    );
                }
            }

            let down = daemons.osds.iter().filter(|o| !o.up).count();
            let out = daemons.osds.iter().filter(|o| !o.in_cluster).count();
            if down > 0 || out > 0 {
                raise(
                    HealthStatus::Degraded,
                    format!("{} OSD(s) down, {} OSD(s) out", down, out),
                );
            }
        }

        if let Some(workloads) = self.workloads.get() {
            for w in workloads.iter().filter(|w| w.is_degraded()) {
                raise(
                    HealthStatus::Degraded,
                    format!("{}: {}/{} replicas ready", w.category, w.ready, w.desired),
                );
            }
        }

        for reason in self.stale_reasons() {
            raise(HealthStatus::Degraded, reason);
        }

        HealthSummary { status, reasons }
    }

    fn stale_reasons(&self) -> Vec<String> {
        [
            ("node", &self.node.error),
            ("storage", &self.storage.error),
            ("workloads", &self.workloads.error),
            ("daemons", &self.daemons.error),
        ]
        .into_iter()
        .filter_map(|(source, error)| {
            error
                .as_ref()
                .map(|e| format!("{source} data is stale: {}", e.message))
        })
        .collect()
    }
}
