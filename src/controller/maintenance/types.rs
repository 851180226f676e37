//! Core data structures for node maintenance
//!
//! - [`WorkloadCategory`] - storage daemon type derived from a workload name
//! - [`ManagedWorkload`] - a deployment the maintenance phases act on
//! - [`ValidationResult`] / [`ValidationResults`] - preflight check outcomes
//! - [`ConflictWarning`] - signs of maintenance in progress on other nodes

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::config::ORIGINAL_REPLICAS_ANNOTATION;

/// Prefix common to every Rook-managed workload name
const CLUSTER_NAME_PREFIX: &str = "rook-ceph-";

/// Storage daemon type of a workload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkloadCategory {
    Osd,
    /// OSD provisioning workloads; more specific than `Osd`
    OsdPrepare,
    Mon,
    Mgr,
    Mds,
    Rgw,
    Exporter,
    CrashCollector,
    Tools,
    Operator,
    Other,
}

/// Name prefixes (after stripping `rook-ceph-`) and the category they imply
const CATEGORY_PREFIXES: &[(&str, WorkloadCategory)] = &[
    ("osd", WorkloadCategory::Osd),
    ("osd-prepare", WorkloadCategory::OsdPrepare),
    ("mon", WorkloadCategory::Mon),
    ("mgr", WorkloadCategory::Mgr),
    ("mds", WorkloadCategory::Mds),
    ("rgw", WorkloadCategory::Rgw),
    ("exporter", WorkloadCategory::Exporter),
    ("crashcollector", WorkloadCategory::CrashCollector),
    ("tools", WorkloadCategory::Tools),
    ("operator", WorkloadCategory::Operator),
];

impl WorkloadCategory {
    /// Classify a workload by name.
    ///
    /// A prefix matches when the name equals it or continues with `-`, so
    /// `mon` matches `mon-a` but not `monitoring`. When several prefixes
    /// match, the longest wins: `osd-prepare-worker-01` is [`OsdPrepare`],
    /// not [`Osd`]. The result does not depend on table order.
    ///
    /// [`OsdPrepare`]: WorkloadCategory::OsdPrepare
    /// [`Osd`]: WorkloadCategory::Osd
    pub fn classify(name: &str) -> Self {
        let base = name.strip_prefix(CLUSTER_NAME_PREFIX).unwrap_or(name);

        CATEGORY_PREFIXES
            .iter()
            .filter(|(prefix, _)| matches_prefix(base, prefix))
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
            .map(|(_, category)| *category)
            .unwrap_or(WorkloadCategory::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadCategory::Osd => "osd",
            WorkloadCategory::OsdPrepare => "osd-prepare",
            WorkloadCategory::Mon => "mon",
            WorkloadCategory::Mgr => "mgr",
            WorkloadCategory::Mds => "mds",
            WorkloadCategory::Rgw => "rgw",
            WorkloadCategory::Exporter => "exporter",
            WorkloadCategory::CrashCollector => "crashcollector",
            WorkloadCategory::Tools => "tools",
            WorkloadCategory::Operator => "operator",
            WorkloadCategory::Other => "other",
        }
    }

    /// Cluster-management workloads handled outside the per-workload steps
    pub fn is_management(&self) -> bool {
        matches!(self, WorkloadCategory::Tools | WorkloadCategory::Operator)
    }
}

impl std::fmt::Display for WorkloadCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn matches_prefix(name: &str, prefix: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('-'),
        None => false,
    }
}

/// Kind of replica controller a workload is backed by
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    #[default]
    Deployment,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
        }
    }
}

/// A workload the maintenance phases act on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedWorkload {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
    /// Node the workload is pinned to, `None` when not pinned
    pub target_node: Option<String>,
    /// Desired replicas; an unset count is reported as the API default of 1
    pub replicas: i32,
    /// Replica count recorded before a previous scale-down, if any
    pub original_replicas: Option<i32>,
    pub category: WorkloadCategory,
}

impl ManagedWorkload {
    pub fn from_deployment(deployment: &Deployment, target_node: Option<String>) -> Self {
        let name = deployment.name_any();
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let original_replicas = deployment
            .annotations()
            .get(ORIGINAL_REPLICAS_ANNOTATION)
            .and_then(|v| v.parse::<i32>().ok());

        Self {
            namespace: deployment.namespace().unwrap_or_default(),
            category: WorkloadCategory::classify(&name),
            name,
            kind: WorkloadKind::Deployment,
            target_node,
            replicas,
            original_replicas,
        }
    }

    /// `namespace/name`
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_scaled_down(&self) -> bool {
        self.replicas == 0
    }

    /// Replica count to restore after maintenance, defaulting to 1
    pub fn restore_replicas(&self) -> i32 {
        match self.original_replicas {
            Some(n) if n > 0 => n,
            _ if self.replicas > 0 => self.replicas,
            _ => 1,
        }
    }
}

/// Outcome of a single preflight check
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub check: String,
    pub passed: bool,
    pub message: String,
}

impl ValidationResult {
    pub fn pass(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            passed: false,
            message: message.into(),
        }
    }
}

/// Ordered set of preflight outcomes
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResults {
    pub results: Vec<ValidationResult>,
}

impl ValidationResults {
    pub fn new(results: Vec<ValidationResult>) -> Self {
        Self { results }
    }

    /// True iff every check passed
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn get(&self, check: &str) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.check == check)
    }

    /// One line per failed check
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|r| format!("  - {}: {}", r.check, r.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Another node that looks like it is in maintenance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherNodeMaintenance {
    pub node: String,
    pub cordoned: bool,
    /// Pinned workloads on that node already at zero replicas
    pub scaled_down: Vec<String>,
}

/// Advisory result of the conflict check
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictWarning {
    pub safety_flag_set: bool,
    pub other_nodes: Vec<OtherNodeMaintenance>,
}

impl ConflictWarning {
    pub fn has_conflicts(&self) -> bool {
        self.safety_flag_set || !self.other_nodes.is_empty()
    }

    /// Other nodes whose pinned workloads are scaled down
    pub fn nodes_with_scaled_down_workloads(&self) -> Vec<&str> {
        self.other_nodes
            .iter()
            .filter(|n| !n.scaled_down.is_empty())
            .map(|n| n.node.as_str())
            .collect()
    }

    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if self.safety_flag_set {
            lines.push("storage safety flag is already set".to_string());
        }
        for other in &self.other_nodes {
            let mut parts = Vec::new();
            if other.cordoned {
                parts.push("cordoned".to_string());
            }
            if !other.scaled_down.is_empty() {
                parts.push(format!("scaled down: {}", other.scaled_down.join(", ")));
            }
            lines.push(format!("node {} is {}", other.node, parts.join("; ")));
        }
        lines.join("\n")
    }
}

/// Group workloads by category, preserving per-category order
pub fn by_category(workloads: &[ManagedWorkload]) -> BTreeMap<WorkloadCategory, Vec<&ManagedWorkload>> {
    let mut grouped: BTreeMap<WorkloadCategory, Vec<&ManagedWorkload>> = BTreeMap::new();
    for w in workloads {
        grouped.entry(w.category).or_default().push(w);
    }
    grouped
}
