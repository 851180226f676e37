//! Node maintenance for pinned storage workloads.
//!
//! Takes a node out of service (cordon, set the storage safety flag, scale
//! the operator and every workload pinned to the node to zero) and brings it
//! back, in dependency-safe order, with a confirmed plan that is never
//! re-derived during execution.

pub mod conflict;
pub mod discovery;
pub mod orchestrator;
pub mod ordering;
pub mod phase;
pub mod plan;
pub mod preflight;
pub mod progress;
pub mod types;

#[cfg(test)]
mod discovery_test;
#[cfg(test)]
mod orchestrator_test;

pub use conflict::check_other_nodes_in_maintenance;
pub use discovery::{list_pinned, list_scaled_down, resolve_target_node};
pub use orchestrator::{
    CompletionSummary, ExecutionFailure, Orchestrator, PhaseExecution, PhaseOutcome,
};
pub use ordering::{order_for_down, order_for_up};
pub use phase::{DownPhase, MaintenancePhase, PhaseState, PhaseTracker, UpPhase};
pub use plan::{
    Confirmation, ConfirmedDown, ConfirmedUp, Decision, DownPlan, DownReview, OperatorSnapshot,
    RestoreTarget, UpPlan, UpReview,
};
pub use preflight::PreflightValidator;
pub use progress::{ProgressEvent, ProgressSink, StepStatus};
pub use types::{
    ConflictWarning, ManagedWorkload, ValidationResult, ValidationResults, WorkloadCategory,
    WorkloadKind,
};
