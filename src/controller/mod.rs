//! Maintenance orchestration and the live cluster monitor

pub mod maintenance;
pub mod monitor;

pub use maintenance::{
    DownPhase, MaintenancePhase, Orchestrator, PhaseExecution, PhaseOutcome, UpPhase,
};
pub use monitor::{ClusterMonitor, HealthStatus, MonitorSnapshot};
