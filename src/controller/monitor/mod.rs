//! Live cluster monitor shown alongside maintenance runs

pub mod poller;
pub mod snapshot;

pub use poller::ClusterMonitor;
pub use snapshot::{
    DaemonStatus, HealthStatus, HealthSummary, MonitorSnapshot, SourceError, SourceSlot,
    SourceUpdate, WorkloadHealth,
};
