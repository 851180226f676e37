//! Configuration for maintenance runs and the cluster monitor
//!
//! Every field has a default matching a stock Rook/Ceph installation, so the
//! TOML file is optional. Command-line flags override values loaded from it.
//!
//! ```toml
//! [maintenance]
//! namespace = "rook-ceph"
//! workload_prefixes = ["rook-ceph-osd", "rook-ceph-mon"]
//!
//! [monitor]
//! storage_interval_secs = 15
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Label key the scheduler uses for node hostnames
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Annotation holding a deployment's replica count from before maintenance
pub const ORIGINAL_REPLICAS_ANNOTATION: &str = "ceph-maint.io/original-replicas";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub maintenance: MaintenanceConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.maintenance.validate()?;
        Ok(config)
    }
}

/// Settings for discovery and the maintenance phases
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Namespace holding the storage cluster workloads
    pub namespace: String,
    pub operator_namespace: String,
    pub operator_deployment: String,
    /// Administrative toolbox used to run storage commands
    pub toolbox_deployment: String,
    /// Label selector matching the toolbox pods
    pub toolbox_selector: String,
    /// Only pinned deployments whose name starts with one of these are managed.
    /// Empty manages every pinned deployment.
    pub workload_prefixes: Vec<String>,
    /// Cluster-wide flag that suppresses data rebalancing
    pub safety_flag: String,
    /// Capacity of the progress event queue
    pub progress_buffer: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            namespace: "rook-ceph".to_string(),
            operator_namespace: "rook-ceph".to_string(),
            operator_deployment: "rook-ceph-operator".to_string(),
            toolbox_deployment: "rook-ceph-tools".to_string(),
            toolbox_selector: "app=rook-ceph-tools".to_string(),
            workload_prefixes: Vec::new(),
            safety_flag: "noout".to_string(),
            progress_buffer: 64,
        }
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(crate::Error::ConfigError(
                "maintenance.namespace must not be empty".to_string(),
            ));
        }
        if self.operator_namespace.is_empty() || self.operator_deployment.is_empty() {
            return Err(crate::Error::ConfigError(
                "operator namespace and deployment must not be empty".to_string(),
            ));
        }
        if self.safety_flag.is_empty() {
            return Err(crate::Error::ConfigError(
                "maintenance.safety_flag must not be empty".to_string(),
            ));
        }
        if self.progress_buffer == 0 {
            return Err(crate::Error::ConfigError(
                "maintenance.progress_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Poll intervals for each monitor source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub node_interval_secs: u64,
    pub storage_interval_secs: u64,
    pub workload_interval_secs: u64,
    pub daemon_interval_secs: u64,
    /// Capacity of the queue between pollers and the snapshot merger
    pub update_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            node_interval_secs: 5,
            storage_interval_secs: 10,
            workload_interval_secs: 5,
            daemon_interval_secs: 10,
            update_buffer: 32,
        }
    }
}

impl MonitorConfig {
    pub fn node_interval(&self) -> Duration {
        secs(self.node_interval_secs)
    }

    pub fn storage_interval(&self) -> Duration {
        secs(self.storage_interval_secs)
    }

    pub fn workload_interval(&self) -> Duration {
        secs(self.workload_interval_secs)
    }

    pub fn daemon_interval(&self) -> Duration {
        secs(self.daemon_interval_secs)
    }
}

// tokio intervals panic on a zero period
fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}
