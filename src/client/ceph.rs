//! Typed views of `ceph ... --format json` output
//!
//! Only the fields the maintenance engine and monitor need are deserialized;
//! everything else in the payloads is ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Overall storage cluster health as reported by `ceph status`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CephHealth {
    Ok,
    Warn,
    Err,
    Unknown(String),
}

impl CephHealth {
    pub fn parse(status: &str) -> Self {
        match status {
            "HEALTH_OK" => CephHealth::Ok,
            "HEALTH_WARN" => CephHealth::Warn,
            "HEALTH_ERR" => CephHealth::Err,
            other => CephHealth::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for CephHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CephHealth::Ok => write!(f, "HEALTH_OK"),
            CephHealth::Warn => write!(f, "HEALTH_WARN"),
            CephHealth::Err => write!(f, "HEALTH_ERR"),
            CephHealth::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// One active health check, e.g. `OSDMAP_FLAGS`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub code: String,
    pub severity: CephHealth,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageHealth {
    pub status: CephHealth,
    pub checks: Vec<HealthCheck>,
}

/// Monitor quorum membership
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumStatus {
    /// Monitors currently in quorum
    pub in_quorum: Vec<String>,
    /// Every monitor in the monmap
    pub monitors: Vec<String>,
}

impl QuorumStatus {
    /// Strict majority of the monmap is in quorum
    pub fn has_majority(&self) -> bool {
        !self.monitors.is_empty() && self.in_quorum.len() * 2 > self.monitors.len()
    }

    pub fn out_of_quorum(&self) -> Vec<String> {
        self.monitors
            .iter()
            .filter(|m| !self.in_quorum.contains(m))
            .cloned()
            .collect()
    }
}

/// Up/in state of a single OSD
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsdStatus {
    pub id: u32,
    pub up: bool,
    pub in_cluster: bool,
}

#[derive(Deserialize)]
struct RawStatus {
    health: RawHealth,
}

#[derive(Deserialize)]
struct RawHealth {
    status: String,
    #[serde(default)]
    checks: BTreeMap<String, RawCheck>,
}

#[derive(Deserialize)]
struct RawCheck {
    severity: String,
    #[serde(default)]
    summary: RawCheckSummary,
}

#[derive(Default, Deserialize)]
struct RawCheckSummary {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct RawQuorum {
    #[serde(default)]
    quorum_names: Vec<String>,
    monmap: RawMonMap,
}

#[derive(Deserialize)]
struct RawMonMap {
    #[serde(default)]
    mons: Vec<RawMon>,
}

#[derive(Deserialize)]
struct RawMon {
    name: String,
}

#[derive(Deserialize)]
struct RawOsdDump {
    #[serde(default)]
    flags: String,
    #[serde(default)]
    osds: Vec<RawOsd>,
}

#[derive(Deserialize)]
struct RawOsd {
    osd: u32,
    up: u8,
    #[serde(rename = "in")]
    in_: u8,
}

/// Parse `ceph status --format json`
pub fn parse_status(json: &str) -> Result<StorageHealth> {
    let raw: RawStatus = serde_json::from_str(json)?;
    let checks = raw
        .health
        .checks
        .into_iter()
        .map(|(code, check)| HealthCheck {
            code,
            severity: CephHealth::parse(&check.severity),
            message: check.summary.message,
        })
        .collect();

    Ok(StorageHealth {
        status: CephHealth::parse(&raw.health.status),
        checks,
    })
}

/// Parse `ceph quorum_status --format json`
pub fn parse_quorum_status(json: &str) -> Result<QuorumStatus> {
    let raw: RawQuorum = serde_json::from_str(json)?;
    Ok(QuorumStatus {
        in_quorum: raw.quorum_names,
        monitors: raw.monmap.mons.into_iter().map(|m| m.name).collect(),
    })
}

/// Parse `ceph osd dump --format json` into per-OSD up/in state
pub fn parse_osd_status(json: &str) -> Result<Vec<OsdStatus>> {
    let raw: RawOsdDump = serde_json::from_str(json)?;
    Ok(raw
        .osds
        .into_iter()
        .map(|o| OsdStatus {
            id: o.osd,
            up: o.up == 1,
            in_cluster: o.in_ == 1,
        })
        .collect())
}

/// Whether `flag` appears in the comma-separated `flags` of `ceph osd dump`
pub fn osd_flag_set(json: &str, flag: &str) -> Result<bool> {
    let raw: RawOsdDump = serde_json::from_str(json)?;
    Ok(raw.flags.split(',').any(|f| f.trim() == flag))
}
