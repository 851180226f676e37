//! ceph-node-maintenance: safe node maintenance for Rook/Ceph on Kubernetes
//!
//! This crate takes a Kubernetes node out of service and brings it back
//! without disrupting the storage cluster: workloads pinned to the node are
//! scaled in dependency-safe order around the `noout` safety flag, while a
//! live monitor reports node, storage and daemon health.

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod telemetry;

pub use crate::error::{Error, Result};
