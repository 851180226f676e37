//! Storage-safe action ordering
//!
//! Shutdown drains object storage daemons before the monitors so the window
//! without write quorum stays short. Restoration brings monitors back first,
//! since OSDs need quorum to report their state.

use std::cmp::Ordering;

use super::types::{ManagedWorkload, WorkloadCategory};

const DOWN_ORDER: &[WorkloadCategory] = &[
    WorkloadCategory::Osd,
    WorkloadCategory::Mon,
    WorkloadCategory::Mgr,
    WorkloadCategory::Mds,
    WorkloadCategory::Rgw,
    WorkloadCategory::Exporter,
    WorkloadCategory::CrashCollector,
];

const UP_ORDER: &[WorkloadCategory] = &[
    WorkloadCategory::Mon,
    WorkloadCategory::Osd,
    WorkloadCategory::Mgr,
    WorkloadCategory::Mds,
    WorkloadCategory::Rgw,
    WorkloadCategory::Exporter,
    WorkloadCategory::CrashCollector,
];

/// Rank of a category in `order`; unranked categories sort after all ranked ones
fn rank(order: &[WorkloadCategory], category: WorkloadCategory) -> Option<usize> {
    order.iter().position(|c| *c == category)
}

fn sort_by_rank(mut workloads: Vec<ManagedWorkload>, order: &[WorkloadCategory]) -> Vec<ManagedWorkload> {
    // sort_by is stable: unranked entries keep their discovery order
    workloads.sort_by(|a, b| {
        match (rank(order, a.category), rank(order, b.category)) {
            (Some(ra), Some(rb)) => ra.cmp(&rb).then_with(|| a.name.cmp(&b.name)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    });
    workloads
}

/// Order for scale-down: `osd, mon, mgr, mds, rgw, exporter, crashcollector`,
/// then everything else
pub fn order_for_down(workloads: Vec<ManagedWorkload>) -> Vec<ManagedWorkload> {
    sort_by_rank(workloads, DOWN_ORDER)
}

/// Order for restore: `mon, osd, mgr, mds, rgw, exporter, crashcollector`,
/// then everything else
pub fn order_for_up(workloads: Vec<ManagedWorkload>) -> Vec<ManagedWorkload> {
    sort_by_rank(workloads, UP_ORDER)
}
