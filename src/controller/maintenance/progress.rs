//! Progress reporting for phase execution
//!
//! Events travel over a bounded queue. Delivery is best effort: when the
//! consumer falls behind, new events are dropped rather than stalling the
//! mutation path. Phase state is published separately on a watch channel, so
//! a dropped event never hides a state transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Status carried by a progress event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Running,
    Success,
    Skipped,
    Warning,
    Error,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Running => write!(f, "running"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Warning => write!(f, "warning"),
            StepStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Label of the phase state that emitted the event
    pub stage: &'static str,
    pub description: String,
    /// `namespace/name` of the workload the event is about, if any
    pub workload: Option<String>,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: &'static str, status: StepStatus, description: impl Into<String>) -> Self {
        Self {
            stage,
            description: description.into(),
            workload: None,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn for_workload(mut self, workload: impl Into<String>) -> Self {
        self.workload = Some(workload.into());
        self
    }
}

/// Shared count of events dropped because the queue was full
#[derive(Clone, Debug, Default)]
pub struct DroppedEvents(Arc<AtomicU64>);

impl DroppedEvents {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sending half of the progress queue
#[derive(Clone, Debug)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
    dropped: DroppedEvents,
}

impl ProgressSink {
    /// Create a sink and its receiver with room for `capacity` events
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: DroppedEvents::default(),
            },
            rx,
        )
    }

    /// Queue an event without waiting. Returns `false` if it was dropped.
    pub fn emit(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.increment();
                debug!(
                    "Progress queue full, dropped event for {}: {}",
                    event.stage, event.description
                );
                false
            }
            // Nobody is listening any more; execution carries on regardless
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Number of events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }

    /// Handle on the drop counter that outlives the sink
    pub fn dropped_counter(&self) -> DroppedEvents {
        self.dropped.clone()
    }
}
