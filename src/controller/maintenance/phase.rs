//! Phase state machines for taking a node down and bringing it back up
//!
//! Both phases are linear. The only backward edges are `Error -> PreFlight`
//! and `Cancelled -> PreFlight`, used for retry with the already-confirmed
//! plan.

use serde::{Deserialize, Serialize};

use crate::error;

/// Common behaviour of the per-phase state enums
pub trait PhaseState: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    const COMPLETE: Self;
    const CANCELLED: Self;
    const ERROR: Self;

    fn label(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn can_transition_to(&self, next: Self) -> bool;

    /// No further transitions are possible
    fn is_terminal(&self) -> bool;
}

/// States of the down phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownPhase {
    Init,
    Confirm,
    NothingToDo,
    Declined,
    PreFlight,
    Cordoning,
    SettingSafetyFlag,
    ScalingOperator,
    DiscoveringWorkloads,
    ScalingWorkloads,
    Complete,
    Cancelled,
    Error,
}

impl PhaseState for DownPhase {
    const COMPLETE: Self = DownPhase::Complete;
    const CANCELLED: Self = DownPhase::Cancelled;
    const ERROR: Self = DownPhase::Error;

    fn label(&self) -> &'static str {
        match self {
            DownPhase::Init => "Init",
            DownPhase::Confirm => "Confirm",
            DownPhase::NothingToDo => "NothingToDo",
            DownPhase::Declined => "Declined",
            DownPhase::PreFlight => "PreFlight",
            DownPhase::Cordoning => "Cordoning",
            DownPhase::SettingSafetyFlag => "SettingSafetyFlag",
            DownPhase::ScalingOperator => "ScalingOperator",
            DownPhase::DiscoveringWorkloads => "DiscoveringWorkloads",
            DownPhase::ScalingWorkloads => "ScalingWorkloads",
            DownPhase::Complete => "Complete",
            DownPhase::Cancelled => "Cancelled",
            DownPhase::Error => "Error",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            DownPhase::Init => "Discovering pinned workloads and checking for conflicts",
            DownPhase::Confirm => "Waiting for the operator to confirm the plan",
            DownPhase::NothingToDo => "Node is already fully in maintenance",
            DownPhase::Declined => "Plan declined, nothing was changed",
            DownPhase::PreFlight => "Validating cluster, node and permissions",
            DownPhase::Cordoning => "Marking the node unschedulable",
            DownPhase::SettingSafetyFlag => "Setting the storage safety flag",
            DownPhase::ScalingOperator => "Scaling down the storage operator",
            DownPhase::DiscoveringWorkloads => "Confirming the planned workloads",
            DownPhase::ScalingWorkloads => "Scaling pinned workloads to zero",
            DownPhase::Complete => "Node is ready for maintenance",
            DownPhase::Cancelled => "Cancelled; completed steps were left in place",
            DownPhase::Error => "A step failed; completed steps were left in place",
        }
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use DownPhase::*;
        match (*self, next) {
            (Init, Confirm | NothingToDo | Error) => true,
            (Confirm, PreFlight | Declined) => true,
            (PreFlight, Cordoning) => true,
            (Cordoning, SettingSafetyFlag) => true,
            (SettingSafetyFlag, ScalingOperator) => true,
            (ScalingOperator, DiscoveringWorkloads) => true,
            (DiscoveringWorkloads, ScalingWorkloads) => true,
            (ScalingWorkloads, Complete) => true,
            (
                PreFlight | Cordoning | SettingSafetyFlag | ScalingOperator | DiscoveringWorkloads
                | ScalingWorkloads,
                Error | Cancelled,
            ) => true,
            (Error | Cancelled, PreFlight) => true,
            _ => false,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownPhase::NothingToDo | DownPhase::Declined | DownPhase::Complete
        )
    }
}

/// States of the up phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpPhase {
    Init,
    Confirm,
    Declined,
    PreFlight,
    Uncordoning,
    RestoringWorkloads,
    ScalingOperator,
    UnsettingSafetyFlag,
    Complete,
    Cancelled,
    Error,
}

impl PhaseState for UpPhase {
    const COMPLETE: Self = UpPhase::Complete;
    const CANCELLED: Self = UpPhase::Cancelled;
    const ERROR: Self = UpPhase::Error;

    fn label(&self) -> &'static str {
        match self {
            UpPhase::Init => "Init",
            UpPhase::Confirm => "Confirm",
            UpPhase::Declined => "Declined",
            UpPhase::PreFlight => "PreFlight",
            UpPhase::Uncordoning => "Uncordoning",
            UpPhase::RestoringWorkloads => "RestoringWorkloads",
            UpPhase::ScalingOperator => "ScalingOperator",
            UpPhase::UnsettingSafetyFlag => "UnsettingSafetyFlag",
            UpPhase::Complete => "Complete",
            UpPhase::Cancelled => "Cancelled",
            UpPhase::Error => "Error",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            UpPhase::Init => "Discovering scaled-down workloads for the node",
            UpPhase::Confirm => "Waiting for the operator to confirm the plan",
            UpPhase::Declined => "Plan declined, nothing was changed",
            UpPhase::PreFlight => "Validating cluster, node, permissions and planned workloads",
            UpPhase::Uncordoning => "Marking the node schedulable",
            UpPhase::RestoringWorkloads => "Restoring pinned workloads",
            UpPhase::ScalingOperator => "Scaling the storage operator back up",
            UpPhase::UnsettingSafetyFlag => "Unsetting the storage safety flag",
            UpPhase::Complete => "Node is back in service",
            UpPhase::Cancelled => "Cancelled; completed steps were left in place",
            UpPhase::Error => "A step failed; completed steps were left in place",
        }
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use UpPhase::*;
        match (*self, next) {
            (Init, Confirm | Error) => true,
            (Confirm, PreFlight | Declined) => true,
            (PreFlight, Uncordoning) => true,
            (Uncordoning, RestoringWorkloads) => true,
            (RestoringWorkloads, ScalingOperator) => true,
            (ScalingOperator, UnsettingSafetyFlag) => true,
            (UnsettingSafetyFlag, Complete) => true,
            (
                PreFlight | Uncordoning | RestoringWorkloads | ScalingOperator
                | UnsettingSafetyFlag,
                Error | Cancelled,
            ) => true,
            (Error | Cancelled, PreFlight) => true,
            _ => false,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, UpPhase::Declined | UpPhase::Complete)
    }
}

/// Either phase, the single dispatch point for code that reports whichever
/// phase is running
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenancePhase {
    Down(DownPhase),
    Up(UpPhase),
}

impl MaintenancePhase {
    /// `down` or `up`
    pub fn direction(&self) -> &'static str {
        match self {
            MaintenancePhase::Down(_) => "down",
            MaintenancePhase::Up(_) => "up",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MaintenancePhase::Down(s) => s.label(),
            MaintenancePhase::Up(s) => s.label(),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            MaintenancePhase::Down(s) => s.description(),
            MaintenancePhase::Up(s) => s.description(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            MaintenancePhase::Down(s) => s.is_terminal(),
            MaintenancePhase::Up(s) => s.is_terminal(),
        }
    }

    /// Halted in `Error` or `Cancelled`; retry re-enters at preflight
    pub fn is_halted(&self) -> bool {
        match self {
            MaintenancePhase::Down(s) => matches!(s, DownPhase::Error | DownPhase::Cancelled),
            MaintenancePhase::Up(s) => matches!(s, UpPhase::Error | UpPhase::Cancelled),
        }
    }
}

impl std::fmt::Display for MaintenancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.direction(), self.label())
    }
}

impl From<DownPhase> for MaintenancePhase {
    fn from(state: DownPhase) -> Self {
        MaintenancePhase::Down(state)
    }
}

impl From<UpPhase> for MaintenancePhase {
    fn from(state: UpPhase) -> Self {
        MaintenancePhase::Up(state)
    }
}

/// Tracks the current state of one phase and rejects invalid transitions
#[derive(Clone, Debug)]
pub struct PhaseTracker<S: PhaseState> {
    current: S,
    history: Vec<S>,
}

impl<S: PhaseState> PhaseTracker<S> {
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            history: vec![initial],
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[S] {
        &self.history
    }

    pub fn transition(&mut self, next: S) -> error::Result<()> {
        if !self.current.can_transition_to(next) {
            return Err(error::Error::InvalidTransition {
                from: self.current.label(),
                to: next.label(),
            });
        }
        self.current = next;
        self.history.push(next);
        Ok(())
    }
}
