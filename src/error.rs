//! Error types for node maintenance orchestration

use thiserror::Error;

/// What the operator should do after a failure is reported
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextAction {
    /// Re-run the phase from preflight with the same confirmed plan
    Retry,
    /// Review the reported items, acknowledge them and continue
    AcknowledgeAndContinue,
    /// Nothing can be done from here; exit and investigate manually
    Exit,
    /// No action needed
    None,
}

impl std::fmt::Display for NextAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextAction::Retry => write!(f, "retry"),
            NextAction::AcknowledgeAndContinue => write!(f, "acknowledge and continue"),
            NextAction::Exit => write!(f, "exit"),
            NextAction::None => write!(f, "none"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Cluster client failure that did not originate in the Kubernetes API
    #[error("Cluster client error: {0}")]
    ClusterError(String),

    /// Command executed in the storage toolbox failed
    #[error("Storage command failed: {0}")]
    CommandError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Building the maintenance plan failed before any mutation
    #[error("Discovery failed: {0}")]
    DiscoveryError(String),

    /// The plan was confirmed while a conflict warning was still unacknowledged
    #[error("Conflicting maintenance detected and not acknowledged: {0}")]
    ConflictNotAcknowledged(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Failed to parse configuration file: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}

impl Error {
    /// True when the underlying resource does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Recommended follow-up for an error surfaced to the operator
    pub fn next_action(&self) -> NextAction {
        match self {
            Error::KubeError(_)
            | Error::ClusterError(_)
            | Error::CommandError(_)
            | Error::DiscoveryError(_)
            | Error::TaskError(_) => NextAction::Retry,
            Error::ConflictNotAcknowledged(_) => NextAction::AcknowledgeAndContinue,
            Error::NotFound(_)
            | Error::ConfigError(_)
            | Error::InvalidTransition { .. }
            | Error::SerializationError(_)
            | Error::TomlError(_)
            | Error::IoError(_) => NextAction::Exit,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
