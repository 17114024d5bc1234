//! Error taxonomy for the job engine.
//!
//! Every failure a client can observe falls into one of six classes.
//! Validation and launch errors flow back synchronously; monitor-time
//! failures surface only through the job record's terminal state; cleanup
//! errors are logged and carried as warnings.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request: empty command, bad schedule, NUL bytes, an IP
    /// outside its CIDR. Returned before any side effect.
    #[error("{message}")]
    Validation {
        message: String,
        /// Request field the message refers to, when one can be named.
        field: Option<String>,
    },

    /// Cgroup, workspace, CPU-affinity or IP-allocation setup failed.
    /// The caller has already rolled back whatever it created.
    #[error("resource setup failed: {0}")]
    ResourceSetup(String),

    /// Process start, upload phase, or in-namespace network setup failed.
    /// The job is marked Failed and full cleanup has run.
    #[error("launch failed: {0}")]
    Launch(String),

    /// Runtime installation failed; nothing was published.
    #[error("runtime install failed: {0}")]
    RuntimeInstall(String),

    /// The requested runtime does not exist in the registry. The installer
    /// never falls back to another source.
    #[error("runtime {spec:?} not found in registry")]
    NotInRegistry { spec: String },

    /// Best-effort teardown hit a step that could not be completed. The
    /// only non-retryable case is a process surviving SIGKILL.
    #[error("cleanup: {0}")]
    Cleanup(String),

    /// Lookup misses: unknown job, network, or runtime.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The operation is not legal in the job's current state, e.g.
    /// stopping a completed job or deleting a running one.
    #[error("{0}")]
    InvalidState(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Stable machine-readable code for the client error mapping.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::ResourceSetup(_) => "resource_setup",
            Error::Launch(_) => "launch",
            Error::RuntimeInstall(_) => "runtime_install",
            Error::NotInRegistry { .. } => "registry_miss",
            Error::Cleanup(_) => "cleanup",
            Error::NotFound { .. } => "not_found",
            Error::InvalidState(_) => "invalid_state",
        }
    }

    /// The offending request field, for validation errors that name one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}
