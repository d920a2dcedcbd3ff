//! State subsystem error types

use thiserror::Error;

/// Errors raised while loading, mutating, applying or committing state
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Invalid state document: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Node name collision: {0}")]
    NamingCollision(String),

    #[error("Provisioning failed, state left unchanged: {0}")]
    ApplyFailure(String),

    #[error(
        "Infrastructure change for '{target}' was applied but the state could not be saved: {reason}. \
         The stored state no longer describes the real infrastructure; manual reconciliation is required"
    )]
    PersistFailure { target: String, reason: String },

    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    #[error("Invalid target name: {0}")]
    InvalidTarget(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Object store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{error} (additionally, releasing the state lock failed: {cleanup})")]
    Cleanup {
        error: Box<StateError>,
        cleanup: Box<StateError>,
    },
}

impl StateError {
    /// The error of the operation itself, without cleanup failures
    pub fn primary(&self) -> &StateError {
        match self {
            StateError::Cleanup { error, .. } => error.primary(),
            other => other,
        }
    }

    /// Whether this error means the target has no stored state yet
    pub fn is_not_found(&self) -> bool {
        matches!(self.primary(), StateError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
