use thiserror::Error;

use crate::types::Phase;

/// Failures reported by the persistence/notification collaborator.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend returned a non-success HTTP status.
    #[error("Backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// The response was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),

    /// Realtime socket failure.
    #[error("Realtime connection failed: {0}")]
    WebSocket(String),

    /// The update stream was closed by the backend.
    #[error("Subscription closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Errors that can occur while coordinating a generation job.
///
/// Only [`Validation`](Self::Validation) and
/// [`InvalidPhase`](Self::InvalidPhase) are ever returned to the caller of
/// [`submit`](crate::RamsCoordinator::submit). Everything caused by the
/// backend or the remote worker ends up in the `Failed` phase instead.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Linked record update failed: {0}")]
    SideEffect(String),

    #[error("Cannot {operation} while {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CoordinatorError {
    /// The text shown to the user for this failure.
    ///
    /// Submission and generation failures carry the underlying message
    /// verbatim; an empty message is replaced by `fallback`.
    pub fn user_message(&self, fallback: &str) -> String {
        let msg = match self {
            CoordinatorError::Validation(m)
            | CoordinatorError::Submission(m)
            | CoordinatorError::Generation(m)
            | CoordinatorError::SideEffect(m) => m.clone(),
            other => other.to_string(),
        };
        non_empty_or(msg, fallback)
    }
}

pub(crate) fn non_empty_or(msg: String, fallback: &str) -> String {
    if msg.trim().is_empty() {
        fallback.to_string()
    } else {
        msg
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, CoordinatorError>;
