//! Core error types.

use thiserror::Error;

use crate::domain::TaskId;

#[derive(Debug, Error)]
pub enum MenderError {
    #[error("an equivalent {kind} task for '{target}' is already queued")]
    DuplicateTask { kind: String, target: String },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("invalid task transition: {task} is {from}, cannot become {to}")]
    InvalidTransition {
        task: TaskId,
        from: &'static str,
        to: &'static str,
    },

    #[error("source '{0}' is not registered")]
    SourceNotFound(String),

    #[error("no health record for source '{0}'")]
    HealthNotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

impl From<rusqlite::Error> for MenderError {
    fn from(err: rusqlite::Error) -> Self {
        MenderError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for MenderError {
    fn from(err: serde_json::Error) -> Self {
        MenderError::Persistence(format!("json: {err}"))
    }
}

/// Declared failure modes of external collaborators (fetcher, generator,
/// artifact store, runner). The repair workflow maps these onto the failure
/// taxonomy; they never panic the worker.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("target unreachable: {0}")]
    Unreachable(String),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("{0}")]
    Failed(String),
}
