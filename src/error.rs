use thiserror::Error;

use crate::workflow::types::WorkflowState;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workflow for issue #{0} is already in progress")]
    DuplicateWorkflow(u64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state transition for issue #{issue}: {from} -> {to}")]
    InvalidTransition {
        issue: u64,
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
