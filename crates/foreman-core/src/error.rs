use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForemanError {
    // Routing errors
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Workflow type not found: {0}")]
    WorkflowNotFound(String),

    // Dispatch errors
    #[error("Dispatch capacity exceeded ({limit} concurrent)")]
    CapacityExceeded { limit: usize },

    // Workflow errors
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Workflow stuck: no ready steps, {remaining} of {total} steps incomplete")]
    StuckWorkflow { remaining: usize, total: usize },

    #[error("Workflow cancelled")]
    Cancelled,

    // Approval errors
    #[error("Approval rejected for step '{step}' by {approver}")]
    ApprovalRejected { step: String, approver: String },

    #[error("Approval timed out for step '{step}'")]
    ApprovalTimeout { step: String },

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    // Context errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ForemanError>;
