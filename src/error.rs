use thiserror::Error;

/// Main error type for the rebalance coordination engine
#[derive(Error, Debug)]
pub enum RebalanceError {
    // Constraint errors (bad or over-limit configuration, not retryable without user change)
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Malformed action payloads
    #[error("Validation failed: {0}")]
    Validation(String),

    // Action not legal for the request's current status
    #[error("Invalid state: {action} not allowed while {status}")]
    InvalidState { action: String, status: String },

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    // External worker failures (analysis or opportunity worker, retryable)
    #[error("External worker error: {0}")]
    ExternalWorker(String),

    // Decision Finalizer failed (retryable via retry-rebalance)
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    // Request was already canceled; callers must not treat this as retryable
    #[error("Request canceled: {0}")]
    Canceled(String),

    // Ambient errors
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for RebalanceError
pub type Result<T> = std::result::Result<T, RebalanceError>;

impl RebalanceError {
    /// True for failures worth re-running via retry-rebalance
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RebalanceError::ExternalWorker(_) | RebalanceError::Synthesis(_)
        )
    }
}
