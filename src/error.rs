use thiserror::Error;

/// Main error type for Factgraph
#[derive(Error, Debug)]
pub enum FactgraphError {
    /// Caller omitted or forged tenant scoping. Never retried.
    #[error("Tenant mismatch: {0}")]
    TenantMismatch(String),

    /// Transient infrastructure failure (store, index, queue)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Extraction adapter error or malformed adapter output
    #[error("Extraction failure: {0}")]
    Extraction(String),

    /// Embedding provider errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode errors (properties, task payloads)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An operation exceeded its time budget
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl FactgraphError {
    /// Whether a failed update attempt may be redelivered.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FactgraphError::TenantMismatch(_)
                | FactgraphError::InvalidInput(_)
                | FactgraphError::Config(_)
        )
    }

    /// Transient store/index failures.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            FactgraphError::StoreUnavailable(_) | FactgraphError::Database(_)
        )
    }
}

/// Convenient Result type using FactgraphError
pub type Result<T> = std::result::Result<T, FactgraphError>;
