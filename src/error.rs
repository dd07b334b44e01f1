//! Error types for kbflow

use thiserror::Error;

use crate::catalog::RepositoryStatus;

/// Core error type for engine and catalog operations
#[derive(Error, Debug)]
pub enum FlowError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Execution not found
    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: uuid::Uuid },

    /// Repository not found in the catalog
    #[error("Repository not found: {id}")]
    RepositoryNotFound { id: String },

    /// A live repository record already exists under this id
    #[error("Repository already exists: {id} ({status})")]
    RepositoryExists { id: String, status: RepositoryStatus },

    /// Conditional status update rejected
    #[error("Invalid status transition for {id}: {from} -> {to}")]
    StatusConflict {
        id: String,
        from: RepositoryStatus,
        to: RepositoryStatus,
    },

    /// Workflow input rejected before an execution was created
    #[error("Invalid workflow input: {0}")]
    InvalidInput(String),

    /// Unknown workflow kind
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Whether the catalog rejected a conditional write
    pub fn is_conditional_failure(&self) -> bool {
        matches!(
            self,
            Self::RepositoryExists { .. } | Self::StatusConflict { .. }
        )
    }
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Not found")]
    NotFound,

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                // SQLITE_CONSTRAINT and its extended codes
                if code == "19" || code.starts_with("2067") || code.starts_with("1555") {
                    Self::Constraint(db_err.message().to_string())
                } else {
                    Self::Query(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => Self::Connection("Pool timeout".to_string()),
            sqlx::Error::Io(e) => Self::Connection(e.to_string()),
            _ => Self::Query(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for FlowError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Result type alias for kbflow operations
pub type Result<T> = std::result::Result<T, FlowError>;
