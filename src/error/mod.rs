use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),
}

/// Structural violations rejected at the data model boundary
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TraceError {
    #[error("Duplicate step id {step_id} in trace {trace_id}")]
    DuplicateStep { trace_id: String, step_id: String },

    #[error("Unknown parent step {parent_step_id} for step {step_id}")]
    UnknownParent {
        step_id: String,
        parent_step_id: String,
    },

    #[error("Confidence {value} for step {step_id} is outside [0.0, 1.0]")]
    InvalidConfidence { step_id: String, value: f64 },

    #[error("Trace {trace_id} is completed and can no longer be modified")]
    TraceSealed { trace_id: String },

    #[error("Invalid hierarchy in trace {trace_id}: {reason}")]
    InvalidHierarchy { trace_id: String, reason: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Invalid trace: {0}")]
    Validation(#[from] TraceError),

    #[error("Scan cancelled after {processed} rows")]
    Cancelled { processed: u64 },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for data model mutations
pub type TraceResult<T> = Result<T, TraceError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
