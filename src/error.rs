//! Error types for healthshare

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Validation error: {0}")]
    Validation(String),

    /// Absent or not owned. The two cases are deliberately not distinguished.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Health record not found: {0}")]
    RecordNotFound(String),

    #[error("Record {0} is not owned by the caller")]
    Ownership(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Access request already responded to: {0}")]
    AlreadyResponded(String),

    #[error("Access denied")]
    AccessDenied,

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Malformed permissions token: {0}")]
    MalformedPermissions(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HealthError {
    /// True for errors whose detail must not reach clients in production
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            HealthError::Database(_)
                | HealthError::Io(_)
                | HealthError::Internal(_)
                | HealthError::Config(_)
                | HealthError::Dependency(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HealthError>;
