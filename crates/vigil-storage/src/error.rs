/// Errors that can occur within the storage layer.
///
/// # Examples
///
/// ```rust
/// use vigil_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     entity: "incident",
///     id: "42".to_string(),
/// };
/// assert!(err.to_string().contains("incident"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure of a stored document.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored alert key could not be parsed back.
    #[error("Storage: invalid alert key: {0}")]
    Key(#[from] vigil_common::tags::KeyError),

    /// Creating the data directory failed.
    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored timestamp is out of range.
    #[error("Storage: invalid timestamp {0} in column '{1}'")]
    InvalidTimestamp(i64, &'static str),

    /// Generic storage error for cases not covered by other variants.
    #[error("Storage: {0}")]
    Other(String),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
