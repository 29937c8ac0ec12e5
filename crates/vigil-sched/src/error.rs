use vigil_storage::StorageError;

/// Errors surfaced by the scheduler.
///
/// Evaluation failures are normally absorbed into the health store; they
/// only appear here when an evaluator reports one or a caller asks for a
/// check directly.
///
/// # Examples
///
/// ```rust
/// use vigil_sched::error::SchedError;
///
/// let err = SchedError::UnknownAlert("cpu_high".to_string());
/// assert!(err.to_string().contains("cpu_high"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("Sched: storage error: {0}")]
    Storage(#[from] StorageError),

    /// The expression evaluator failed.
    #[error("Sched: evaluation failed: {0}")]
    Evaluation(String),

    /// An action could not be applied to the incident in its current state.
    #[error("Sched: action rejected for {key}: {reason}")]
    ActionRejected { key: String, reason: String },

    #[error("Sched: unknown alert '{0}'")]
    UnknownAlert(String),

    #[error("Sched: unknown notification '{0}'")]
    UnknownNotification(String),

    /// A silence request failed validation.
    #[error("Sched: invalid silence: {0}")]
    InvalidSilence(String),

    #[error("Sched: invalid configuration: {0}")]
    Config(String),
}

/// Convenience `Result` alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedError>;
