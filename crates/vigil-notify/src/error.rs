/// Errors that can occur within the notification subsystem.
///
/// # Examples
///
/// ```rust
/// use vigil_notify::error::NotifyError;
///
/// let err = NotifyError::InvalidConfig("missing smtp host".to_string());
/// assert!(err.to_string().contains("smtp host"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Transport configuration is missing a required field or contains an invalid value.
    #[error("Notify: invalid configuration: {0}")]
    InvalidConfig(String),

    /// An HTTP request to an external notification endpoint failed.
    #[error("Notify: HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// SMTP transport error when sending email.
    #[error("Notify: SMTP error: {0}")]
    SmtpError(String),

    #[error("Notify: JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The external endpoint returned a non-success response.
    #[error("Notify: API error from {service}: status={status}, body={body}")]
    ApiError {
        service: String,
        status: u16,
        body: String,
    },

    /// Rendering a notification template failed.
    #[error("Notify: template rendering error: {0}")]
    TemplateError(String),
}

impl From<lettre::error::Error> for NotifyError {
    fn from(e: lettre::error::Error) -> Self {
        NotifyError::SmtpError(e.to_string())
    }
}

impl From<lettre::address::AddressError> for NotifyError {
    fn from(e: lettre::address::AddressError) -> Self {
        NotifyError::InvalidConfig(format!("invalid email address: {e}"))
    }
}

impl From<lettre::transport::smtp::Error> for NotifyError {
    fn from(e: lettre::transport::smtp::Error) -> Self {
        NotifyError::SmtpError(e.to_string())
    }
}

/// Convenience `Result` alias for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
