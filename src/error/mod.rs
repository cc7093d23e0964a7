use thiserror::Error;

use crate::api::error_handling::ApiFailure;

#[derive(Debug, Clone, Error)]
pub enum GovernorError {
    /// Submission or control call named a service that was never registered
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// A config or config merge failed validation
    #[error("Invalid config for {service}: {reason}")]
    InvalidConfig { service: String, reason: String },

    /// The operation failed for good; carries the original failure untouched
    #[error("{0}")]
    Operation(ApiFailure),

    /// Request was still queued when its service was reset
    #[error("Request {id} on {service} was cancelled by reset")]
    Cancelled { service: String, id: String },

    /// The governor went away before the request settled
    #[error("Request {id} on {service} was abandoned: governor closed")]
    Closed { service: String, id: String },

    /// The operation panicked while running
    #[error("Request {id} on {service} panicked: {message}")]
    Panicked {
        service: String,
        id: String,
        message: String,
    },

    #[error("No tokio runtime available to schedule {service}")]
    NoRuntime { service: String },

    /// Settings file or environment could not be loaded
    #[error("Settings Error: {0}")]
    Settings(String),
}

impl From<ApiFailure> for GovernorError {
    fn from(failure: ApiFailure) -> Self {
        GovernorError::Operation(failure)
    }
}

impl From<serde_json::Error> for GovernorError {
    fn from(err: serde_json::Error) -> Self {
        GovernorError::Settings(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for GovernorError {
    fn from(err: std::io::Error) -> Self {
        GovernorError::Settings(format!("IO error: {}", err))
    }
}

impl GovernorError {
    /// The operation's own failure, if this error came from running it
    pub fn failure(&self) -> Option<&ApiFailure> {
        match self {
            GovernorError::Operation(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn into_failure(self) -> Option<ApiFailure> {
        match self {
            GovernorError::Operation(failure) => Some(failure),
            _ => None,
        }
    }

    /// True when the request never reached its operation (or was cut off before settling)
    pub fn is_abandoned(&self) -> bool {
        matches!(
            self,
            GovernorError::Cancelled { .. } | GovernorError::Closed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GovernorError>;
