//! Provider error types.

use cloudrig_workflow::StepError;
use thiserror::Error;

/// Errors that can occur when talking to the resource provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The provider answered with an unexpected status.
    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The resource does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The provider answer could not be decoded.
    #[error("JSON error: {0}")]
    Json(String),

    /// A remote command ran but exited non-zero.
    #[error("Command failed with exit code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Json(e.to_string())
    }
}

impl From<ProviderError> for StepError {
    fn from(e: ProviderError) -> Self {
        StepError::Collaborator(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_becomes_collaborator_error() {
        let err: StepError = ProviderError::Status {
            status: 503,
            body: "throttled".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Collaborator error: Provider returned 503: throttled");
        assert_eq!(err.code(), "collaborator");
    }
}
