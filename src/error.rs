//! Error types for the metrics operator

use thiserror::Error;

/// Main error type for operator operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid operator or workload configuration (bad selector, unknown gate, ...)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Spec validation failed
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A JSON patch was refused because one of its `test` operations failed
    #[error("Patch rejected: {0}")]
    PatchRejected(String),

    /// The object is gone from the cache or the cluster
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The watch of one kind stopped, its cache no longer follows the cluster
    #[error("Watch of {0} ended")]
    WatchStreamEnded(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the engine should retry the failing key with backoff.
    ///
    /// Configuration and validation errors won't fix themselves, retrying
    /// them only burns API calls.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Error::ConfigError(_) | Error::ValidationError(_))
    }

    /// Short error category used as a metric label.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::PatchRejected(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::WatchStreamEnded(_) => "watch",
        }
    }

    /// Maps the API error returned for a failed JSON patch.
    ///
    /// The API server answers 422 when a `test` operation doesn't hold.
    pub fn from_patch_error(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 422 => {
                Error::PatchRejected(resp.message.clone())
            }
            other => Error::KubeError(other),
        }
    }
}

/// Returns true for a kube API error with the given HTTP status code.
pub fn is_api_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_terminal_errors_are_not_retriable() {
        assert!(!Error::ConfigError("bad selector".into()).is_retriable());
        assert!(!Error::ValidationError("no rules".into()).is_retriable());
        assert!(Error::PatchRejected("index moved".into()).is_retriable());
        assert!(Error::KubeError(api_error(500)).is_retriable());
    }

    #[test]
    fn test_patch_error_mapping() {
        assert!(matches!(
            Error::from_patch_error(api_error(422)),
            Error::PatchRejected(_)
        ));
        assert!(matches!(
            Error::from_patch_error(api_error(409)),
            Error::KubeError(_)
        ));
    }

    #[test]
    fn test_is_api_status() {
        assert!(is_api_status(&api_error(404), 404));
        assert!(!is_api_status(&api_error(409), 404));
    }
}
