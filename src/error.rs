//! Error types shared across the operator

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("function {0} not found")]
    FunctionNotFound(String),

    #[error("function {0} has no ready replicas")]
    NoReadyReplicas(String),

    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("metrics query failed: {0}")]
    MetricsQuery(String),

    #[error("cache sync failed: {0}")]
    CacheSync(String),
}

impl Error {
    /// Whether retrying the failed operation can reasonably succeed.
    ///
    /// Drives the reconciler's backoff policy: retriable errors are requeued
    /// with exponential backoff, everything else fails the key immediately.
    pub fn is_retriable(&self) -> bool {
        match self {
            // Rate limiting, server faults and write races resolve themselves
            Error::KubeError(kube::Error::Api(e)) => {
                e.code == 409 || e.code == 429 || e.code >= 500
            }
            // Non-API kube errors are transport-level (connection reset, TLS)
            Error::KubeError(_) => true,
            Error::HttpError(_) => true,
            Error::Conflict(_) => true,
            Error::MetricsQuery(_) => true,
            Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::SerializationError(_)
            | Error::FunctionNotFound(_)
            | Error::NoReadyReplicas(_)
            | Error::CacheSync(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_server_faults_are_retriable() {
        assert!(api_error(500).is_retriable());
        assert!(api_error(503).is_retriable());
        assert!(api_error(429).is_retriable());
        assert!(api_error(409).is_retriable());
    }

    #[test]
    fn test_client_faults_are_not_retriable() {
        assert!(!api_error(404).is_retriable());
        assert!(!api_error(400).is_retriable());
        assert!(!api_error(403).is_retriable());
    }

    #[test]
    fn test_validation_is_not_retriable() {
        let err = Error::ValidationError("image is required".to_string());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_conflict_is_retriable() {
        assert!(Error::Conflict("functions/figlet".to_string()).is_retriable());
    }

    #[test]
    fn test_lookup_outcomes_are_not_retriable() {
        assert!(!Error::FunctionNotFound("figlet.default".to_string()).is_retriable());
        assert!(!Error::NoReadyReplicas("figlet.default".to_string()).is_retriable());
    }
}
