//! Error taxonomy for the launch pipeline.
//!
//! Configuration errors are raised eagerly, before any side effect;
//! fetch, provisioning, and execution errors surface the failing stage and
//! the underlying tool's diagnostic.

use skiff_env::ProvisionError;
use skiff_tracking::TrackingError;

/// Errors produced while fetching, provisioning, or running a project.
#[derive(Debug, thiserror::Error)]
pub enum SkiffError {
    /// Conflicting or missing options, unsupported combinations, invalid
    /// manifest fields. Never raised after a run record exists.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unreachable source, missing version, missing subdirectory.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Environment provisioning failure (conda / docker).
    #[error("provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Nonzero exit from the launched command, backend-reported failure,
    /// or an interrupt while waiting.
    #[error("execution error: {0}")]
    Execution(String),

    /// Tracking-service failure.
    #[error("tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for launch-pipeline operations.
pub type Result<T> = std::result::Result<T, SkiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SkiffError::Config("specify only one of experiment name or id".to_string());
        assert!(err.to_string().contains("configuration error"));

        let err = SkiffError::Fetch("could not find subdirectory sub".to_string());
        assert!(err.to_string().contains("fetch error"));

        let err = SkiffError::Execution("run r1 failed".to_string());
        assert!(err.to_string().contains("execution error"));
    }

    #[test]
    fn test_provision_error_conversion() {
        let err: SkiffError = ProvisionError::DockerNotFound.into();
        assert!(err.to_string().contains("provisioning error"));
        assert!(err.to_string().contains("docker"));
    }
}
