//! Error types for environment provisioning.

use thiserror::Error;

use crate::conda::CONDA_HOME_ENV_VAR;

/// Errors that can occur while provisioning an execution environment.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Conda executable not found.
    #[error(
        "could not find conda executable at {path}. Ensure conda is installed, \
         or point the {CONDA_HOME_ENV_VAR} environment variable at a conda installation root"
    )]
    CondaNotFound { path: String },

    /// Conda command execution failed.
    #[error("conda command failed: {0}")]
    CondaCommandFailed(String),

    /// Docker executable not found.
    #[error(
        "could not find docker executable. Ensure docker is installed and on PATH \
         as per https://docs.docker.com/engine/install/"
    )]
    DockerNotFound,

    /// Docker command execution failed.
    #[error("docker command failed: {0}")]
    DockerCommandFailed(String),

    /// Environment spec file could not be read.
    #[error("could not read environment spec {path}: {source}")]
    SpecUnreadable {
        path: String,
        source: std::io::Error,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error (conda registry listings).
    #[error("json parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
