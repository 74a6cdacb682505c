//! Run-record entities and the tracking-service contract.
//!
//! Durable run state lives entirely in an external tracking service; this
//! crate defines the entities (`RunRecord`, `RunStatus`), the async
//! [`TrackingClient`] contract, a REST implementation, and an in-memory fake
//! for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod fakes;
pub mod rest;

pub use rest::RestTracking;

/// Environment variable carrying the run id into a launched child process,
/// so nested invocations can attach to the same record.
pub const RUN_ID_ENV_VAR: &str = "SKIFF_RUN_ID";

/// Environment variable carrying the tracking service endpoint.
pub const TRACKING_URI_ENV_VAR: &str = "SKIFF_TRACKING_URI";

/// Environment variable carrying the experiment id.
pub const EXPERIMENT_ID_ENV_VAR: &str = "SKIFF_EXPERIMENT_ID";

/// Well-known provenance tag keys set on run records.
pub mod tags {
    pub const USER: &str = "skiff.user";
    pub const SOURCE_URI: &str = "skiff.source.uri";
    pub const ENTRY_POINT: &str = "skiff.project.entry_point";
    pub const PARENT_RUN_ID: &str = "skiff.parent_run_id";
    pub const PROJECT_ENV: &str = "skiff.project.env";
    pub const GIT_COMMIT: &str = "skiff.source.git.commit";
    pub const GIT_BRANCH: &str = "skiff.source.git.branch";
    pub const GIT_REPO_URL: &str = "skiff.source.git.repo_url";
    pub const DOCKER_IMAGE_NAME: &str = "skiff.docker.image.name";
    pub const DOCKER_IMAGE_ID: &str = "skiff.docker.image.id";
}

/// Status of a run. Terminality is one-way: once a run reaches `Finished`
/// or `Failed` it never leaves that state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    /// Whether this status is terminal (absorbing).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Finished => write!(f, "FINISHED"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// The tracking service's representation of one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    /// Opaque run id assigned by the tracking service.
    pub run_id: String,

    /// Experiment the run belongs to.
    pub experiment_id: String,

    /// Current status.
    pub status: RunStatus,

    /// When the run record was created.
    pub started_at: DateTime<Utc>,

    /// Append-only provenance tags.
    pub tags: BTreeMap<String, String>,

    /// Logged parameters.
    pub params: BTreeMap<String, String>,
}

/// Errors produced by tracking-service operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("tracking service error: {0}")]
    Service(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for TrackingError {
    fn from(err: reqwest::Error) -> Self {
        TrackingError::Http(err.to_string())
    }
}

/// Result type for tracking operations.
pub type Result<T> = std::result::Result<T, TrackingError>;

/// Contract with the external experiment-tracking service.
///
/// Tags are append-only: `set_tag` adds keys but implementations never
/// remove existing ones. Status moves monotonically toward a terminal value;
/// `set_terminated` on an already-terminal run is rejected by the service.
#[async_trait]
pub trait TrackingClient: Send + Sync {
    /// Create a new run under `experiment_id` with initial provenance tags.
    async fn create_run(
        &self,
        experiment_id: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<RunRecord>;

    /// Fetch the current state of a run.
    async fn get_run(&self, run_id: &str) -> Result<RunRecord>;

    /// Add a provenance tag to a run.
    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Log a parameter value for a run.
    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Move a run to a terminal status.
    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Resolve an experiment name to its id.
    async fn experiment_id_by_name(&self, name: &str) -> Result<String>;
}
