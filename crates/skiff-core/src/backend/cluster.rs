//! Cluster backend: submit a composed command to a remote scheduler.
//!
//! The scheduler itself sits behind the [`ClusterClient`] trait; the
//! handle here only drives the submit / poll / cancel protocol. Cluster
//! submissions cannot carry a docker environment, since the image is built
//! on the launching machine and would not be visible to the scheduler.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_env::EnvironmentSpec;
use tracing::{debug, info};

use crate::backend::RunHandle;
use crate::error::{Result, SkiffError};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Scheduler-side status of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Everything a scheduler needs to run one launch.
#[derive(Debug, Clone, Serialize)]
pub struct JobSpec {
    pub run_id: String,
    pub command: String,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,

    /// Backend-specific configuration forwarded verbatim.
    pub config: serde_json::Value,
}

/// Client for a remote job scheduler.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submit a job, returning the scheduler's job id.
    async fn submit_job(&self, spec: &JobSpec) -> Result<String>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatus>;

    async fn cancel_job(&self, job_id: &str) -> Result<()>;
}

/// Reject submissions the scheduler cannot execute. Raised before any run
/// record is created.
pub fn validate_submission(env: &EnvironmentSpec) -> Result<()> {
    if let EnvironmentSpec::Docker { .. } = env {
        return Err(SkiffError::Config(
            "docker environments are not supported on the cluster backend".to_string(),
        ));
    }
    Ok(())
}

/// A run submitted to a cluster scheduler, tracked by polling.
pub struct ClusterRunHandle {
    run_id: String,
    job_id: String,
    client: Arc<dyn ClusterClient>,
    poll_interval: Duration,
    outcome: Option<bool>,
}

impl ClusterRunHandle {
    pub async fn submit(client: Arc<dyn ClusterClient>, spec: JobSpec) -> Result<Self> {
        let run_id = spec.run_id.clone();
        let job_id = client.submit_job(&spec).await?;
        info!(run_id = %run_id, job_id = %job_id, "submitted cluster job");
        Ok(ClusterRunHandle {
            run_id,
            job_id,
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            outcome: None,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[cfg(test)]
    pub(crate) fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl RunHandle for ClusterRunHandle {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn wait(&mut self) -> Result<bool> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        loop {
            let status = self.client.job_status(&self.job_id).await?;
            debug!(job_id = %self.job_id, status = ?status, "polled cluster job");
            if status.is_terminal() {
                let succeeded = status == JobStatus::Succeeded;
                self.outcome = Some(succeeded);
                return Ok(succeeded);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        if self.outcome.is_some() {
            return Ok(());
        }
        info!(job_id = %self.job_id, "cancelling cluster job");
        self.client.cancel_job(&self.job_id).await?;
        self.outcome = Some(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fake scheduler that walks through a scripted status sequence.
    struct ScriptedCluster {
        statuses: Mutex<Vec<JobStatus>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl ScriptedCluster {
        fn new(statuses: Vec<JobStatus>) -> Arc<Self> {
            Arc::new(ScriptedCluster {
                statuses: Mutex::new(statuses),
                cancelled: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ClusterClient for ScriptedCluster {
        async fn submit_job(&self, spec: &JobSpec) -> Result<String> {
            Ok(format!("job-{}", spec.run_id))
        }

        async fn job_status(&self, _job_id: &str) -> Result<JobStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses[0])
            }
        }

        async fn cancel_job(&self, job_id: &str) -> Result<()> {
            self.cancelled.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
    }

    fn spec(run_id: &str) -> JobSpec {
        JobSpec {
            run_id: run_id.to_string(),
            command: "python train.py".to_string(),
            work_dir: PathBuf::from("/tmp/project"),
            env: BTreeMap::new(),
            config: serde_json::json!({"queue": "default"}),
        }
    }

    #[tokio::test]
    async fn test_wait_polls_until_success() {
        let client = ScriptedCluster::new(vec![
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
        ]);
        let mut handle = ClusterRunHandle::submit(client, spec("r1"))
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(1));

        assert_eq!(handle.job_id(), "job-r1");
        assert!(handle.wait().await.unwrap());
        assert!(handle.wait().await.unwrap(), "outcome is cached");
    }

    #[tokio::test]
    async fn test_wait_reports_failure() {
        let client = ScriptedCluster::new(vec![JobStatus::Running, JobStatus::Failed]);
        let mut handle = ClusterRunHandle::submit(client, spec("r1"))
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(1));

        assert!(!handle.wait().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_forwards_to_scheduler() {
        let client = ScriptedCluster::new(vec![JobStatus::Running]);
        let mut handle = ClusterRunHandle::submit(client.clone(), spec("r1"))
            .await
            .unwrap();

        handle.cancel().await.unwrap();
        assert_eq!(*client.cancelled.lock().unwrap(), vec!["job-r1"]);
        assert!(!handle.wait().await.unwrap());

        // Late cancel must not hit the scheduler again.
        handle.cancel().await.unwrap();
        assert_eq!(client.cancelled.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_docker_submissions_rejected() {
        let err = validate_submission(&EnvironmentSpec::Docker {
            image: "python:3.11".to_string(),
        })
        .expect_err("docker is unsupported on cluster");
        assert!(matches!(err, SkiffError::Config(_)));

        validate_submission(&EnvironmentSpec::None).unwrap();
        validate_submission(&EnvironmentSpec::Conda { path: None }).unwrap();
    }
}
