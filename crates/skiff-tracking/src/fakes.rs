//! In-memory tracking client for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{Result, RunRecord, RunStatus, TrackingClient, TrackingError};

/// In-memory `TrackingClient` backed by a mutexed map.
///
/// Enforces the same contract as the real service: append-only tags and
/// one-way terminal status.
#[derive(Default)]
pub struct MemoryTracking {
    runs: Mutex<HashMap<String, RunRecord>>,
    experiments: Mutex<HashMap<String, String>>,
}

impl MemoryTracking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an experiment name -> id mapping.
    pub fn add_experiment(&self, name: &str, id: &str) {
        self.experiments
            .lock()
            .unwrap()
            .insert(name.to_string(), id.to_string());
    }

    /// Number of runs created so far.
    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl TrackingClient for MemoryTracking {
    async fn create_run(
        &self,
        experiment_id: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<RunRecord> {
        let record = RunRecord {
            run_id: Uuid::new_v4().simple().to_string(),
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            tags,
            params: BTreeMap::new(),
        };
        self.runs
            .lock()
            .unwrap()
            .insert(record.run_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        self.runs
            .lock()
            .unwrap()
            .get(run_id)
            .cloned()
            .ok_or_else(|| TrackingError::RunNotFound(run_id.to_string()))
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| TrackingError::RunNotFound(run_id.to_string()))?;
        record.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| TrackingError::RunNotFound(run_id.to_string()))?;
        record.params.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(TrackingError::Service(format!(
                "cannot terminate run {run_id} with non-terminal status {status}"
            )));
        }
        let mut runs = self.runs.lock().unwrap();
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| TrackingError::RunNotFound(run_id.to_string()))?;
        if record.status.is_terminal() {
            return Err(TrackingError::Service(format!(
                "run {run_id} is already terminal ({})",
                record.status
            )));
        }
        record.status = status;
        Ok(())
    }

    async fn experiment_id_by_name(&self, name: &str) -> Result<String> {
        self.experiments
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TrackingError::ExperimentNotFound(name.to_string()))
    }
}
