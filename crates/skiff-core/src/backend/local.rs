//! Local subprocess backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::backend::RunHandle;
use crate::error::{Result, SkiffError};

/// A run executing as a shell subprocess on this machine.
pub struct LocalRunHandle {
    run_id: String,
    child: Option<Child>,
    outcome: Option<bool>,
}

impl LocalRunHandle {
    /// Spawn `command` through `bash -c` in `work_dir` with the given extra
    /// environment variables. Stdout and stderr are inherited so the
    /// project's output streams to the invoking terminal.
    pub fn launch(
        run_id: &str,
        command: &str,
        work_dir: &Path,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<Self> {
        info!(run_id = %run_id, command = %command, "launching local run");
        debug!(work_dir = %work_dir.display(), "run working directory");

        let child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(work_dir)
            .envs(env_vars)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| SkiffError::Execution(format!("failed to spawn run command: {e}")))?;

        Ok(LocalRunHandle {
            run_id: run_id.to_string(),
            child: Some(child),
            outcome: None,
        })
    }
}

#[async_trait]
impl RunHandle for LocalRunHandle {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn wait(&mut self) -> Result<bool> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| SkiffError::Execution("run process already reaped".to_string()))?;
        let status = child
            .wait()
            .await
            .map_err(|e| SkiffError::Execution(format!("failed waiting for run: {e}")))?;

        let succeeded = status.success();
        if !succeeded {
            info!(run_id = %self.run_id, status = %status, "local run exited with failure");
        }
        self.outcome = Some(succeeded);
        Ok(succeeded)
    }

    async fn cancel(&mut self) -> Result<()> {
        if self.outcome.is_some() {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            info!(run_id = %self.run_id, "cancelling local run");
            child
                .kill()
                .await
                .map_err(|e| SkiffError::Execution(format!("failed to kill run: {e}")))?;
        }
        self.outcome = Some(false);
        Ok(())
    }
}
