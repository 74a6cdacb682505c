//! Detached launcher backend.
//!
//! Non-blocking launches re-invoke this binary as a monitoring child
//! process running in its own process group, so the launched project and
//! its monitor survive the parent's terminal and can be cancelled as a
//! unit with a group signal.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::info;

use crate::backend::RunHandle;
use crate::error::{Result, SkiffError};

/// A run monitored by a detached re-invocation of the launcher binary.
pub struct DetachedRunHandle {
    run_id: String,
    child: Option<Child>,
    outcome: Option<bool>,
}

impl DetachedRunHandle {
    /// Spawn `program args...` as a process-group leader.
    pub fn launch(
        run_id: &str,
        program: &Path,
        args: &[String],
        env_vars: &BTreeMap<String, String>,
    ) -> Result<Self> {
        info!(run_id = %run_id, program = %program.display(), "launching detached run");

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(env_vars)
            .stdin(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| {
            SkiffError::Execution(format!(
                "failed to spawn detached launcher {}: {e}",
                program.display()
            ))
        })?;

        Ok(DetachedRunHandle {
            run_id: run_id.to_string(),
            child: Some(child),
            outcome: None,
        })
    }

    /// Signal the child's whole process group, so the monitoring launcher
    /// and the project subprocess it spawned terminate together.
    #[cfg(unix)]
    fn signal_group(&self) -> Result<()> {
        let pid = self
            .child
            .as_ref()
            .and_then(Child::id)
            .ok_or_else(|| SkiffError::Execution("detached run already reaped".to_string()))?;
        // The child was spawned with process_group(0), so its pgid is its pid.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(SkiffError::Execution(format!(
                "failed to signal process group {pid}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RunHandle for DetachedRunHandle {
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
            .ok_or_else(|| SkiffError::Execution("detached run already reaped".to_string()))?;
        let status = child
            .wait()
            .await
            .map_err(|e| SkiffError::Execution(format!("failed waiting for detached run: {e}")))?;

        let succeeded = status.success();
        self.outcome = Some(succeeded);
        Ok(succeeded)
    }

    async fn cancel(&mut self) -> Result<()> {
        if self.outcome.is_some() {
            return Ok(());
        }
        info!(run_id = %self.run_id, "cancelling detached run");

        #[cfg(unix)]
        self.signal_group()?;
        #[cfg(not(unix))]
        if let Some(child) = self.child.as_mut() {
            child
                .kill()
                .await
                .map_err(|e| SkiffError::Execution(format!("failed to kill detached run: {e}")))?;
        }

        if let Some(child) = self.child.as_mut() {
            let _ = child.wait().await;
        }
        self.outcome = Some(false);
        Ok(())
    }
}
