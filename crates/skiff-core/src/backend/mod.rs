//! Execution backends.
//!
//! A backend turns a composed command into a running workload and hands
//! back a [`RunHandle`] for waiting and cancellation. The local backend
//! spawns a subprocess on this machine; the cluster backend submits the
//! command to a remote scheduler through a [`cluster::ClusterClient`].

pub mod cluster;
pub mod detached;
pub mod local;

pub use cluster::{ClusterClient, ClusterRunHandle, JobSpec, JobStatus};
pub use detached::DetachedRunHandle;
pub use local::LocalRunHandle;

use async_trait::async_trait;

use crate::error::{Result, SkiffError};

/// Selected execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Cluster,
}

impl BackendKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "local" => Ok(BackendKind::Local),
            "cluster" => Ok(BackendKind::Cluster),
            other => Err(SkiffError::Config(format!(
                "unsupported backend '{other}', expected 'local' or 'cluster'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Cluster => "cluster",
        }
    }
}

/// Handle on a launched run.
///
/// `wait` is idempotent: once an outcome is observed it is cached and
/// returned on every later call. `cancel` after the run reached a terminal
/// state is a no-op.
#[async_trait]
pub trait RunHandle: Send {
    /// Tracking run id this workload reports under.
    fn run_id(&self) -> &str;

    /// Block until the workload terminates; `true` means success.
    async fn wait(&mut self) -> Result<bool>;

    /// Terminate the workload if it is still running.
    async fn cancel(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(BackendKind::parse("local").unwrap(), BackendKind::Local);
        assert_eq!(BackendKind::parse("cluster").unwrap(), BackendKind::Cluster);

        let err = BackendKind::parse("kubernetes").expect_err("unknown backend");
        assert!(matches!(err, SkiffError::Config(_)));
        assert!(err.to_string().contains("kubernetes"));
    }

    #[test]
    fn test_backend_kind_labels() {
        assert_eq!(BackendKind::Local.as_str(), "local");
        assert_eq!(BackendKind::Cluster.as_str(), "cluster");
    }
}
