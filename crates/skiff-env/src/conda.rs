//! Conda environment provisioning.
//!
//! Environments are named after a content hash of the spec file so repeated
//! invocations reuse the same environment. A missing environment is created
//! synchronously (even though creation is slow) so that two invocations
//! referencing the same spec never race to create it; in-process callers are
//! additionally serialized behind [`CREATE_LOCK`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::environment_name_from_file;

/// Override for the conda installation root. When set, executables are
/// resolved under `$SKIFF_CONDA_HOME/bin/` instead of PATH.
pub const CONDA_HOME_ENV_VAR: &str = "SKIFF_CONDA_HOME";

/// Serializes first-time environment creation within this process. The
/// list-then-create window across separate processes remains open and is
/// accepted as documented behavior.
static CREATE_LOCK: Mutex<()> = Mutex::const_new(());

/// Provisioner for conda-backed environments.
#[derive(Debug, Clone, Default)]
pub struct CondaProvisioner {
    conda_home: Option<PathBuf>,
}

#[derive(Deserialize)]
struct EnvList {
    envs: Vec<String>,
}

impl CondaProvisioner {
    /// Provisioner with an explicit installation root (`None` = use PATH).
    pub fn new(conda_home: Option<PathBuf>) -> Self {
        CondaProvisioner { conda_home }
    }

    /// Provisioner configured from `SKIFF_CONDA_HOME`.
    pub fn from_env() -> Self {
        Self::new(std::env::var_os(CONDA_HOME_ENV_VAR).map(PathBuf::from))
    }

    /// Path to an executable within the conda installation. Falls back to
    /// the bare name (PATH lookup) when no installation root is configured.
    fn conda_bin(&self, name: &str) -> PathBuf {
        match &self.conda_home {
            Some(home) => home.join("bin").join(name),
            None => PathBuf::from(name),
        }
    }

    /// Guarantee an environment for `spec_path` exists, creating it if
    /// absent, and return its deterministic name.
    pub async fn ensure_environment(
        &self,
        spec_path: Option<&Path>,
        discriminator: Option<&str>,
    ) -> Result<String> {
        let env_name = environment_name_from_file(spec_path, discriminator)?;
        let conda = self.conda_bin("conda");

        // Probe the executable before anything else so the caller gets a
        // remediation hint instead of a raw spawn error.
        Command::new(&conda)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|_| ProvisionError::CondaNotFound {
                path: conda.display().to_string(),
            })?;

        let _guard = CREATE_LOCK.lock().await;

        let existing = self.list_environments(&conda).await?;
        if existing.iter().any(|name| name == &env_name) {
            debug!(env = %env_name, "conda environment already present");
            return Ok(env_name);
        }

        info!(env = %env_name, "creating conda environment");
        let status = match spec_path {
            Some(spec) => {
                Command::new(&conda)
                    .args(["env", "create", "-n", &env_name, "--file"])
                    .arg(spec)
                    .status()
                    .await?
            }
            None => {
                Command::new(&conda)
                    .args(["create", "-n", &env_name, "python"])
                    .status()
                    .await?
            }
        };
        if !status.success() {
            return Err(ProvisionError::CondaCommandFailed(format!(
                "conda create for environment {env_name} exited with {status}"
            )));
        }

        Ok(env_name)
    }

    /// List names of environments known to the conda registry.
    async fn list_environments(&self, conda: &Path) -> Result<Vec<String>> {
        let output = Command::new(conda)
            .args(["env", "list", "--json"])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::CondaCommandFailed(format!(
                "conda env list failed: {stderr}"
            )));
        }
        parse_env_names(&output.stdout)
    }

    /// Command fragments that activate `env_name` in a shell, to be chained
    /// in front of the entry-point invocation.
    pub fn activate_command(&self, env_name: &str) -> Vec<String> {
        let activate = self.conda_bin("activate");
        vec![format!("source {} {}", activate.display(), env_name)]
    }
}

/// Parse the `conda env list --json` output into environment names.
fn parse_env_names(stdout: &[u8]) -> Result<Vec<String>> {
    let listing: EnvList = serde_json::from_slice(stdout)?;
    Ok(listing
        .envs
        .iter()
        .filter_map(|path| {
            Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_parse_env_names() {
        let stdout = br#"{"envs": ["/opt/conda", "/opt/conda/envs/skiff-abc", "/opt/conda/envs/base2"]}"#;
        let names = parse_env_names(stdout).unwrap();
        assert_eq!(names, vec!["conda", "skiff-abc", "base2"]);
    }

    #[test]
    fn test_parse_env_names_rejects_garbage() {
        assert!(parse_env_names(b"not json").is_err());
    }

    #[test]
    fn test_activate_command_uses_home() {
        let provisioner = CondaProvisioner::new(Some(PathBuf::from("/opt/conda")));
        let fragments = provisioner.activate_command("skiff-abc");
        assert_eq!(fragments, vec!["source /opt/conda/bin/activate skiff-abc"]);

        let bare = CondaProvisioner::new(None);
        assert_eq!(
            bare.activate_command("skiff-abc"),
            vec!["source activate skiff-abc"]
        );
    }

    #[tokio::test]
    async fn test_missing_conda_reports_remediation() {
        let home = tempdir().unwrap();
        let provisioner = CondaProvisioner::new(Some(home.path().to_path_buf()));

        let result = provisioner.ensure_environment(None, None).await;
        let err = result.expect_err("should fail without a conda executable");
        assert!(matches!(err, ProvisionError::CondaNotFound { .. }));
        assert!(err.to_string().contains(CONDA_HOME_ENV_VAR));
        assert!(err.to_string().contains("conda"));
    }

    #[cfg(unix)]
    mod with_fake_conda {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// A scripted conda that keeps its environment registry in a state
        /// file next to the bin directory.
        const FAKE_CONDA: &str = r#"#!/bin/sh
STATE="$(dirname "$0")/../created.txt"
cmd="$1"
sub="$2"
if [ "$cmd" = "--version" ]; then
    echo "conda 24.1.0"
    exit 0
fi
record_create() {
    while [ $# -gt 0 ]; do
        if [ "$1" = "-n" ]; then
            sleep 0.05
            echo "$2" >> "$STATE"
            exit 0
        fi
        shift
    done
    exit 1
}
if [ "$cmd" = "env" ] && [ "$sub" = "list" ]; then
    envs=""
    if [ -f "$STATE" ]; then
        while read -r name; do
            envs="$envs\"/opt/conda/envs/$name\","
        done < "$STATE"
    fi
    envs="${envs%,}"
    printf '{"envs": [%s]}' "$envs"
    exit 0
fi
if [ "$cmd" = "env" ] && [ "$sub" = "create" ]; then
    shift 2
    record_create "$@"
fi
if [ "$cmd" = "create" ]; then
    shift
    record_create "$@"
fi
exit 1
"#;

        fn fake_conda_home() -> tempfile::TempDir {
            let home = tempdir().unwrap();
            let bin = home.path().join("bin");
            std::fs::create_dir(&bin).unwrap();
            let conda = bin.join("conda");
            std::fs::write(&conda, FAKE_CONDA).unwrap();
            std::fs::set_permissions(&conda, std::fs::Permissions::from_mode(0o755)).unwrap();
            home
        }

        fn created_envs(home: &Path) -> Vec<String> {
            match std::fs::read_to_string(home.join("created.txt")) {
                Ok(contents) => contents.lines().map(str::to_string).collect(),
                Err(_) => Vec::new(),
            }
        }

        #[tokio::test]
        async fn test_ensure_creates_then_reuses() {
            let home = fake_conda_home();
            let provisioner = CondaProvisioner::new(Some(home.path().to_path_buf()));

            let spec = home.path().join("conda.yaml");
            std::fs::write(&spec, "dependencies:\n  - pip\n").unwrap();

            let first = provisioner
                .ensure_environment(Some(&spec), None)
                .await
                .expect("first ensure");
            let second = provisioner
                .ensure_environment(Some(&spec), None)
                .await
                .expect("second ensure");

            assert_eq!(first, second);
            assert_eq!(
                created_envs(home.path()),
                vec![first],
                "environment must be created exactly once"
            );
        }

        #[tokio::test]
        async fn test_concurrent_first_time_provisioning_creates_one() {
            let home = fake_conda_home();
            let provisioner = Arc::new(CondaProvisioner::new(Some(home.path().to_path_buf())));

            let spec = home.path().join("conda.yaml");
            std::fs::write(&spec, "dependencies:\n  - numpy\n").unwrap();

            let a = {
                let p = provisioner.clone();
                let spec = spec.clone();
                tokio::spawn(async move { p.ensure_environment(Some(&spec), None).await })
            };
            let b = {
                let p = provisioner.clone();
                let spec = spec.clone();
                tokio::spawn(async move { p.ensure_environment(Some(&spec), None).await })
            };

            let name_a = a.await.unwrap().expect("ensure a");
            let name_b = b.await.unwrap().expect("ensure b");
            assert_eq!(name_a, name_b);

            let registry = created_envs(home.path());
            assert_eq!(
                registry,
                vec![name_a],
                "registry must list the handle exactly once"
            );
        }

        #[tokio::test]
        async fn test_no_spec_provisions_bare_python_env() {
            let home = fake_conda_home();
            let provisioner = CondaProvisioner::new(Some(home.path().to_path_buf()));

            let name = provisioner
                .ensure_environment(None, None)
                .await
                .expect("ensure");
            assert_eq!(created_envs(home.path()), vec![name]);
        }
    }
}
