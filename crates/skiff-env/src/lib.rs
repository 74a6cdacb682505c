//! Execution-environment provisioning for skiff.
//!
//! A project declares at most one environment: a conda spec file, a docker
//! base image, or nothing. This crate resolves that declaration into a
//! ready-to-use environment: a deterministically named conda environment
//! (created on first use, reused afterwards) or a freshly built docker image.
//!
//! Environment identity is a content hash: byte-identical specs (plus an
//! optional discriminator) always resolve to the same name, so concurrent
//! invocations converge on one shared environment instead of provisioning
//! duplicates.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub mod conda;
pub mod docker;
pub mod error;

pub use conda::{CondaProvisioner, CONDA_HOME_ENV_VAR};
pub use docker::{BuiltImage, DockerBuilder};
pub use error::{ProvisionError, Result};

/// Environment declared by a project manifest. Read-only provisioner input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentSpec {
    /// Run in the ambient environment, no activation prefix.
    None,

    /// Conda environment from an optional spec file. Without a spec file a
    /// bare python environment is provisioned.
    Conda { path: Option<PathBuf> },

    /// Docker container built from the given base image.
    Docker { image: String },
}

impl EnvironmentSpec {
    /// Short label used for the provenance tag on run records.
    pub fn kind(&self) -> &'static str {
        match self {
            EnvironmentSpec::None => "none",
            EnvironmentSpec::Conda { .. } => "conda",
            EnvironmentSpec::Docker { .. } => "docker",
        }
    }
}

/// Derive the deterministic environment name for a spec's contents plus an
/// optional discriminator.
///
/// The discriminator disambiguates otherwise-identical specs used in
/// different contexts (for example an environment that gets extra packages
/// installed after activation).
pub fn environment_name(spec_contents: &[u8], discriminator: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec_contents);
    if let Some(discriminator) = discriminator {
        hasher.update(discriminator.as_bytes());
    }
    format!("skiff-{}", hex::encode(hasher.finalize()))
}

/// Derive the environment name from a spec file on disk. A missing spec
/// (`None`) hashes as empty contents.
pub fn environment_name_from_file(
    spec_path: Option<&Path>,
    discriminator: Option<&str>,
) -> Result<String> {
    let contents = match spec_path {
        Some(path) => std::fs::read(path).map_err(|source| ProvisionError::SpecUnreadable {
            path: path.display().to_string(),
            source,
        })?,
        None => Vec::new(),
    };
    Ok(environment_name(&contents, discriminator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_environment_name_deterministic() {
        let name1 = environment_name(b"dependencies:\n  - python=3.11\n", None);
        let name2 = environment_name(b"dependencies:\n  - python=3.11\n", None);
        assert_eq!(name1, name2);
        assert!(name1.starts_with("skiff-"));
        // sha256 hex after the prefix
        assert_eq!(name1.len(), "skiff-".len() + 64);
    }

    #[test]
    fn test_environment_name_changes_with_contents() {
        let name1 = environment_name(b"dependencies:\n  - python=3.10\n", None);
        let name2 = environment_name(b"dependencies:\n  - python=3.11\n", None);
        assert_ne!(name1, name2);
    }

    #[test]
    fn test_discriminator_disambiguates() {
        let spec = b"dependencies:\n  - python=3.11\n";
        let plain = environment_name(spec, None);
        let serving = environment_name(spec, Some("serving"));
        assert_ne!(plain, serving);

        // Same discriminator resolves to the same handle.
        assert_eq!(serving, environment_name(spec, Some("serving")));
    }

    #[test]
    fn test_environment_name_from_file() {
        let dir = tempdir().unwrap();
        let spec = dir.path().join("conda.yaml");
        std::fs::write(&spec, "dependencies:\n  - pip\n").unwrap();

        let from_file = environment_name_from_file(Some(&spec), None).unwrap();
        let from_bytes = environment_name(b"dependencies:\n  - pip\n", None);
        assert_eq!(from_file, from_bytes);

        // Missing spec path hashes as empty contents.
        let no_spec = environment_name_from_file(None, None).unwrap();
        assert_eq!(no_spec, environment_name(b"", None));
    }

    #[test]
    fn test_environment_name_from_unreadable_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        let result = environment_name_from_file(Some(&missing), None);
        assert!(matches!(result, Err(ProvisionError::SpecUnreadable { .. })));
    }

    #[test]
    fn test_spec_kind_labels() {
        assert_eq!(EnvironmentSpec::None.kind(), "none");
        assert_eq!(EnvironmentSpec::Conda { path: None }.kind(), "conda");
        assert_eq!(
            EnvironmentSpec::Docker {
                image: "python:3.11".to_string()
            }
            .kind(),
            "docker"
        );
    }
}
