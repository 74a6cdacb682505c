//! Docker image building for container-backed projects.
//!
//! Unlike conda environments, docker images are not reused across specs: a
//! disposable image is built per invocation from a generated build context
//! (working-directory copy plus a templated Dockerfile), bundled into a tar
//! archive and streamed to `docker build` on stdin.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{ProvisionError, Result};

/// Name of the generated Dockerfile inside the build context.
const GENERATED_DOCKERFILE: &str = "Dockerfile.skiff-generated";

/// Directory prefix under which the project is placed inside the bundle.
const BUILD_CONTEXT_DIR: &str = "skiff-project-docker-build-context";

/// A docker image produced for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Tag combining the project name and source version.
    pub tag: String,

    /// Engine-assigned image id, when it could be resolved after the build.
    pub image_id: Option<String>,
}

/// Staged build inputs: the context directory and its tar bundle.
struct BuildContext {
    staging_dir: PathBuf,
    bundle_path: PathBuf,
}

impl BuildContext {
    /// Best-effort removal of the staged context. Failures are logged, not
    /// propagated: the build result is already decided by then.
    fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.bundle_path) {
            warn!(path = %self.bundle_path.display(), error = %e, "build bundle was not deleted");
        }
        if let Err(e) = std::fs::remove_dir_all(&self.staging_dir) {
            warn!(path = %self.staging_dir.display(), error = %e, "build context was not deleted");
        }
    }
}

/// Builder for per-invocation docker images.
pub struct DockerBuilder;

impl DockerBuilder {
    /// Verify the docker executable is reachable.
    pub async fn validate_installed() -> Result<()> {
        Command::new("docker")
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|_| ProvisionError::DockerNotFound)?;
        Ok(())
    }

    /// Build an image containing the project in `work_dir` on top of
    /// `base_image`, tagged with the project name and source version.
    pub async fn build_image(
        work_dir: &Path,
        project_name: &str,
        base_image: &str,
        version: &str,
    ) -> Result<BuiltImage> {
        let tag = format!("skiff-{project_name}-{version}");
        let context = create_build_context(work_dir, &dockerfile_contents(base_image, &tag))?;

        info!(tag = %tag, "building docker image");
        let dockerfile_path = format!("{BUILD_CONTEXT_DIR}/{GENERATED_DOCKERFILE}");
        let bundle = std::fs::File::open(&context.bundle_path)?;
        let output = Command::new("docker")
            .args(["build", "--force-rm", "-t", &tag, "-f", &dockerfile_path, "-"])
            .stdin(Stdio::from(bundle))
            .output()
            .await?;

        let result = if output.status.success() {
            let image_id = resolve_image_id(&tag).await;
            Ok(BuiltImage { tag, image_id })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ProvisionError::DockerCommandFailed(format!(
                "docker build failed: {stderr}"
            )))
        };

        context.cleanup();
        result
    }

    /// Command fragments that run `image` with the given environment
    /// variables, to be placed in front of the entry-point invocation (the
    /// entry command becomes the container command).
    pub fn run_command(image: &str, env_vars: &[(String, String)]) -> Vec<String> {
        let mut fragments = vec![
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
        ];
        for (key, value) in env_vars {
            fragments.push("-e".to_string());
            fragments.push(format!("{key}={value}"));
        }
        fragments.push(image.to_string());
        fragments
    }
}

fn dockerfile_contents(base_image: &str, tag: &str) -> String {
    format!(
        "FROM {base_image}\n\
         LABEL Name={tag}\n\
         COPY {BUILD_CONTEXT_DIR}/* /skiff/project/\n\
         WORKDIR /skiff/project/\n"
    )
}

/// Stage the working directory plus the generated Dockerfile into a fresh
/// temp directory and bundle it into a tar archive.
fn create_build_context(work_dir: &Path, dockerfile: &str) -> Result<BuildContext> {
    let staging_dir = tempfile::Builder::new()
        .prefix("skiff-docker-ctx-")
        .tempdir()?
        .keep();
    let contents = staging_dir.join(BUILD_CONTEXT_DIR);
    copy_dir(work_dir, &contents)?;
    std::fs::write(contents.join(GENERATED_DOCKERFILE), dockerfile)?;

    let (bundle_file, bundle_path) = tempfile::Builder::new()
        .prefix("skiff-docker-ctx-")
        .suffix(".tar")
        .tempfile()?
        .keep()
        .map_err(|e| ProvisionError::Io(e.error))?;

    let mut archive = tar::Builder::new(bundle_file);
    archive.append_dir_all(BUILD_CONTEXT_DIR, &contents)?;
    archive.finish()?;

    Ok(BuildContext {
        staging_dir,
        bundle_path,
    })
}

/// Look up the engine-assigned id for a freshly built tag.
async fn resolve_image_id(tag: &str) -> Option<String> {
    let output = Command::new("docker")
        .args(["images", "--no-trunc", "--quiet", tag])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Recursive directory copy.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
