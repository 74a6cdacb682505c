//! Project materialization.
//!
//! Resolves a parsed project reference into a local working directory:
//! local paths are used in place, git and archive references are
//! materialized into a fresh temporary directory.

use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use crate::error::{Result, SkiffError};
use crate::git;
use crate::uri::{absolute_path, file_uri_to_path, ProjectUri, UriKind};

/// A materialized working directory.
///
/// Temporary materializations are intentionally left on disk when the value
/// is dropped; lifecycle ownership of ephemeral working directories sits
/// with the caller, which may want the directory after the run for
/// debugging. Callers that care can delete via [`WorkDir::path`].
#[derive(Debug, Clone)]
pub struct WorkDir {
    path: PathBuf,
    is_temporary: bool,
}

impl WorkDir {
    /// Absolute path of the working directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this is a temp-directory materialization rather than an
    /// in-place local project.
    pub fn is_temporary(&self) -> bool {
        self.is_temporary
    }
}

/// Fetch a project into a local directory.
///
/// Archive and git references always materialize into a fresh temporary
/// directory; plain local paths are used in place unless `force_tempdir` is
/// set, in which case the directory tree is copied. Temporary directories
/// are rooted at `storage_dir` when given. A `version` is only meaningful
/// for git references.
pub async fn fetch_project(
    uri: &ProjectUri,
    force_tempdir: bool,
    version: Option<&str>,
    storage_dir: Option<&Path>,
) -> Result<WorkDir> {
    let use_temp_dir = force_tempdir || uri.kind != UriKind::Local;
    let dst_dir = if use_temp_dir {
        let mut builder = tempfile::Builder::new();
        builder.prefix("skiff-project-");
        let dir = match storage_dir {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?.keep()
            }
            None => builder.tempdir()?.keep(),
        };
        info!(uri = %uri.reconstruct(), dst = %dir.display(), "fetching project");
        dir
    } else {
        absolute_path(Path::new(&uri.base))
    };

    match uri.kind {
        UriKind::Archive => {
            let archive = materialize_archive(uri).await?;
            extract_zip(&archive, &dst_dir)?;
        }
        UriKind::Local => {
            if version.is_some() {
                return Err(SkiffError::Config(
                    "setting a version is only supported for Git project URIs".to_string(),
                ));
            }
            if use_temp_dir {
                copy_dir(Path::new(&uri.base), &dst_dir)?;
            }
        }
        UriKind::Git => {
            git::fetch_git_repo(&uri.base, version, &dst_dir)?;
        }
    }

    let resolved = dst_dir.join(&uri.subdirectory);
    if !resolved.exists() {
        return Err(SkiffError::Fetch(format!(
            "could not find subdirectory {} of {}",
            uri.subdirectory,
            dst_dir.display()
        )));
    }

    Ok(WorkDir {
        path: resolved,
        is_temporary: use_temp_dir,
    })
}

/// Resolve an archive reference to a local zip file, downloading remote
/// archives over HTTP into a temp file first.
async fn materialize_archive(uri: &ProjectUri) -> Result<PathBuf> {
    if uri.is_file_uri() {
        return Ok(file_uri_to_path(&uri.base));
    }
    if uri.is_local() {
        return Ok(PathBuf::from(&uri.base));
    }
    download_archive(&uri.base).await
}

async fn download_archive(url: &str) -> Result<PathBuf> {
    info!(url = %url, "downloading project archive");
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| SkiffError::Fetch(format!("unable to retrieve archive {url}: {e}")))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| SkiffError::Fetch(format!("unable to read archive {url}: {e}")))?;

    let (mut file, path) = tempfile::Builder::new()
        .prefix("skiff-archive-")
        .suffix(".zip")
        .tempfile()?
        .keep()
        .map_err(|e| SkiffError::Io(e.error))?;
    std::io::Write::write_all(&mut file, &bytes)?;
    Ok(path)
}

fn extract_zip(archive: &Path, dst_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .map_err(|e| SkiffError::Fetch(format!("cannot open archive {}: {e}", archive.display())))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| SkiffError::Fetch(format!("invalid zip archive {}: {e}", archive.display())))?;
    zip.extract(dst_dir)
        .map_err(|e| SkiffError::Fetch(format!("failed to extract {}: {e}", archive.display())))?;
    Ok(())
}

/// Recursive directory copy for forced local materialization.
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
