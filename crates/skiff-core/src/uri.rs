//! Project reference parsing and classification.
//!
//! A project reference is a URI with an optional `#subdirectory` suffix.
//! Classification is heuristic: anything without a scheme-like prefix is a
//! local path, a `.zip` suffix marks an archive, everything else with a
//! scheme is assumed to be a Git remote.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, SkiffError};

static SCHEME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^/]*:").expect("valid regex"));
static FILE_URI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^file://.+").expect("valid regex"));
static ZIP_URI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r".+\.zip$").expect("valid regex"));

/// How a project reference is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    /// Plain path on the local filesystem.
    Local,

    /// Git remote to fetch and checkout.
    Git,

    /// Zip archive, local or remote.
    Archive,
}

/// A parsed project reference. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectUri {
    /// The reference without the subdirectory suffix.
    pub base: String,

    /// Subdirectory within the project root ("" when absent).
    pub subdirectory: String,

    /// Classification of `base`.
    pub kind: UriKind,
}

impl ProjectUri {
    /// Parse a raw reference, splitting the subdirectory at the first `#`.
    pub fn parse(uri: &str) -> Result<Self> {
        let (base, subdirectory) = match uri.find('#') {
            Some(pos) => (&uri[..pos], &uri[pos + 1..]),
            None => (uri, ""),
        };
        if !subdirectory.is_empty() && subdirectory.contains('.') {
            return Err(SkiffError::Config(
                "'.' is not allowed in project subdirectory paths".to_string(),
            ));
        }

        let kind = if ZIP_URI_RE.is_match(base) {
            UriKind::Archive
        } else if SCHEME_RE.is_match(base) {
            UriKind::Git
        } else {
            UriKind::Local
        };

        Ok(ProjectUri {
            base: base.to_string(),
            subdirectory: subdirectory.to_string(),
            kind,
        })
    }

    /// Reconstruct the raw reference string.
    pub fn reconstruct(&self) -> String {
        if self.subdirectory.is_empty() {
            self.base.clone()
        } else {
            format!("{}#{}", self.base, self.subdirectory)
        }
    }

    /// Whether `base` is a path on the local filesystem (no scheme).
    pub fn is_local(&self) -> bool {
        !SCHEME_RE.is_match(&self.base)
    }

    /// Whether `base` is a `file://` URI.
    pub fn is_file_uri(&self) -> bool {
        is_file_uri(&self.base)
    }

    /// Expanded form used as the source-uri provenance tag: local paths are
    /// absolutized, everything else passes through unchanged.
    pub fn expanded(&self) -> String {
        if self.is_local() {
            absolute_path(Path::new(&self.base)).display().to_string()
        } else {
            self.base.clone()
        }
    }
}

/// Whether a raw string is a `file://` URI.
pub fn is_file_uri(uri: &str) -> bool {
    FILE_URI_RE.is_match(uri)
}

/// Strip the `file://` prefix into a plain path.
pub fn file_uri_to_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.trim_start_matches("file://"))
}

/// Absolutize a path against the current directory without touching the
/// filesystem (the path may not exist yet).
pub fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
