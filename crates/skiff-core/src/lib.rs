//! Core launch pipeline for skiff: project fetching, manifest resolution,
//! command composition, execution backends, and run lifecycle orchestration.

pub mod backend;
pub mod command;
pub mod error;
pub mod fetch;
pub mod git;
pub mod lifecycle;
pub mod manifest;
pub mod telemetry;
pub mod uri;

pub use backend::{BackendKind, ClusterClient, JobSpec, JobStatus, RunHandle};
pub use error::{Result, SkiffError};
pub use fetch::{fetch_project, WorkDir};
pub use lifecycle::{BackendConfig, Launcher, RunConfig, DEFAULT_ENTRY_POINT};
pub use manifest::{EntryPoint, Project};
pub use telemetry::init_tracing;
pub use uri::{ProjectUri, UriKind};
