//! Run lifecycle orchestration.
//!
//! Drives one launch end to end: fetch the project, resolve its manifest,
//! validate everything that can fail before a run record exists, create or
//! attach the record, provision the environment, compose the command, hand
//! it to a backend, and finalize the record exactly once.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use skiff_env::{CondaProvisioner, DockerBuilder, EnvironmentSpec};
use skiff_tracking::{
    tags, RunStatus, TrackingClient, EXPERIMENT_ID_ENV_VAR, RUN_ID_ENV_VAR, TRACKING_URI_ENV_VAR,
};

use crate::backend::{
    cluster, BackendKind, ClusterClient, ClusterRunHandle, DetachedRunHandle, JobSpec,
    LocalRunHandle, RunHandle,
};
use crate::command::join_fragments;
use crate::error::{Result, SkiffError};
use crate::fetch::{fetch_project, WorkDir};
use crate::git;
use crate::manifest::{EntryPoint, Project};
use crate::uri::ProjectUri;

/// Entry point used when the caller names none.
pub const DEFAULT_ENTRY_POINT: &str = "main";

/// Experiment used when neither a selector nor the env var is set.
pub const DEFAULT_EXPERIMENT_ID: &str = "0";

/// Backend configuration: inline JSON or a path to a `.json` file.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Inline(serde_json::Value),
    File(PathBuf),
}

impl BackendConfig {
    fn resolve(&self) -> Result<serde_json::Value> {
        match self {
            BackendConfig::Inline(value) => Ok(value.clone()),
            BackendConfig::File(path) => {
                let contents = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&contents)?)
            }
        }
    }
}

/// Everything describing one launch request.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub uri: String,
    pub entry_point: String,
    pub version: Option<String>,
    pub parameters: BTreeMap<String, String>,

    /// At most one of `experiment_name` / `experiment_id` may be set.
    pub experiment_name: Option<String>,
    pub experiment_id: Option<String>,

    pub backend: BackendKind,
    pub backend_config: Option<BackendConfig>,

    /// When false, skip conda provisioning and run in the ambient
    /// environment. Docker projects always build their image.
    pub provision: bool,

    /// Root directory for temporary project materializations.
    pub storage_dir: Option<PathBuf>,

    /// Synchronous launches wait for the outcome and finalize the record;
    /// asynchronous local launches detach a monitoring re-invocation.
    pub synchronous: bool,

    /// Attach to an existing run record instead of creating one.
    pub run_id: Option<String>,
}

impl RunConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        RunConfig {
            uri: uri.into(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            version: None,
            parameters: BTreeMap::new(),
            experiment_name: None,
            experiment_id: None,
            backend: BackendKind::Local,
            backend_config: None,
            provision: true,
            storage_dir: None,
            synchronous: true,
            run_id: None,
        }
    }
}

/// Orchestrates launches against one tracking service.
pub struct Launcher {
    tracking: Arc<dyn TrackingClient>,
    cluster: Option<Arc<dyn ClusterClient>>,
    tracking_uri: String,
}

impl Launcher {
    pub fn new(tracking: Arc<dyn TrackingClient>, tracking_uri: impl Into<String>) -> Self {
        Launcher {
            tracking,
            cluster: None,
            tracking_uri: tracking_uri.into(),
        }
    }

    /// Attach the scheduler client backing the cluster backend.
    pub fn with_cluster(mut self, client: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(client);
        self
    }

    /// Launch a run and, for synchronous configs, wait for its outcome.
    /// Returns the run id in both modes.
    pub async fn run(&self, config: &RunConfig) -> Result<String> {
        let mut handle = self.launch(config).await?;
        let run_id = handle.run_id().to_string();
        if config.synchronous {
            self.wait_for(handle.as_mut()).await?;
        } else {
            info!(run_id = %run_id, "run launched, not waiting for completion");
        }
        Ok(run_id)
    }

    /// Run the pipeline up to launch and return the live handle.
    pub async fn launch(&self, config: &RunConfig) -> Result<Box<dyn RunHandle>> {
        // Everything that can be rejected without side effects happens
        // before the run record is created.
        let experiment_id = self.resolve_experiment(config).await?;
        let backend_config = match &config.backend_config {
            Some(backend_config) => backend_config.resolve()?,
            None => serde_json::Value::Object(Default::default()),
        };
        let cluster_client = match config.backend {
            BackendKind::Cluster => Some(self.cluster.clone().ok_or_else(|| {
                SkiffError::Config("cluster backend selected but no cluster client is configured".to_string())
            })?),
            BackendKind::Local => None,
        };

        let uri = ProjectUri::parse(&config.uri)?;
        let work = fetch_project(
            &uri,
            false,
            config.version.as_deref(),
            config.storage_dir.as_deref(),
        )
        .await?;
        let project = Project::load(work.path())?;
        let entry = project.get_entry_point(&config.entry_point, work.path())?;
        entry.validate_parameters(&config.parameters)?;
        if config.backend == BackendKind::Cluster {
            cluster::validate_submission(&project.env)?;
        }
        if matches!(project.env, EnvironmentSpec::Docker { .. }) && project.name.is_none() {
            return Err(SkiffError::Config(
                "a project name is required to build a docker environment".to_string(),
            ));
        }

        let run_id = match &config.run_id {
            Some(run_id) => {
                let record = self.tracking.get_run(run_id).await?;
                debug!(run_id = %run_id, "attached to existing run");
                record.run_id
            }
            None => {
                let record = self
                    .tracking
                    .create_run(&experiment_id, BTreeMap::new())
                    .await?;
                info!(run_id = %record.run_id, experiment_id = %experiment_id, "created run");
                record.run_id
            }
        };

        // A record now exists: any later failure gets one best-effort
        // FAILED finalize before propagating.
        match self
            .prepare_and_launch(
                config,
                &uri,
                &work,
                &project,
                &entry,
                &experiment_id,
                &run_id,
                backend_config,
                cluster_client,
            )
            .await
        {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.finalize(&run_id, RunStatus::Failed).await;
                Err(e)
            }
        }
    }

    /// Wait for a launched run, interruptibly, and finalize its record.
    pub async fn wait_for(&self, handle: &mut dyn RunHandle) -> Result<()> {
        let run_id = handle.run_id().to_string();
        let outcome = tokio::select! {
            result = handle.wait() => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        };

        match outcome {
            Some(Ok(true)) => {
                info!(run_id = %run_id, "run finished");
                self.finalize(&run_id, RunStatus::Finished).await;
                Ok(())
            }
            Some(Ok(false)) => {
                self.finalize(&run_id, RunStatus::Failed).await;
                Err(SkiffError::Execution(format!("run {run_id} failed")))
            }
            Some(Err(e)) => {
                self.finalize(&run_id, RunStatus::Failed).await;
                Err(e)
            }
            None => {
                warn!(run_id = %run_id, "interrupted, cancelling run");
                if let Err(e) = handle.cancel().await {
                    warn!(run_id = %run_id, error = %e, "run was not cancelled cleanly");
                }
                self.finalize(&run_id, RunStatus::Failed).await;
                Err(SkiffError::Execution(format!("run {run_id} interrupted")))
            }
        }
    }

    async fn resolve_experiment(&self, config: &RunConfig) -> Result<String> {
        match (&config.experiment_name, &config.experiment_id) {
            (Some(_), Some(_)) => Err(SkiffError::Config(
                "specify only one of experiment name or experiment id".to_string(),
            )),
            (Some(name), None) => Ok(self.tracking.experiment_id_by_name(name).await?),
            (None, Some(id)) => Ok(id.clone()),
            (None, None) => Ok(std::env::var(EXPERIMENT_ID_ENV_VAR)
                .ok()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| DEFAULT_EXPERIMENT_ID.to_string())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare_and_launch(
        &self,
        config: &RunConfig,
        uri: &ProjectUri,
        work: &WorkDir,
        project: &Project,
        entry: &EntryPoint,
        experiment_id: &str,
        run_id: &str,
        backend_config: serde_json::Value,
        cluster_client: Option<Arc<dyn ClusterClient>>,
    ) -> Result<Box<dyn RunHandle>> {
        let (resolved, extras) = entry.compute_parameters(&config.parameters)?;
        for (key, value) in resolved.iter().chain(extras.iter()) {
            self.tracking.log_param(run_id, key, value).await?;
        }
        self.apply_provenance_tags(config, uri, work, project, run_id)
            .await?;

        let env_vars = self.run_env_vars(run_id, experiment_id);

        if let Some(client) = cluster_client {
            let command = self
                .compose_command(config, work, project, entry, run_id, &env_vars)
                .await?;
            let handle = ClusterRunHandle::submit(
                client,
                JobSpec {
                    run_id: run_id.to_string(),
                    command,
                    work_dir: work.path().to_path_buf(),
                    env: env_vars,
                    config: backend_config,
                },
            )
            .await?;
            return Ok(Box::new(handle));
        }

        if config.synchronous {
            let command = self
                .compose_command(config, work, project, entry, run_id, &env_vars)
                .await?;
            let handle = LocalRunHandle::launch(run_id, &command, work.path(), &env_vars)?;
            return Ok(Box::new(handle));
        }

        // Detached: provisioning and command composition happen in the
        // re-invoked launcher, which attaches to this record and owns the
        // terminal report.
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("skiff"));
        let args = detached_args(config, work.path(), run_id, experiment_id);
        let handle = DetachedRunHandle::launch(run_id, &program, &args, &env_vars)?;
        Ok(Box::new(handle))
    }

    /// Provision the declared environment and compose the final shell
    /// command, activation prefix included.
    async fn compose_command(
        &self,
        config: &RunConfig,
        work: &WorkDir,
        project: &Project,
        entry: &EntryPoint,
        run_id: &str,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<String> {
        let entry_command = entry.compute_command(&config.parameters)?;
        let mut fragments = Vec::new();
        let mut chained = false;

        match &project.env {
            EnvironmentSpec::None => {}
            EnvironmentSpec::Conda { path } => {
                if config.provision {
                    let provisioner = CondaProvisioner::from_env();
                    let env_name = provisioner
                        .ensure_environment(path.as_deref(), None)
                        .await?;
                    fragments.extend(provisioner.activate_command(&env_name));
                    chained = true;
                } else {
                    debug!("provisioning disabled, running in the ambient environment");
                }
            }
            EnvironmentSpec::Docker { image } => {
                DockerBuilder::validate_installed().await?;
                let project_name = project.name.as_deref().ok_or_else(|| {
                    SkiffError::Config(
                        "a project name is required to build a docker environment".to_string(),
                    )
                })?;
                let version = git::head_commit(work.path())
                    .map(|sha| sha[..7.min(sha.len())].to_string())
                    .unwrap_or_else(|| "latest".to_string());
                let built =
                    DockerBuilder::build_image(work.path(), project_name, image, &version).await?;

                self.tracking
                    .set_tag(run_id, tags::DOCKER_IMAGE_NAME, &built.tag)
                    .await?;
                if let Some(image_id) = &built.image_id {
                    self.tracking
                        .set_tag(run_id, tags::DOCKER_IMAGE_ID, image_id)
                        .await?;
                }

                let docker_env: Vec<(String, String)> = env_vars
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                fragments.push(join_fragments(
                    &DockerBuilder::run_command(&built.tag, &docker_env),
                    false,
                ));
            }
        }

        fragments.push(entry_command);
        Ok(join_fragments(&fragments, chained))
    }

    async fn apply_provenance_tags(
        &self,
        config: &RunConfig,
        uri: &ProjectUri,
        work: &WorkDir,
        project: &Project,
        run_id: &str,
    ) -> Result<()> {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        let mut run_tags: Vec<(&str, String)> = vec![
            (tags::USER, user),
            (tags::SOURCE_URI, uri.expanded()),
            (tags::ENTRY_POINT, config.entry_point.clone()),
            (tags::PROJECT_ENV, project.env.kind().to_string()),
        ];

        // A launch happening inside an already-tracked run records its
        // parent; attaching by explicit run id is not nesting.
        if config.run_id.is_none() {
            if let Ok(parent) = std::env::var(RUN_ID_ENV_VAR) {
                if !parent.is_empty() {
                    run_tags.push((tags::PARENT_RUN_ID, parent));
                }
            }
        }

        if let Some(commit) = git::head_commit(work.path()) {
            run_tags.push((tags::GIT_COMMIT, commit));
        }
        if let Some(url) = git::repo_url(work.path()) {
            run_tags.push((tags::GIT_REPO_URL, url));
        }
        if let Some(version) = &config.version {
            if git::is_valid_branch(work.path(), version) {
                run_tags.push((tags::GIT_BRANCH, version.clone()));
            }
        }

        for (key, value) in run_tags {
            self.tracking.set_tag(run_id, key, &value).await?;
        }
        Ok(())
    }

    fn run_env_vars(&self, run_id: &str, experiment_id: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(RUN_ID_ENV_VAR.to_string(), run_id.to_string());
        env.insert(TRACKING_URI_ENV_VAR.to_string(), self.tracking_uri.clone());
        env.insert(EXPERIMENT_ID_ENV_VAR.to_string(), experiment_id.to_string());
        env
    }

    /// Finalize a run record, unless it already reached a terminal status.
    /// Failures here are logged, never propagated: the run outcome is
    /// already decided.
    async fn finalize(&self, run_id: &str, status: RunStatus) {
        match self.tracking.get_run(run_id).await {
            Ok(record) if record.status.is_terminal() => {
                debug!(run_id = %run_id, status = %record.status, "run already finalized");
            }
            Ok(_) => {
                if let Err(e) = self.tracking.set_terminated(run_id, status).await {
                    warn!(run_id = %run_id, error = %e, "failed to finalize run");
                }
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to re-fetch run before finalizing");
            }
        }
    }
}

/// CLI arguments for the detached re-invocation: a synchronous local run of
/// the already-materialized working directory, attached to `run_id`.
fn detached_args(
    config: &RunConfig,
    work_dir: &std::path::Path,
    run_id: &str,
    experiment_id: &str,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        work_dir.display().to_string(),
        "-e".to_string(),
        config.entry_point.clone(),
        "--run-id".to_string(),
        run_id.to_string(),
        "--experiment-id".to_string(),
        experiment_id.to_string(),
    ];
    for (key, value) in &config.parameters {
        args.push("-P".to_string());
        args.push(format!("{key}={value}"));
    }
    if let Some(storage_dir) = &config.storage_dir {
        args.push("--storage-dir".to_string());
        args.push(storage_dir.display().to_string());
    }
    if !config.provision {
        args.push("--no-provision".to_string());
    }
    args
}
