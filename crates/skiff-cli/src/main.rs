//! skiff - reproducible project launcher
//!
//! `skiff run` fetches a project (local path, git repo, or zip archive),
//! provisions its declared environment, launches an entry point, and
//! records the run against the tracking service. The same binary is
//! re-invoked by the detached execution path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use skiff_core::{BackendConfig, BackendKind, Launcher, RunConfig};
use skiff_tracking::RestTracking;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reproducible project launcher with run tracking", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a project and launch one of its entry points
    Run {
        /// Project reference: local path, git URI, or zip archive,
        /// optionally suffixed with `#subdirectory`
        uri: String,

        /// Entry point to launch
        #[arg(short = 'e', long, default_value = "main")]
        entry_point: String,

        /// Git commit, branch, or tag to check out
        #[arg(long)]
        version: Option<String>,

        /// Entry-point parameter, repeatable (KEY=VALUE)
        #[arg(short = 'P', long = "param", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Experiment to record the run under, by name
        #[arg(long, conflicts_with = "experiment_id")]
        experiment_name: Option<String>,

        /// Experiment to record the run under, by id
        #[arg(long)]
        experiment_id: Option<String>,

        /// Execution backend
        #[arg(long, default_value = "local")]
        backend: String,

        /// Backend configuration: inline JSON or a path to a .json file
        #[arg(long)]
        backend_config: Option<String>,

        /// Skip conda provisioning and run in the current environment
        #[arg(long)]
        no_provision: bool,

        /// Root directory for temporary project checkouts
        #[arg(long)]
        storage_dir: Option<PathBuf>,

        /// Launch without waiting for the run to finish
        #[arg(long)]
        detach: bool,

        /// Attach to an existing run record instead of creating one
        #[arg(long)]
        run_id: Option<String>,
    },
}

/// Parse a `KEY=VALUE` parameter argument.
fn parse_key_val(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Interpret `--backend-config`: an existing file path wins, anything else
/// must parse as inline JSON.
fn parse_backend_config(raw: &str) -> Result<BackendConfig> {
    if Path::new(raw).is_file() {
        return Ok(BackendConfig::File(PathBuf::from(raw)));
    }
    let value: serde_json::Value = serde_json::from_str(raw)
        .with_context(|| format!("--backend-config '{raw}' is neither a file nor valid JSON"))?;
    Ok(BackendConfig::Inline(value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    skiff_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            uri,
            entry_point,
            version,
            params,
            experiment_name,
            experiment_id,
            backend,
            backend_config,
            no_provision,
            storage_dir,
            detach,
            run_id,
        } => {
            let backend = BackendKind::parse(&backend)?;
            let backend_config = backend_config
                .as_deref()
                .map(parse_backend_config)
                .transpose()?;

            let config = RunConfig {
                uri,
                entry_point,
                version,
                parameters: params.into_iter().collect::<BTreeMap<_, _>>(),
                experiment_name,
                experiment_id,
                backend,
                backend_config,
                provision: !no_provision,
                storage_dir,
                synchronous: !detach,
                run_id,
            };

            let tracking = RestTracking::from_env();
            let tracking_uri = tracking.base_uri().to_string();
            let launcher = Launcher::new(Arc::new(tracking), tracking_uri);

            let run_id = launcher
                .run(&config)
                .await
                .context("project run did not complete")?;
            println!("{run_id}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("alpha=0.5").unwrap(),
            ("alpha".to_string(), "0.5".to_string())
        );
        assert_eq!(
            parse_key_val("msg=a=b").unwrap(),
            ("msg".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("no-separator").is_err());
        assert!(parse_key_val("=value").is_err());
    }

    #[test]
    fn test_parse_backend_config_inline_json() {
        let config = parse_backend_config(r#"{"queue": "gpu"}"#).unwrap();
        assert!(matches!(config, BackendConfig::Inline(_)));

        assert!(parse_backend_config("not json, not a file").is_err());
    }

    #[test]
    fn test_parse_backend_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, r#"{"queue": "cpu"}"#).unwrap();

        let config = parse_backend_config(path.to_str().unwrap()).unwrap();
        assert!(matches!(config, BackendConfig::File(_)));
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "skiff",
            "run",
            "https://github.com/example/project#training",
            "-e",
            "main",
            "-P",
            "alpha=0.5",
            "-P",
            "data=/tmp/data.csv",
            "--experiment-id",
            "7",
            "--no-provision",
            "--detach",
        ])
        .unwrap();

        let Commands::Run {
            uri,
            entry_point,
            params,
            experiment_id,
            no_provision,
            detach,
            ..
        } = cli.command;
        assert_eq!(uri, "https://github.com/example/project#training");
        assert_eq!(entry_point, "main");
        assert_eq!(params.len(), 2);
        assert_eq!(experiment_id.as_deref(), Some("7"));
        assert!(no_provision);
        assert!(detach);
    }

    #[test]
    fn test_cli_rejects_conflicting_experiment_selectors() {
        let result = Cli::try_parse_from([
            "skiff",
            "run",
            "/tmp/proj",
            "--experiment-name",
            "training",
            "--experiment-id",
            "7",
        ]);
        assert!(result.is_err());
    }
}
