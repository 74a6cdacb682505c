//! Project manifest loading and entry-point resolution.
//!
//! A project may carry a `skiff.yaml` manifest declaring its execution
//! environment and entry points. Projects without one still run: a
//! `conda.yaml` alongside the sources implies a conda environment, and
//! `.py`/`.sh` files are runnable as implicit entry points.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use skiff_env::EnvironmentSpec;

use crate::command::shell_quote;
use crate::error::{Result, SkiffError};
use crate::uri::absolute_path;

/// Manifest filename looked up at the project root.
pub const MANIFEST_FILENAME: &str = "skiff.yaml";

/// Conda spec implied when no manifest declares an environment.
pub const DEFAULT_CONDA_SPEC: &str = "conda.yaml";

/// Declared type of an entry-point parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Float,
    Int,
    Path,
    Uri,
}

impl ParamType {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "string" => Ok(ParamType::String),
            "float" => Ok(ParamType::Float),
            "int" => Ok(ParamType::Int),
            "path" => Ok(ParamType::Path),
            "uri" => Ok(ParamType::Uri),
            other => Err(SkiffError::Config(format!(
                "unsupported parameter type '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Float => "float",
            ParamType::Int => "int",
            ParamType::Path => "path",
            ParamType::Uri => "uri",
        }
    }
}

/// A declared entry-point parameter: a type plus an optional default.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub ty: ParamType,
    pub default: Option<String>,
}

impl ParameterSpec {
    /// Type-check a supplied value. Path existence is deferred to
    /// [`EntryPoint::compute_parameters`], where the value is resolved.
    fn check_value(&self, key: &str, value: &str) -> Result<()> {
        match self.ty {
            ParamType::Float => {
                value.parse::<f64>().map_err(|_| {
                    SkiffError::Config(format!(
                        "parameter '{key}' must be a float, got '{value}'"
                    ))
                })?;
            }
            ParamType::Int => {
                value.parse::<i64>().map_err(|_| {
                    SkiffError::Config(format!(
                        "parameter '{key}' must be an int, got '{value}'"
                    ))
                })?;
            }
            ParamType::String | ParamType::Path | ParamType::Uri => {}
        }
        Ok(())
    }
}

/// An entry point: a command template and its declared parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPoint {
    pub name: String,
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub command: String,
}

impl EntryPoint {
    /// Validate user parameters against the declaration: every declared
    /// parameter without a default must be supplied, and supplied values
    /// must parse as their declared type. Undeclared parameters are
    /// accepted; they are forwarded as extra command-line options.
    pub fn validate_parameters(&self, user: &BTreeMap<String, String>) -> Result<()> {
        let missing: Vec<&str> = self
            .parameters
            .iter()
            .filter(|(key, spec)| spec.default.is_none() && !user.contains_key(*key))
            .map(|(key, _)| key.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(SkiffError::Config(format!(
                "no value given for parameter(s): {}",
                missing.join(", ")
            )));
        }

        for (key, value) in user {
            if let Some(spec) = self.parameters.get(key) {
                spec.check_value(key, value)?;
            }
        }
        Ok(())
    }

    /// Resolve the final parameter values: declared parameters with user
    /// values or defaults applied and path values absolutized, plus the
    /// undeclared extras passed through verbatim.
    pub fn compute_parameters(
        &self,
        user: &BTreeMap<String, String>,
    ) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>)> {
        self.validate_parameters(user)?;

        let mut resolved = BTreeMap::new();
        for (key, spec) in &self.parameters {
            let raw = user
                .get(key)
                .cloned()
                .or_else(|| spec.default.clone())
                .ok_or_else(|| {
                    SkiffError::Config(format!("no value given for parameter(s): {key}"))
                })?;
            let value = match spec.ty {
                ParamType::Path => resolve_path_value(key, &raw)?,
                _ => raw,
            };
            resolved.insert(key.clone(), value);
        }

        let extras: BTreeMap<String, String> = user
            .iter()
            .filter(|(key, _)| !self.parameters.contains_key(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok((resolved, extras))
    }

    /// Render the launch command for this entry point: placeholder
    /// substitution with shell quoting, followed by the extra parameters
    /// as `--key value` options.
    pub fn compute_command(&self, user: &BTreeMap<String, String>) -> Result<String> {
        let (resolved, extras) = self.compute_parameters(user)?;

        let mut command = self.command.clone();
        for (key, value) in &resolved {
            command = command.replace(&format!("{{{key}}}"), &shell_quote(value));
        }
        for (key, value) in &extras {
            command.push_str(&format!(" --{key} {}", shell_quote(value)));
        }
        Ok(command)
    }
}

fn resolve_path_value(key: &str, raw: &str) -> Result<String> {
    if raw.contains("://") {
        return Err(SkiffError::Config(format!(
            "parameter '{key}': remote URIs are not supported for path parameters, got '{raw}'"
        )));
    }
    let path = absolute_path(Path::new(raw));
    if !path.exists() {
        return Err(SkiffError::Config(format!(
            "parameter '{key}': path {} does not exist",
            path.display()
        )));
    }
    Ok(path.display().to_string())
}

/// A loaded project: its declared environment and entry points.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub name: Option<String>,
    pub env: EnvironmentSpec,
    entry_points: BTreeMap<String, EntryPoint>,
}

impl Project {
    /// Load the project at `work_dir`, falling back to an implicit
    /// manifest-less project when no `skiff.yaml` is present.
    pub fn load(work_dir: &Path) -> Result<Self> {
        let manifest_path = work_dir.join(MANIFEST_FILENAME);
        if !manifest_path.is_file() {
            debug!(dir = %work_dir.display(), "no manifest found, using implicit project");
            return Ok(Project {
                name: None,
                env: implicit_env(work_dir),
                entry_points: BTreeMap::new(),
            });
        }

        let contents = std::fs::read_to_string(&manifest_path)?;
        let raw: RawManifest = serde_yaml::from_str(&contents).map_err(|e| {
            SkiffError::Config(format!(
                "invalid manifest {}: {e}",
                manifest_path.display()
            ))
        })?;

        let env = match (raw.conda_env, raw.docker_env) {
            (Some(_), Some(_)) => {
                return Err(SkiffError::Config(
                    "project cannot declare both a conda and a docker environment".to_string(),
                ));
            }
            (Some(conda_env), None) => {
                let spec_path = work_dir.join(&conda_env);
                if !spec_path.is_file() {
                    return Err(SkiffError::Config(format!(
                        "project declares conda environment {conda_env} but {} does not exist",
                        spec_path.display()
                    )));
                }
                EnvironmentSpec::Conda {
                    path: Some(spec_path),
                }
            }
            (None, Some(docker_env)) => {
                let image = docker_env.image.ok_or_else(|| {
                    SkiffError::Config(
                        "docker environment must specify a base image via the 'image' field"
                            .to_string(),
                    )
                })?;
                EnvironmentSpec::Docker { image }
            }
            (None, None) => implicit_env(work_dir),
        };

        let mut entry_points = BTreeMap::new();
        for (name, raw_entry) in raw.entry_points {
            let mut parameters = BTreeMap::new();
            for (key, raw_param) in raw_entry.parameters {
                parameters.insert(key, raw_param.into_spec()?);
            }
            entry_points.insert(
                name.clone(),
                EntryPoint {
                    name,
                    parameters,
                    command: raw_entry.command,
                },
            );
        }

        Ok(Project {
            name: raw.name,
            env,
            entry_points,
        })
    }

    /// Resolve an entry point by name. Undeclared names referring to an
    /// existing `.py` or `.sh` file in the project synthesize a parameterless
    /// entry point running that file.
    pub fn get_entry_point(&self, name: &str, work_dir: &Path) -> Result<EntryPoint> {
        if let Some(entry) = self.entry_points.get(name) {
            return Ok(entry.clone());
        }

        if work_dir.join(name).is_file() {
            if name.ends_with(".py") {
                return Ok(EntryPoint {
                    name: name.to_string(),
                    parameters: BTreeMap::new(),
                    command: format!("python {}", shell_quote(name)),
                });
            }
            if name.ends_with(".sh") {
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string());
                return Ok(EntryPoint {
                    name: name.to_string(),
                    parameters: BTreeMap::new(),
                    command: format!("{shell} {}", shell_quote(name)),
                });
            }
        }

        let mut available: Vec<&str> = self.entry_points.keys().map(String::as_str).collect();
        available.sort_unstable();
        Err(SkiffError::Config(format!(
            "could not find entry point '{name}' in project; declared entry points: [{}]. \
             Undeclared entry points must be existing .py or .sh files within the project",
            available.join(", ")
        )))
    }

    #[cfg(test)]
    pub(crate) fn entry_point_names(&self) -> Vec<&str> {
        self.entry_points.keys().map(String::as_str).collect()
    }
}

/// Environment for a project that declares none: a `conda.yaml` next to the
/// sources implies conda, otherwise the run uses the invoking environment.
fn implicit_env(work_dir: &Path) -> EnvironmentSpec {
    let spec_path = work_dir.join(DEFAULT_CONDA_SPEC);
    if spec_path.is_file() {
        EnvironmentSpec::Conda {
            path: Some(spec_path),
        }
    } else {
        EnvironmentSpec::None
    }
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    conda_env: Option<String>,
    docker_env: Option<RawDockerEnv>,
    #[serde(default)]
    entry_points: BTreeMap<String, RawEntryPoint>,
}

#[derive(Debug, Deserialize)]
struct RawDockerEnv {
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntryPoint {
    #[serde(default)]
    parameters: BTreeMap<String, RawParameter>,
    command: String,
}

/// A parameter declaration is either the shorthand `key: type` or the full
/// `{type, default}` mapping.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawParameter {
    Shorthand(String),
    Full {
        #[serde(rename = "type")]
        ty: Option<String>,
        default: Option<serde_yaml::Value>,
    },
}

impl RawParameter {
    fn into_spec(self) -> Result<ParameterSpec> {
        match self {
            RawParameter::Shorthand(ty) => Ok(ParameterSpec {
                ty: ParamType::parse(&ty)?,
                default: None,
            }),
            RawParameter::Full { ty, default } => Ok(ParameterSpec {
                ty: ty
                    .as_deref()
                    .map(ParamType::parse)
                    .transpose()?
                    .unwrap_or(ParamType::String),
                default: default.as_ref().map(yaml_scalar_to_string),
            }),
        }
    }
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MANIFEST: &str = r#"
name: classifier
conda_env: conda.yaml
entry_points:
  main:
    parameters:
      alpha: float
      data:
        type: path
      epochs:
        type: int
        default: 10
      label: {type: string, default: baseline}
    command: "python train.py --alpha {alpha} --data {data} --epochs {epochs} --label {label}"
  short:
    command: "python short.py"
"#;

    fn project_dir(manifest: &str) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILENAME), manifest).unwrap();
        std::fs::write(dir.path().join("conda.yaml"), "dependencies: [python]\n").unwrap();
        dir
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_load_manifest() {
        let dir = project_dir(MANIFEST);
        let project = Project::load(dir.path()).unwrap();

        assert_eq!(project.name.as_deref(), Some("classifier"));
        assert!(matches!(project.env, EnvironmentSpec::Conda { path: Some(_) }));
        assert_eq!(project.entry_point_names(), vec!["main", "short"]);

        let main = project.get_entry_point("main", dir.path()).unwrap();
        assert_eq!(main.parameters["alpha"].ty, ParamType::Float);
        assert_eq!(main.parameters["epochs"].default.as_deref(), Some("10"));
        assert_eq!(main.parameters["label"].default.as_deref(), Some("baseline"));
    }

    #[test]
    fn test_missing_manifest_with_conda_yaml_implies_conda() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("conda.yaml"), "dependencies: [python]\n").unwrap();

        let project = Project::load(dir.path()).unwrap();
        assert!(matches!(project.env, EnvironmentSpec::Conda { path: Some(_) }));
    }

    #[test]
    fn test_missing_manifest_without_conda_yaml() {
        let dir = tempdir().unwrap();
        let project = Project::load(dir.path()).unwrap();
        assert_eq!(project.env, EnvironmentSpec::None);
    }

    #[test]
    fn test_docker_env_requires_image() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILENAME),
            "docker_env:\n  volumes: []\nentry_points:\n  main:\n    command: \"true\"\n",
        )
        .unwrap();

        let err = Project::load(dir.path()).expect_err("image is required");
        assert!(matches!(err, SkiffError::Config(_)));
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn test_conda_and_docker_env_conflict() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILENAME),
            "conda_env: conda.yaml\ndocker_env:\n  image: python:3.11\n",
        )
        .unwrap();

        let err = Project::load(dir.path()).expect_err("conflicting environments");
        assert!(matches!(err, SkiffError::Config(_)));
    }

    #[test]
    fn test_declared_conda_spec_must_exist() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILENAME), "conda_env: missing.yaml\n").unwrap();

        let err = Project::load(dir.path()).expect_err("missing conda spec");
        assert!(matches!(err, SkiffError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_float() {
        let dir = project_dir(MANIFEST);
        let project = Project::load(dir.path()).unwrap();
        let main = project.get_entry_point("main", dir.path()).unwrap();

        let err = main
            .validate_parameters(&params(&[("alpha", "bad"), ("data", "/tmp")]))
            .expect_err("non-numeric float");
        assert!(matches!(err, SkiffError::Config(_)));
        assert!(err.to_string().contains("alpha"));
    }

    #[test]
    fn test_validate_reports_missing_parameters() {
        let dir = project_dir(MANIFEST);
        let project = Project::load(dir.path()).unwrap();
        let main = project.get_entry_point("main", dir.path()).unwrap();

        let err = main
            .validate_parameters(&params(&[]))
            .expect_err("alpha and data are required");
        let message = err.to_string();
        assert!(message.contains("alpha"));
        assert!(message.contains("data"));
    }

    #[test]
    fn test_compute_command_substitutes_and_appends_extras() {
        let dir = project_dir(MANIFEST);
        let data = dir.path().join("data.csv");
        std::fs::write(&data, "1,2\n").unwrap();

        let project = Project::load(dir.path()).unwrap();
        let main = project.get_entry_point("main", dir.path()).unwrap();

        let command = main
            .compute_command(&params(&[
                ("alpha", "0.5"),
                ("data", data.to_str().unwrap()),
                ("tag", "my run"),
            ]))
            .unwrap();

        assert!(command.starts_with("python train.py --alpha 0.5 --data "));
        assert!(command.contains(&data.display().to_string()));
        assert!(command.contains("--epochs 10"));
        assert!(command.contains("--label baseline"));
        assert!(command.ends_with("--tag 'my run'"));
    }

    #[test]
    fn test_path_parameter_must_exist() {
        let dir = project_dir(MANIFEST);
        let project = Project::load(dir.path()).unwrap();
        let main = project.get_entry_point("main", dir.path()).unwrap();

        let err = main
            .compute_command(&params(&[("alpha", "0.5"), ("data", "/no/such/file")]))
            .expect_err("missing path value");
        assert!(matches!(err, SkiffError::Config(_)));
    }

    #[test]
    fn test_remote_path_parameter_rejected() {
        let dir = project_dir(MANIFEST);
        let project = Project::load(dir.path()).unwrap();
        let main = project.get_entry_point("main", dir.path()).unwrap();

        let err = main
            .compute_command(&params(&[
                ("alpha", "0.5"),
                ("data", "s3://bucket/data.csv"),
            ]))
            .expect_err("remote path value");
        assert!(matches!(err, SkiffError::Config(_)));
    }

    #[test]
    fn test_implicit_script_entry_points() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("etl.py"), "print('etl')\n").unwrap();
        std::fs::write(dir.path().join("run.sh"), "echo run\n").unwrap();

        let project = Project::load(dir.path()).unwrap();
        let py = project.get_entry_point("etl.py", dir.path()).unwrap();
        assert_eq!(py.command, "python etl.py");

        let sh = project.get_entry_point("run.sh", dir.path()).unwrap();
        assert!(sh.command.ends_with(" run.sh"));

        let err = project
            .get_entry_point("missing", dir.path())
            .expect_err("unknown entry point");
        assert!(matches!(err, SkiffError::Config(_)));
    }
}
