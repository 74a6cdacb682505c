//! REST tracking client.
//!
//! Speaks the tracking service's JSON API under `/api/2.0/`. The base URI
//! comes from configuration or the `SKIFF_TRACKING_URI` environment variable.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    Result, RunRecord, RunStatus, TrackingClient, TrackingError, TRACKING_URI_ENV_VAR,
};

const DEFAULT_TRACKING_URI: &str = "http://localhost:5000";

/// HTTP client against the tracking service's REST API.
pub struct RestTracking {
    base_uri: String,
    http: reqwest::Client,
}

impl RestTracking {
    /// Create a client against the given base URI.
    pub fn new(base_uri: &str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("skiff-tracking/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");

        RestTracking {
            base_uri: base_uri.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Create a client from `SKIFF_TRACKING_URI`, defaulting to localhost.
    pub fn from_env() -> Self {
        let uri = std::env::var(TRACKING_URI_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_TRACKING_URI.to_string());
        Self::new(&uri)
    }

    /// Base URI this client reports to.
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/2.0/{}", self.base_uri, path)
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = self.endpoint(path);
        debug!(url = %url, "tracking POST");
        let response = self.http.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TrackingError::Service(format!("{url}: {status}: {text}")));
        }
        Ok(response.json::<R>().await?)
    }

    async fn get<R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<R> {
        let url = self.endpoint(path);
        debug!(url = %url, "tracking GET");
        let response = self.http.get(&url).query(query).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TrackingError::Service(format!("{url}: not found")));
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TrackingError::Service(format!("{url}: {status}: {text}")));
        }
        Ok(response.json::<R>().await?)
    }
}

#[derive(Serialize)]
struct CreateRunRequest<'a> {
    experiment_id: &'a str,
    tags: Vec<KeyValue>,
}

#[derive(Serialize, Deserialize)]
struct KeyValue {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct RunResponse {
    run: RunPayload,
}

#[derive(Deserialize)]
struct RunPayload {
    run_id: String,
    experiment_id: String,
    status: RunStatus,
    start_time: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    tags: Vec<KeyValue>,
    #[serde(default)]
    params: Vec<KeyValue>,
}

impl From<RunPayload> for RunRecord {
    fn from(payload: RunPayload) -> Self {
        let collect = |pairs: Vec<KeyValue>| -> BTreeMap<String, String> {
            pairs.into_iter().map(|kv| (kv.key, kv.value)).collect()
        };
        RunRecord {
            run_id: payload.run_id,
            experiment_id: payload.experiment_id,
            status: payload.status,
            started_at: payload.start_time,
            tags: collect(payload.tags),
            params: collect(payload.params),
        }
    }
}

#[derive(Serialize)]
struct SetTagRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct LogParamRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct UpdateRunRequest<'a> {
    run_id: &'a str,
    status: RunStatus,
}

#[derive(Deserialize)]
struct ExperimentResponse {
    experiment: ExperimentPayload,
}

#[derive(Deserialize)]
struct ExperimentPayload {
    experiment_id: String,
}

#[derive(Deserialize)]
struct Empty {}

#[async_trait]
impl TrackingClient for RestTracking {
    async fn create_run(
        &self,
        experiment_id: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<RunRecord> {
        let request = CreateRunRequest {
            experiment_id,
            tags: tags
                .into_iter()
                .map(|(key, value)| KeyValue { key, value })
                .collect(),
        };
        let response: RunResponse = self.post("runs/create", &request).await?;
        Ok(response.run.into())
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        let response: RunResponse = self
            .get("runs/get", &[("run_id", run_id)])
            .await
            .map_err(|e| match e {
                TrackingError::Service(msg) if msg.contains("not found") => {
                    TrackingError::RunNotFound(run_id.to_string())
                }
                other => other,
            })?;
        Ok(response.run.into())
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: Empty = self
            .post("runs/set-tag", &SetTagRequest { run_id, key, value })
            .await?;
        Ok(())
    }

    async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let _: Empty = self
            .post("runs/log-parameter", &LogParamRequest { run_id, key, value })
            .await?;
        Ok(())
    }

    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let _: Empty = self
            .post("runs/update", &UpdateRunRequest { run_id, status })
            .await?;
        Ok(())
    }

    async fn experiment_id_by_name(&self, name: &str) -> Result<String> {
        let response: ExperimentResponse = self
            .get("experiments/get-by-name", &[("experiment_name", name)])
            .await
            .map_err(|e| match e {
                TrackingError::Service(msg) if msg.contains("not found") => {
                    TrackingError::ExperimentNotFound(name.to_string())
                }
                other => other,
            })?;
        Ok(response.experiment.experiment_id)
    }
}
