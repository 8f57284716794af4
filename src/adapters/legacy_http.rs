//! HTTP adapter for the legacy provisioning API.
//!
//! The legacy system exposes a small job API:
//! - `POST {endpoint}/jobs` starts a job (deduplicated by `Idempotency-Key`)
//! - `GET {endpoint}/jobs/{job_id}` reports its state
//! - `GET {endpoint}/jobs?action_id={id}` lists jobs started for an action

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{dispatch_key, Handle, ProgressReport, ProvisioningBackend};
use crate::domain::{Action, ActionId, ResourceOutcome};

/// Connection settings for the legacy API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyHttpConfig {
    pub endpoint: String,
    pub token: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Request body for starting a job
#[derive(Debug, Serialize)]
struct StartJobRequest<'a> {
    action_id: ActionId,
    command: &'a str,
    server_id: i64,
}

/// Job record as returned by the legacy API
#[derive(Debug, Deserialize)]
struct JobResponse {
    job_id: String,
    state: JobState,
    #[serde(default)]
    progress: Option<u8>,
    #[serde(default)]
    ipv4_address: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobListResponse {
    jobs: Vec<JobResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobResponse {
    fn into_report(self) -> ProgressReport {
        match self.state {
            JobState::Queued => ProgressReport::InProgress(0),
            JobState::Running => ProgressReport::InProgress(self.progress.unwrap_or(0).min(100)),
            JobState::Succeeded => ProgressReport::Done(ResourceOutcome {
                ipv4_address: self.ipv4_address,
            }),
            JobState::Failed => ProgressReport::Failed(
                self.error
                    .unwrap_or_else(|| "legacy job failed without a reason".to_string()),
            ),
        }
    }
}

/// Legacy provisioning API client
pub struct LegacyHttpBackend {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl LegacyHttpBackend {
    pub fn new(config: LegacyHttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build legacy API HTTP client")?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Legacy API {} failed with {}: {}", what, status, body.trim());
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse legacy API {} response", what))
    }
}

#[async_trait]
impl ProvisioningBackend for LegacyHttpBackend {
    fn name(&self) -> &str {
        "legacy-http"
    }

    async fn start_provisioning(&self, action: &Action) -> Result<Handle> {
        let body = StartJobRequest {
            action_id: action.id,
            command: action.kind.as_str(),
            server_id: action.target_server_id,
        };

        let response = self
            .authorize(self.client.post(self.url("jobs")))
            .header("Idempotency-Key", dispatch_key(action))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to start legacy job for action {}", action.id))?;

        let job: JobResponse = Self::read_json(response, "start").await?;
        Ok(Handle::new(job.job_id))
    }

    async fn poll_status(&self, handle: &Handle) -> Result<ProgressReport> {
        let response = self
            .authorize(self.client.get(self.url(&format!("jobs/{}", handle))))
            .send()
            .await
            .with_context(|| format!("Failed to poll legacy job {}", handle))?;

        let job: JobResponse = Self::read_json(response, "poll").await?;
        Ok(job.into_report())
    }

    async fn find_handle(&self, action: &Action) -> Result<Option<Handle>> {
        let response = self
            .authorize(self.client.get(self.url("jobs")))
            .query(&[("action_id", action.id)])
            .send()
            .await
            .with_context(|| format!("Failed to list legacy jobs for action {}", action.id))?;

        let list: JobListResponse = Self::read_json(response, "list").await?;
        Ok(list.jobs.into_iter().last().map(|job| Handle::new(job.job_id)))
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .authorize(self.client.get(self.url("health")))
            .send()
            .await
            .context("Failed to reach legacy API")?;

        if !response.status().is_success() {
            anyhow::bail!("Legacy API health check failed: {}", response.status());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(endpoint: &str) -> LegacyHttpBackend {
        LegacyHttpBackend::new(LegacyHttpConfig {
            endpoint: endpoint.to_string(),
            token: Some("secret".to_string()),
            request_timeout_ms: 1000,
        })
        .unwrap()
    }

    #[test]
    fn test_url_joining() {
        let backend = backend("https://legacy.example/api/");
        assert_eq!(backend.url("jobs"), "https://legacy.example/api/jobs");
        assert_eq!(backend.url("/jobs/abc"), "https://legacy.example/api/jobs/abc");
    }

    #[test]
    fn test_job_state_mapping() {
        let running: JobResponse = serde_json::from_str(
            r#"{"job_id": "j1", "state": "running", "progress": 40}"#,
        )
        .unwrap();
        assert_eq!(running.into_report(), ProgressReport::InProgress(40));

        let done: JobResponse = serde_json::from_str(
            r#"{"job_id": "j1", "state": "succeeded", "ipv4_address": "10.0.0.7"}"#,
        )
        .unwrap();
        assert_eq!(
            done.into_report(),
            ProgressReport::Done(ResourceOutcome::with_ipv4("10.0.0.7"))
        );

        let failed: JobResponse =
            serde_json::from_str(r#"{"job_id": "j1", "state": "failed", "error": "quota"}"#)
                .unwrap();
        assert_eq!(failed.into_report(), ProgressReport::Failed("quota".to_string()));

        let queued: JobResponse =
            serde_json::from_str(r#"{"job_id": "j1", "state": "queued"}"#).unwrap();
        assert_eq!(queued.into_report(), ProgressReport::InProgress(0));
    }
}
