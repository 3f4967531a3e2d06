//! Remote agent reached over its HTTP test endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use oracle_client::{LocalAgentBinding, RunHandler};
use reqwest::Client;
use serde::Deserialize;
use shared::{domain::clamp_unit, protocol::ReasoningState};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum HttpAgentError {
    #[error("invalid agent url '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("agent run failed: {0}")]
    RunFailed(String),
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TestRunResponse {
    success: bool,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    final_recommendation: Option<String>,
    #[serde(default)]
    risk_score: Option<f64>,
    #[serde(default)]
    reasoning_steps: usize,
    #[serde(default)]
    tool_calls: usize,
    #[serde(default)]
    backtracks: u32,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpAgent {
    http: Client,
    base_url: Url,
}

impl HttpAgent {
    pub fn new(server_url: &str) -> Result<Self, HttpAgentError> {
        let mut base_url = Url::parse(server_url).map_err(|source| HttpAgentError::InvalidUrl {
            url: server_url.to_string(),
            source,
        })?;
        // Endpoints are joined relative to the base, so its last segment must
        // be a directory.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, HttpAgentError> {
        self.base_url
            .join(path)
            .map_err(|source| HttpAgentError::InvalidUrl {
                url: format!("{}{path}", self.base_url),
                source,
            })
    }

    async fn check_health(&self) -> Result<()> {
        let health: HealthResponse = self
            .http
            .get(self.endpoint("health")?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if health.status != "healthy" {
            warn!(status = %health.status, "agent reports degraded health");
        } else {
            info!(agent = health.agent.as_deref().unwrap_or("unknown"), "agent healthy");
        }
        Ok(())
    }

    async fn run_query(&self, query: &str) -> Result<ReasoningState> {
        let response: TestRunResponse = self
            .http
            .post(self.endpoint("test")?)
            .query(&[("query", query)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("agent returned an unreadable run summary")?;

        info!(
            reasoning_steps = response.reasoning_steps,
            tool_calls = response.tool_calls,
            backtracks = response.backtracks,
            "agent run finished"
        );
        snapshot_from_summary(response, query)
    }
}

fn snapshot_from_summary(response: TestRunResponse, query: &str) -> Result<ReasoningState> {
    if !response.success {
        let message = response
            .error
            .unwrap_or_else(|| "agent reported failure without detail".to_string());
        return Err(HttpAgentError::RunFailed(message).into());
    }

    Ok(ReasoningState {
        query: response.query.unwrap_or_else(|| query.to_string()),
        final_recommendation: response.final_recommendation,
        risk_score: response.risk_score.map(clamp_unit).unwrap_or_default(),
        backtrack_count: response.backtracks,
        ..ReasoningState::default()
    })
}

#[async_trait]
impl RunHandler for HttpAgent {
    async fn run(&self, binding: LocalAgentBinding, query: String) -> Result<()> {
        if let Err(err) = self.check_health().await {
            warn!("agent health check failed: {err:#}");
        }

        binding.set_running(true);
        let outcome = self.run_query(&query).await;
        if let Ok(snapshot) = &outcome {
            binding.publish(snapshot.clone());
        }
        binding.set_running(false);
        outcome.map(|_| ())
    }
}

#[cfg(test)]
#[path = "tests/http_agent_tests.rs"]
mod tests;
