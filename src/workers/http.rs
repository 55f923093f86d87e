//! HTTP-backed worker clients
//!
//! Each external worker is a JSON-over-HTTP service. Calls carry their own
//! request timeout, distinct from any engine-level deadline.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::domain::{
    OpportunityEvaluation, PortfolioSnapshot, RebalanceRequest, ResolvedConstraints, TradeAction,
};
use crate::error::{RebalanceError, Result};

use super::traits::{AnalysisWorker, DecisionSynthesizer, OpportunityScorer, ScoreOutcome};

/// Shared reqwest client against the configured worker endpoints
#[derive(Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
    config: WorkerConfig,
}

impl HttpWorkerClient {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    request_id: Uuid,
    ticker: &'a str,
    snapshot: &'a PortfolioSnapshot,
    constraints: &'a ResolvedConstraints,
}

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    job_id: String,
}

#[async_trait]
impl AnalysisWorker for HttpWorkerClient {
    async fn dispatch(
        &self,
        request_id: Uuid,
        ticker: &str,
        snapshot: &PortfolioSnapshot,
        constraints: &ResolvedConstraints,
    ) -> Result<String> {
        let url = format!("{}/analyze", self.config.analysis_url);
        let body = DispatchRequest {
            request_id,
            ticker,
            snapshot,
            constraints,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RebalanceError::ExternalWorker(format!("analysis dispatch: {}", e)))?;

        if !resp.status().is_success() {
            return Err(RebalanceError::ExternalWorker(format!(
                "analysis worker returned {} for {}",
                resp.status(),
                ticker
            )));
        }

        let parsed: DispatchResponse = resp
            .json()
            .await
            .map_err(|e| RebalanceError::ExternalWorker(format!("analysis response: {}", e)))?;
        debug!(%request_id, ticker, job_id = %parsed.job_id, "analysis job dispatched");
        Ok(parsed.job_id)
    }
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    request_id: Uuid,
    candidates: &'a [String],
    market_context: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    #[serde(default)]
    deferred: bool,
    #[serde(default)]
    selected: Vec<String>,
    #[serde(default)]
    reasons: HashMap<String, String>,
}

#[async_trait]
impl OpportunityScorer for HttpWorkerClient {
    async fn score(
        &self,
        request_id: Uuid,
        candidates: &[String],
        market_context: Option<&serde_json::Value>,
    ) -> Result<ScoreOutcome> {
        let url = format!("{}/score", self.config.opportunity_url);
        let body = ScoreRequest {
            request_id,
            candidates,
            market_context,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RebalanceError::ExternalWorker(format!("opportunity score: {}", e)))?;

        if !resp.status().is_success() {
            return Err(RebalanceError::ExternalWorker(format!(
                "opportunity worker returned {}",
                resp.status()
            )));
        }

        let parsed: ScoreResponse = resp
            .json()
            .await
            .map_err(|e| RebalanceError::ExternalWorker(format!("opportunity response: {}", e)))?;

        if parsed.deferred {
            return Ok(ScoreOutcome::Deferred);
        }
        Ok(ScoreOutcome::Completed(OpportunityEvaluation {
            selected: parsed.selected,
            reasons: parsed.reasons,
            error: None,
            evaluated_at: Utc::now(),
        }))
    }
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    request_id: Uuid,
    constraints: &'a ResolvedConstraints,
    results: Vec<SynthesizeInput<'a>>,
}

#[derive(Debug, Serialize)]
struct SynthesizeInput<'a> {
    ticker: &'a str,
    succeeded: bool,
    result: Option<&'a serde_json::Value>,
    error: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SynthesizeResponse {
    actions: Vec<TradeAction>,
}

#[async_trait]
impl DecisionSynthesizer for HttpWorkerClient {
    async fn synthesize(&self, request: &RebalanceRequest) -> Result<Vec<TradeAction>> {
        let url = format!("{}/synthesize", self.config.synthesis_url);
        let results: Vec<SynthesizeInput<'_>> = request
            .selected_tickers
            .iter()
            .filter_map(|t| request.analysis_jobs.get(t))
            .map(|job| SynthesizeInput {
                ticker: &job.ticker,
                succeeded: job.status == crate::domain::JobStatus::Succeeded,
                result: job.result.as_ref(),
                error: job.error.as_deref(),
            })
            .collect();
        let body = SynthesizeRequest {
            request_id: request.id,
            constraints: &request.constraints,
            results,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RebalanceError::Synthesis(format!("synthesis call: {}", e)))?;

        if !resp.status().is_success() {
            return Err(RebalanceError::Synthesis(format!(
                "synthesis worker returned {}",
                resp.status()
            )));
        }

        let parsed: SynthesizeResponse = resp
            .json()
            .await
            .map_err(|e| RebalanceError::Synthesis(format!("synthesis response: {}", e)))?;
        Ok(parsed.actions)
    }
}
