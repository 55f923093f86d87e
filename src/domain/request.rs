use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{RebalanceError, Result};

use super::action::{OpportunityEvaluation, TradeAction};
use super::constraints::ResolvedConstraints;
use super::job::{AnalysisJob, JobStatus};
use super::snapshot::PortfolioSnapshot;

/// Rebalance request state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Created, constraints not yet evaluated against drift
    Pending,
    /// Threshold evaluation in progress
    Evaluating,
    /// Waiting on the opportunity-scoring worker
    Filtering,
    /// Analysis jobs dispatched, awaiting completion callbacks
    Analyzing,
    /// All jobs terminal, result set being assembled
    Aggregating,
    /// Decision synthesis in progress
    Finalizing,
    /// Trade actions produced; terminal
    Completed,
    /// Canceled at a checkpoint boundary; terminal
    Canceled,
    /// Synthesis or dispatch failed; retryable via retry-rebalance
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Evaluating => "evaluating",
            RequestStatus::Filtering => "filtering",
            RequestStatus::Analyzing => "analyzing",
            RequestStatus::Aggregating => "aggregating",
            RequestStatus::Finalizing => "finalizing",
            RequestStatus::Completed => "completed",
            RequestStatus::Canceled => "canceled",
            RequestStatus::Failed => "failed",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: RequestStatus) -> bool {
        use RequestStatus::*;

        match (self, target) {
            // Any non-terminal state can cancel or fail at a checkpoint
            (s, Canceled) if !s.is_terminal() => true,
            (s, Failed) if !s.is_terminal() => true,

            (Pending, Evaluating) => true,

            // Threshold met or bypassed → straight to dispatch
            (Evaluating, Analyzing) => true,
            (Evaluating, Filtering) => true,

            (Filtering, Analyzing) => true,
            // Empty selection short-circuits past dispatch
            (Filtering, Aggregating) => true,

            (Analyzing, Aggregating) => true,

            (Aggregating, Finalizing) => true,
            (Finalizing, Completed) => true,

            // Retry re-dispatches the incomplete subset
            (Failed, Analyzing) => true,
            (Analyzing, Analyzing) => true,

            _ => false,
        }
    }

    /// Terminal states are final; a new request is required to re-run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Canceled | RequestStatus::Failed
        )
    }

}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for RequestStatus {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "evaluating" => Ok(RequestStatus::Evaluating),
            "filtering" => Ok(RequestStatus::Filtering),
            "analyzing" => Ok(RequestStatus::Analyzing),
            "aggregating" => Ok(RequestStatus::Aggregating),
            "finalizing" => Ok(RequestStatus::Finalizing),
            "completed" => Ok(RequestStatus::Completed),
            "canceled" => Ok(RequestStatus::Canceled),
            "failed" => Ok(RequestStatus::Failed),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Outcome of one completion callback (ticker, success flag, result-or-error)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub ticker: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Disposition of a completion callback against the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDisposition {
    /// The matching job was marked terminal
    Applied,
    /// Duplicate or late callback; dropped without effect
    Discarded,
}

/// The aggregate root: one user-triggered rebalance run.
///
/// Mutated exclusively through the coordination engine; every mutation is
/// persisted whole through a version-checked write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceRequest {
    pub id: Uuid,
    pub user_id: String,
    pub status: RequestStatus,
    pub constraints: ResolvedConstraints,
    /// Portfolio view captured at creation; dispatch and retry reuse it
    pub snapshot: PortfolioSnapshot,
    /// Ordered set of tickers eligible before filtering
    pub candidate_tickers: Vec<String>,
    /// Subset chosen for analysis; immutable once dispatch begins
    pub selected_tickers: Vec<String>,
    /// Keyed by ticker
    pub analysis_jobs: HashMap<String, AnalysisJob>,
    pub opportunity_evaluation: Option<OpportunityEvaluation>,
    pub trade_actions: Vec<TradeAction>,
    pub failure_reason: Option<String>,
    pub is_canceled: bool,
    /// Optimistic-lock version; incremented by the store on every write
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RebalanceRequest {
    pub fn new(
        user_id: &str,
        candidate_tickers: Vec<String>,
        snapshot: PortfolioSnapshot,
        constraints: ResolvedConstraints,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            status: RequestStatus::Pending,
            constraints,
            snapshot,
            candidate_tickers,
            selected_tickers: Vec::new(),
            analysis_jobs: HashMap::new(),
            opportunity_evaluation: None,
            trade_actions: Vec::new(),
            failure_reason: None,
            is_canceled: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Guarded state transition; bumps updated_at
    pub fn transition_to(&mut self, target: RequestStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(RebalanceError::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Fix the analysis ticker set. Must be a subset of the candidates and
    /// can only happen before any job has been dispatched.
    pub fn select_tickers(&mut self, selected: Vec<String>) -> Result<()> {
        if !self.analysis_jobs.is_empty() {
            return Err(RebalanceError::Internal(
                "ticker selection is immutable once dispatch begins".to_string(),
            ));
        }
        if let Some(t) = selected
            .iter()
            .find(|t| !self.candidate_tickers.contains(t))
        {
            return Err(RebalanceError::Validation(format!(
                "selected ticker {} is not a candidate",
                t
            )));
        }
        self.selected_tickers = selected;
        self.touch();
        Ok(())
    }

    /// Tickers that still need a dispatch: no job yet, or a failed one
    pub fn tickers_needing_dispatch(&self) -> Vec<String> {
        self.selected_tickers
            .iter()
            .filter(|t| {
                self.analysis_jobs
                    .get(*t)
                    .map_or(true, |job| !job.blocks_redispatch())
            })
            .cloned()
            .collect()
    }

    /// Record a dispatch intent for a ticker, before the external call is made
    pub fn record_dispatch(&mut self, ticker: &str) -> Result<()> {
        if !self.selected_tickers.iter().any(|t| t == ticker) {
            return Err(RebalanceError::Internal(format!(
                "dispatch for unselected ticker {}",
                ticker
            )));
        }
        if let Some(existing) = self.analysis_jobs.get(ticker) {
            if existing.blocks_redispatch() {
                return Err(RebalanceError::Internal(format!(
                    "ticker {} already has a {} job",
                    ticker, existing.status
                )));
            }
        }
        self.analysis_jobs
            .insert(ticker.to_string(), AnalysisJob::dispatched(ticker));
        self.touch();
        Ok(())
    }

    /// Attach the worker's opaque job handle after a successful dispatch call
    pub fn record_job_handle(&mut self, ticker: &str, job_id: &str) -> Result<()> {
        let job = self.analysis_jobs.get_mut(ticker).ok_or_else(|| {
            RebalanceError::Internal(format!("handle for unknown job {}", ticker))
        })?;
        job.job_id = Some(job_id.to_string());
        self.touch();
        Ok(())
    }

    /// Record a dispatch-call failure; the job goes terminal immediately
    pub fn record_dispatch_failure(&mut self, ticker: &str, error: &str) {
        if let Some(job) = self.analysis_jobs.get_mut(ticker) {
            job.mark_failed(error);
            self.touch();
        }
    }

    /// Apply one completion callback. Unknown tickers and already-terminal
    /// jobs are discarded: the external workers do not guarantee single
    /// delivery, and retry can supersede an in-flight job.
    pub fn apply_completion(&mut self, outcome: &AnalysisOutcome) -> CallbackDisposition {
        let Some(job) = self.analysis_jobs.get_mut(&outcome.ticker) else {
            return CallbackDisposition::Discarded;
        };
        if job.status.is_terminal() {
            return CallbackDisposition::Discarded;
        }
        if outcome.success {
            job.mark_succeeded(outcome.result.clone().unwrap_or(serde_json::Value::Null));
        } else {
            job.mark_failed(outcome.error.as_deref().unwrap_or("analysis failed"));
        }
        self.touch();
        CallbackDisposition::Applied
    }

    /// Every selected ticker has a terminal job status
    pub fn all_jobs_terminal(&self) -> bool {
        self.selected_tickers.iter().all(|t| {
            self.analysis_jobs
                .get(t)
                .is_some_and(|job| job.status.is_terminal())
        })
    }

    pub fn succeeded_jobs(&self) -> Vec<&AnalysisJob> {
        self.selected_tickers
            .iter()
            .filter_map(|t| self.analysis_jobs.get(t))
            .filter(|j| j.status == JobStatus::Succeeded)
            .collect()
    }

    pub fn failed_jobs(&self) -> Vec<&AnalysisJob> {
        self.selected_tickers
            .iter()
            .filter_map(|t| self.analysis_jobs.get(t))
            .filter(|j| j.status == JobStatus::Failed)
            .collect()
    }

    /// Progress counter for the persisted row
    pub fn stocks_analyzed(&self) -> usize {
        self.analysis_jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .count()
    }

    /// Fail every job still `Dispatched` whose dispatch is older than the
    /// staleness window. Returns how many jobs were failed.
    pub fn fail_stale_jobs(&mut self, window: chrono::Duration) -> usize {
        let cutoff = Utc::now() - window;
        let mut failed = 0;
        for job in self.analysis_jobs.values_mut() {
            if job.status == JobStatus::Dispatched && job.dispatched_at < cutoff {
                job.mark_failed("no completion callback within staleness window");
                failed += 1;
            }
        }
        if failed > 0 {
            self.touch();
        }
        failed
    }

    /// Cancel at a checkpoint boundary. Sets the flag and, unless the request
    /// is already terminal, moves status to Canceled.
    pub fn mark_canceled(&mut self) {
        self.is_canceled = true;
        if !self.status.is_terminal() {
            self.status = RequestStatus::Canceled;
        }
        self.touch();
    }

    pub fn mark_failed(&mut self, reason: &str) -> Result<()> {
        self.failure_reason = Some(reason.to_string());
        self.transition_to(RequestStatus::Failed)
    }
}
