use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one per-ticker analysis job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Handed to the external worker pool, awaiting its completion callback
    Dispatched,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Dispatched => "dispatched",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of asynchronous, per-ticker decision work delegated to an external worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub ticker: String,
    /// Opaque handle into the external worker; None between the persisted
    /// dispatch record and the worker's acknowledgment.
    pub job_id: Option<String>,
    pub status: JobStatus,
    /// Decision payload, opaque to the coordinator
    pub result: Option<serde_json::Value>,
    /// Present iff status is Failed
    pub error: Option<String>,
    pub dispatched_at: DateTime<Utc>,
}

impl AnalysisJob {
    /// Fresh job record, persisted before the external dispatch call
    pub fn dispatched(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            job_id: None,
            status: JobStatus::Dispatched,
            result: None,
            error: None,
            dispatched_at: Utc::now(),
        }
    }

    /// A ticker with a job in this state must not be dispatched again
    pub fn blocks_redispatch(&self) -> bool {
        matches!(self.status, JobStatus::Dispatched | JobStatus::Succeeded)
    }

    pub fn mark_succeeded(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Succeeded;
        self.result = Some(result);
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.error = Some(error.to_string());
    }
}
