//! External worker seams
//!
//! The engine consumes three opaque collaborators: the per-ticker analysis
//! worker pool, the opportunity-scoring worker, and the portfolio-manager
//! decision routine that does the actual trade sizing. All three are
//! asynchronous and failure-prone; the engine owns the retry/fallback policy.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{
    OpportunityEvaluation, PortfolioSnapshot, RebalanceRequest, ResolvedConstraints, RoleLimits,
    TradeAction,
};
use crate::error::Result;

/// External capability lookup for a caller's role limits
#[async_trait]
pub trait RoleLimitsProvider: Send + Sync {
    async fn limits_for(&self, user_id: &str) -> Result<RoleLimits>;
}

/// Provider handing every caller the same limits; used when role resolution
/// lives upstream of this service
pub struct StaticRoleLimits {
    limits: RoleLimits,
}

impl StaticRoleLimits {
    pub fn new(limits: RoleLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl RoleLimitsProvider for StaticRoleLimits {
    async fn limits_for(&self, _user_id: &str) -> Result<RoleLimits> {
        Ok(self.limits.clone())
    }
}

/// Per-ticker analysis worker pool
#[async_trait]
pub trait AnalysisWorker: Send + Sync {
    /// Dispatch one analysis job; returns the worker's opaque job handle.
    /// Completion arrives later via the analysis-completed callback.
    async fn dispatch(
        &self,
        request_id: Uuid,
        ticker: &str,
        snapshot: &PortfolioSnapshot,
        constraints: &ResolvedConstraints,
    ) -> Result<String>;
}

/// Outcome of an opportunity-scoring call
#[derive(Debug, Clone)]
pub enum ScoreOutcome {
    /// Worker answered synchronously
    Completed(OpportunityEvaluation),
    /// Worker accepted the job and will call opportunity-completed later
    Deferred,
}

/// Opportunity-scoring worker; narrows the candidate set when drift is low
#[async_trait]
pub trait OpportunityScorer: Send + Sync {
    async fn score(
        &self,
        request_id: Uuid,
        candidates: &[String],
        market_context: Option<&serde_json::Value>,
    ) -> Result<ScoreOutcome>;
}

/// Portfolio-manager decision routine that sizes the final trade actions
#[async_trait]
pub trait DecisionSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &RebalanceRequest) -> Result<Vec<TradeAction>>;
}
