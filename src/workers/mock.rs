//! Scripted in-process worker doubles for tests and dry runs

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    JobStatus, OpportunityEvaluation, PortfolioSnapshot, RebalanceRequest, ResolvedConstraints,
    TradeAction, TradeSide,
};
use crate::error::{RebalanceError, Result};

use super::traits::{AnalysisWorker, DecisionSynthesizer, OpportunityScorer, ScoreOutcome};

/// Analysis worker double: hands out sequential job ids and records dispatches
#[derive(Default)]
pub struct MockAnalysisWorker {
    counter: AtomicUsize,
    /// Tickers whose dispatch call should fail
    pub fail_tickers: HashSet<String>,
    /// Every (request_id, ticker) pair that reached the worker
    pub dispatched: Mutex<Vec<(Uuid, String)>>,
}

impl MockAnalysisWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(tickers: &[&str]) -> Self {
        Self {
            fail_tickers: tickers.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    pub fn dispatches_for(&self, ticker: &str) -> usize {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| t == ticker)
            .count()
    }
}

#[async_trait]
impl AnalysisWorker for MockAnalysisWorker {
    async fn dispatch(
        &self,
        request_id: Uuid,
        ticker: &str,
        _snapshot: &PortfolioSnapshot,
        _constraints: &ResolvedConstraints,
    ) -> Result<String> {
        if self.fail_tickers.contains(ticker) {
            return Err(RebalanceError::ExternalWorker(format!(
                "dispatch refused for {}",
                ticker
            )));
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((request_id, ticker.to_string()));
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("job-{}", n))
    }
}

/// Behavior of the scripted opportunity scorer
#[derive(Debug, Clone)]
pub enum ScorerScript {
    /// Return this selection synchronously
    Select(Vec<String>),
    /// Accept the job; the test delivers opportunity-completed itself
    Defer,
    /// Return a worker error
    Fail(String),
    /// Never answer, to exercise the gateway timeout
    Hang,
}

pub struct MockOpportunityScorer {
    script: ScorerScript,
    pub calls: AtomicUsize,
}

impl MockOpportunityScorer {
    pub fn new(script: ScorerScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpportunityScorer for MockOpportunityScorer {
    async fn score(
        &self,
        _request_id: Uuid,
        candidates: &[String],
        _market_context: Option<&serde_json::Value>,
    ) -> Result<ScoreOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            ScorerScript::Select(selected) => {
                let reasons: HashMap<String, String> = candidates
                    .iter()
                    .map(|t| {
                        let verdict = if selected.contains(t) {
                            "prioritized"
                        } else {
                            "below opportunity bar"
                        };
                        (t.clone(), verdict.to_string())
                    })
                    .collect();
                Ok(ScoreOutcome::Completed(OpportunityEvaluation {
                    selected: selected.clone(),
                    reasons,
                    error: None,
                    evaluated_at: Utc::now(),
                }))
            }
            ScorerScript::Defer => Ok(ScoreOutcome::Deferred),
            ScorerScript::Fail(reason) => {
                Err(RebalanceError::ExternalWorker(reason.clone()))
            }
            ScorerScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("scripted hang outlived the test")
            }
        }
    }
}

/// Synthesizer double: one buy per succeeded job sized at the minimum
/// position, holds for failed jobs; optionally fails outright
#[derive(Default)]
pub struct MockSynthesizer {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionSynthesizer for MockSynthesizer {
    async fn synthesize(&self, request: &RebalanceRequest) -> Result<Vec<TradeAction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RebalanceError::Synthesis(
                "scripted synthesis failure".to_string(),
            ));
        }
        let actions = request
            .selected_tickers
            .iter()
            .filter_map(|t| request.analysis_jobs.get(t))
            .map(|job| {
                if job.status == JobStatus::Succeeded {
                    TradeAction {
                        ticker: job.ticker.clone(),
                        side: TradeSide::Buy,
                        quantity: None,
                        notional_usd: Some(
                            request
                                .constraints
                                .min_position_size
                                .max(Decimal::ZERO),
                        ),
                        rationale: Some("mock sizing".to_string()),
                    }
                } else {
                    TradeAction {
                        ticker: job.ticker.clone(),
                        side: TradeSide::Hold,
                        quantity: None,
                        notional_usd: None,
                        rationale: job.error.clone(),
                    }
                }
            })
            .collect();
        Ok(actions)
    }
}
