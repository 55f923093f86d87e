//! Reconciliation sweep
//!
//! Completion callbacks are the primary path; this background task is the
//! safety net for the ones lost in transit. At a low frequency it re-reads
//! every still-running request and routes a reconcile action through the
//! normal mailbox path, so the per-request critical section holds for sweep
//! work too.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::Result;

use super::coordinator::Coordinator;

pub struct Reconciler {
    coordinator: Coordinator,
    interval: Duration,
    staleness: chrono::Duration,
}

impl Reconciler {
    pub fn new(coordinator: Coordinator, config: &EngineConfig) -> Self {
        Self {
            coordinator,
            interval: Duration::from_secs(config.reconcile_interval_secs),
            staleness: chrono::Duration::seconds(config.staleness_window_secs as i64),
        }
    }

    /// One pass over every non-terminal request. Returns how many were swept.
    pub async fn sweep_once(&self) -> Result<usize> {
        let active = self.coordinator.engine().store.list_active().await?;
        let count = active.len();
        debug!(requests = count, "reconciliation sweep");

        for request in active {
            if let Err(e) = self
                .coordinator
                .reconcile_request(request.id, self.staleness)
                .await
            {
                // One broken request must not starve the rest of the sweep
                error!(request_id = %request.id, error = %e, "reconcile failed");
            }
        }
        Ok(count)
    }

    /// Run sweeps forever at the configured interval
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            staleness_secs = self.staleness.num_seconds(),
            "reconciler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so startup isn't a sweep
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "reconciliation sweep failed");
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConstraintDefaults;
    use crate::domain::{
        PortfolioSnapshot, RawConstraints, RequestStatus, RoleLimits, TickerDrift,
    };
    use crate::engine::coordinator::{Engine, StartRebalance};
    use crate::store::{InMemoryRequestStore, RequestStore};
    use crate::workers::{
        AnalysisWorker, MockAnalysisWorker, MockOpportunityScorer, MockSynthesizer, ScorerScript,
        StaticRoleLimits,
    };
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn coordinator() -> (Coordinator, Arc<InMemoryRequestStore>) {
        let store = Arc::new(InMemoryRequestStore::new());
        let engine = Arc::new(Engine {
            store: Arc::clone(&store) as Arc<dyn RequestStore>,
            analysis: Arc::new(MockAnalysisWorker::new()) as Arc<dyn AnalysisWorker>,
            scorer: Arc::new(MockOpportunityScorer::new(ScorerScript::Defer)),
            synthesizer: Arc::new(MockSynthesizer::new()),
            roles: Arc::new(StaticRoleLimits::new(RoleLimits {
                max_tickers: 10,
                rebalance_access: true,
                opportunity_agent_access: true,
            })),
            config: EngineConfig::default(),
            defaults: ConstraintDefaults::default(),
        });
        (Coordinator::new(engine), store)
    }

    fn start_cmd(ticker: &str, drift: rust_decimal::Decimal) -> StartRebalance {
        StartRebalance {
            user_id: "user-1".to_string(),
            tickers: vec![ticker.to_string()],
            snapshot: PortfolioSnapshot {
                positions: vec![TickerDrift {
                    ticker: ticker.to_string(),
                    drift_pct: drift,
                }],
                market_context: None,
            },
            constraints: RawConstraints::default(),
        }
    }

    #[tokio::test]
    async fn sweep_closes_a_request_with_lost_callbacks() {
        let (coordinator, store) = coordinator();
        let reconciler = Reconciler::new(
            coordinator.clone(),
            &EngineConfig {
                staleness_window_secs: 0,
                ..EngineConfig::default()
            },
        );

        // High drift → dispatched immediately; then no callback ever arrives
        let outcome = coordinator
            .start_rebalance(start_cmd("AAPL", dec!(20)))
            .await
            .unwrap();
        assert_eq!(outcome.status, RequestStatus::Analyzing);

        let swept = reconciler.sweep_once().await.unwrap();
        assert_eq!(swept, 1);

        // Zero staleness window: the dispatched job is failed and the
        // request finalized with that failure recorded
        let req = store.get(outcome.request_id).await.unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Completed);
        assert_eq!(req.failed_jobs().len(), 1);
    }

    #[tokio::test]
    async fn sweep_fails_open_a_stale_filter_wait() {
        let (coordinator, store) = coordinator();
        let reconciler = Reconciler::new(
            coordinator.clone(),
            &EngineConfig {
                staleness_window_secs: 0,
                ..EngineConfig::default()
            },
        );

        let outcome = coordinator
            .start_rebalance(start_cmd("AAPL", dec!(1)))
            .await
            .unwrap();
        assert_eq!(outcome.status, RequestStatus::Filtering);

        reconciler.sweep_once().await.unwrap();

        let req = store.get(outcome.request_id).await.unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Analyzing);
        let eval = req.opportunity_evaluation.unwrap();
        assert!(eval.error.is_some());
        assert_eq!(eval.selected, vec!["AAPL"]);
    }

    #[tokio::test]
    async fn sweep_skips_terminal_requests() {
        let (coordinator, _) = coordinator();
        let reconciler = Reconciler::new(coordinator.clone(), &EngineConfig::default());

        let outcome = coordinator
            .start_rebalance(start_cmd("AAPL", dec!(1)))
            .await
            .unwrap();
        coordinator.cancel_rebalance(outcome.request_id).await.unwrap();

        let swept = reconciler.sweep_once().await.unwrap();
        assert_eq!(swept, 0);
    }
}
