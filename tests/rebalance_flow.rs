//! End-to-end flows through the coordinator and the action API, backed by
//! the in-memory store and scripted worker doubles.

use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use rebalancer::config::{ConstraintDefaults, EngineConfig};
use rebalancer::domain::{
    AnalysisOutcome, CallbackDisposition, JobStatus, PortfolioSnapshot, RawConstraints,
    RebalanceRequest, RequestStatus, RoleLimits, TickerDrift, TradeAction, TradeSide,
};
use rebalancer::engine::{Coordinator, Engine, StartRebalance};
use rebalancer::error::{RebalanceError, Result};
use rebalancer::store::{InMemoryRequestStore, RequestStore};
use rebalancer::workers::{
    AnalysisWorker, DecisionSynthesizer, MockAnalysisWorker, MockOpportunityScorer,
    MockSynthesizer, ScorerScript, StaticRoleLimits,
};

struct Harness {
    coordinator: Coordinator,
    store: Arc<InMemoryRequestStore>,
    worker: Arc<MockAnalysisWorker>,
    scorer: Arc<MockOpportunityScorer>,
    synthesizer: Arc<MockSynthesizer>,
}

fn harness(script: ScorerScript) -> Harness {
    harness_with(script, EngineConfig::default())
}

fn harness_with(script: ScorerScript, config: EngineConfig) -> Harness {
    let store = Arc::new(InMemoryRequestStore::new());
    let worker = Arc::new(MockAnalysisWorker::new());
    let scorer = Arc::new(MockOpportunityScorer::new(script));
    let synthesizer = Arc::new(MockSynthesizer::new());
    let engine = Arc::new(Engine {
        store: Arc::clone(&store) as Arc<dyn RequestStore>,
        analysis: Arc::clone(&worker) as Arc<dyn AnalysisWorker>,
        scorer: Arc::clone(&scorer) as Arc<dyn rebalancer::workers::OpportunityScorer>,
        synthesizer: Arc::clone(&synthesizer) as Arc<dyn DecisionSynthesizer>,
        roles: Arc::new(StaticRoleLimits::new(RoleLimits {
            max_tickers: 10,
            rebalance_access: true,
            opportunity_agent_access: true,
        })),
        config,
        defaults: ConstraintDefaults::default(),
    });
    Harness {
        coordinator: Coordinator::new(engine),
        store,
        worker,
        scorer,
        synthesizer,
    }
}

fn start_cmd(drifts: &[(&str, rust_decimal::Decimal)]) -> StartRebalance {
    StartRebalance {
        user_id: "user-1".to_string(),
        tickers: drifts.iter().map(|(t, _)| t.to_string()).collect(),
        snapshot: PortfolioSnapshot {
            positions: drifts
                .iter()
                .map(|(t, d)| TickerDrift {
                    ticker: t.to_string(),
                    drift_pct: *d,
                })
                .collect(),
            market_context: None,
        },
        constraints: RawConstraints::default(),
    }
}

fn success(ticker: &str) -> AnalysisOutcome {
    AnalysisOutcome {
        ticker: ticker.to_string(),
        success: true,
        result: Some(serde_json::json!({"action": "buy", "confidence": 0.8})),
        error: None,
    }
}

fn failure(ticker: &str) -> AnalysisOutcome {
    AnalysisOutcome {
        ticker: ticker.to_string(),
        success: false,
        result: None,
        error: Some("model error".to_string()),
    }
}

async fn stored(h: &Harness, id: Uuid) -> RebalanceRequest {
    h.store.get(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn low_drift_filters_candidates_before_dispatch() {
    let h = harness(ScorerScript::Select(vec!["AAPL".to_string()]));

    let outcome = h
        .coordinator
        .start_rebalance(start_cmd(&[("AAPL", dec!(3)), ("MSFT", dec!(2))]))
        .await
        .unwrap();
    assert_eq!(outcome.status, RequestStatus::Analyzing);
    assert_eq!(h.scorer.call_count(), 1);
    assert_eq!(h.worker.dispatches_for("AAPL"), 1);
    assert_eq!(h.worker.dispatches_for("MSFT"), 0);

    let outcome = h
        .coordinator
        .analysis_completed(outcome.request_id, success("AAPL"))
        .await
        .unwrap();
    assert_eq!(outcome.status, RequestStatus::Completed);

    let req = stored(&h, outcome.request_id).await;
    assert_eq!(req.trade_actions.len(), 1);
    assert_eq!(req.trade_actions[0].ticker, "AAPL");
    assert_eq!(req.trade_actions[0].side, TradeSide::Buy);
    let eval = req.opportunity_evaluation.unwrap();
    assert!(eval.error.is_none());
    assert!(eval.reasons.contains_key("MSFT"));
}

#[tokio::test]
async fn high_drift_bypasses_the_opportunity_gateway() {
    let h = harness(ScorerScript::Select(vec![]));

    let outcome = h
        .coordinator
        .start_rebalance(start_cmd(&[("AAPL", dec!(12)), ("MSFT", dec!(2))]))
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Analyzing);
    assert_eq!(h.scorer.call_count(), 0);
    assert_eq!(h.worker.dispatch_count(), 2);

    let req = stored(&h, outcome.request_id).await;
    assert_eq!(req.selected_tickers, req.candidate_tickers);
    assert!(req.opportunity_evaluation.is_none());
}

#[tokio::test(start_paused = true)]
async fn gateway_timeout_fails_open_to_the_full_candidate_set() {
    let h = harness_with(
        ScorerScript::Hang,
        EngineConfig {
            opportunity_timeout_secs: 1,
            ..EngineConfig::default()
        },
    );

    let outcome = h
        .coordinator
        .start_rebalance(start_cmd(&[("AAPL", dec!(3)), ("MSFT", dec!(2))]))
        .await
        .unwrap();

    assert_eq!(outcome.status, RequestStatus::Analyzing);
    assert_eq!(h.worker.dispatch_count(), 2);

    let req = stored(&h, outcome.request_id).await;
    let eval = req.opportunity_evaluation.unwrap();
    assert!(eval.error.is_some());
    assert_eq!(eval.selected, req.candidate_tickers);
}

#[tokio::test]
async fn partial_analysis_failure_still_completes() {
    let h = harness(ScorerScript::Select(vec![]));

    let outcome = h
        .coordinator
        .start_rebalance(start_cmd(&[
            ("AAPL", dec!(15)),
            ("MSFT", dec!(14)),
            ("NVDA", dec!(13)),
        ]))
        .await
        .unwrap();
    let id = outcome.request_id;

    h.coordinator
        .analysis_completed(id, success("AAPL"))
        .await
        .unwrap();
    h.coordinator
        .analysis_completed(id, failure("MSFT"))
        .await
        .unwrap();
    let outcome = h
        .coordinator
        .analysis_completed(id, success("NVDA"))
        .await
        .unwrap();
    assert_eq!(outcome.status, RequestStatus::Completed);

    let req = stored(&h, id).await;
    assert!(req.failure_reason.is_none());
    assert_eq!(req.trade_actions.len(), 3);
    let msft: &TradeAction = req
        .trade_actions
        .iter()
        .find(|a| a.ticker == "MSFT")
        .unwrap();
    assert_eq!(msft.side, TradeSide::Hold);
    assert_eq!(req.succeeded_jobs().len(), 2);
    assert_eq!(req.failed_jobs().len(), 1);
}

#[tokio::test]
async fn cancel_during_analysis_wins_over_late_callbacks() {
    let h = harness(ScorerScript::Select(vec![]));

    let outcome = h
        .coordinator
        .start_rebalance(start_cmd(&[("AAPL", dec!(15)), ("MSFT", dec!(14))]))
        .await
        .unwrap();
    let id = outcome.request_id;

    h.coordinator
        .analysis_completed(id, success("AAPL"))
        .await
        .unwrap();

    let outcome = h.coordinator.cancel_rebalance(id).await.unwrap();
    assert_eq!(outcome.status, RequestStatus::Canceled);

    // Late callback is recorded for bookkeeping but never advances the run
    let outcome = h
        .coordinator
        .analysis_completed(id, success("MSFT"))
        .await
        .unwrap();
    assert_eq!(outcome.status, RequestStatus::Canceled);
    assert_eq!(outcome.disposition, Some(CallbackDisposition::Applied));

    let req = stored(&h, id).await;
    assert_eq!(req.status, RequestStatus::Canceled);
    assert_eq!(req.stocks_analyzed(), 2);
    assert!(req.trade_actions.is_empty());
    assert_eq!(h.synthesizer.call_count(), 0);

    let err = h.coordinator.complete_rebalance(id).await.unwrap_err();
    assert!(matches!(err, RebalanceError::Canceled(_)));
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let h = harness(ScorerScript::Defer);

    let outcome = h
        .coordinator
        .start_rebalance(start_cmd(&[("AAPL", dec!(3))]))
        .await
        .unwrap();
    let id = outcome.request_id;

    let first = h.coordinator.cancel_rebalance(id).await.unwrap();
    let second = h.coordinator.cancel_rebalance(id).await.unwrap();
    assert_eq!(first.status, RequestStatus::Canceled);
    assert_eq!(second.status, RequestStatus::Canceled);

    let err = h.coordinator.retry_rebalance(id).await.unwrap_err();
    assert!(matches!(err, RebalanceError::Canceled(_)));
}

#[tokio::test]
async fn duplicate_callbacks_are_idempotent_end_to_end() {
    let h = harness(ScorerScript::Select(vec![]));

    let outcome = h
        .coordinator
        .start_rebalance(start_cmd(&[("AAPL", dec!(15)), ("MSFT", dec!(14))]))
        .await
        .unwrap();
    let id = outcome.request_id;

    let first = h
        .coordinator
        .analysis_completed(id, success("AAPL"))
        .await
        .unwrap();
    assert_eq!(first.disposition, Some(CallbackDisposition::Applied));

    let dup = h
        .coordinator
        .analysis_completed(id, success("AAPL"))
        .await
        .unwrap();
    assert_eq!(dup.disposition, Some(CallbackDisposition::Discarded));
    assert_eq!(dup.status, RequestStatus::Analyzing);

    let last = h
        .coordinator
        .analysis_completed(id, success("MSFT"))
        .await
        .unwrap();
    assert_eq!(last.status, RequestStatus::Completed);
    assert_eq!(h.synthesizer.call_count(), 1);

    // Redelivery after completion changes nothing
    let late = h
        .coordinator
        .analysis_completed(id, failure("MSFT"))
        .await
        .unwrap();
    assert_eq!(late.disposition, Some(CallbackDisposition::Discarded));
    assert_eq!(late.status, RequestStatus::Completed);
    assert_eq!(h.synthesizer.call_count(), 1);
}

#[tokio::test]
async fn skip_threshold_check_forces_full_analysis() {
    let h = harness(ScorerScript::Select(vec!["AAPL".to_string()]));

    let mut cmd = start_cmd(&[("AAPL", dec!(1)), ("MSFT", dec!(1))]);
    cmd.constraints.skip_threshold_check = Some(true);
    // Explicitly asking for filtering loses the tie-break
    cmd.constraints.skip_opportunity_agent = Some(false);

    let outcome = h.coordinator.start_rebalance(cmd).await.unwrap();
    assert_eq!(outcome.status, RequestStatus::Analyzing);
    assert_eq!(h.scorer.call_count(), 0);
    assert_eq!(h.worker.dispatch_count(), 2);
}

/// Analysis worker double whose first dispatch for selected tickers fails,
/// with every later attempt succeeding.
struct FlakyWorker {
    fail_first: HashSet<String>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl FlakyWorker {
    fn new(fail_first: &[&str]) -> Self {
        Self {
            fail_first: fail_first.iter().map(|t| t.to_string()).collect(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn attempts_for(&self, ticker: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(ticker)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl AnalysisWorker for FlakyWorker {
    async fn dispatch(
        &self,
        _request_id: Uuid,
        ticker: &str,
        _snapshot: &PortfolioSnapshot,
        _constraints: &rebalancer::domain::ResolvedConstraints,
    ) -> Result<String> {
        let mut attempts = self.attempts.lock().unwrap();
        let n = attempts.entry(ticker.to_string()).or_insert(0);
        *n += 1;
        if *n == 1 && self.fail_first.contains(ticker) {
            return Err(RebalanceError::ExternalWorker(format!(
                "worker unreachable for {}",
                ticker
            )));
        }
        Ok(format!("job-{}-{}", ticker, n))
    }
}

/// Synthesizer double that fails its first call and succeeds afterwards
struct FlakySynthesizer {
    failed_once: AtomicBool,
    inner: MockSynthesizer,
}

impl FlakySynthesizer {
    fn new() -> Self {
        Self {
            failed_once: AtomicBool::new(false),
            inner: MockSynthesizer::new(),
        }
    }
}

#[async_trait]
impl DecisionSynthesizer for FlakySynthesizer {
    async fn synthesize(&self, request: &RebalanceRequest) -> Result<Vec<TradeAction>> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(RebalanceError::Synthesis(
                "sizing model unavailable".to_string(),
            ));
        }
        self.inner.synthesize(request).await
    }
}

fn harness_with_doubles(
    worker: Arc<dyn AnalysisWorker>,
    synthesizer: Arc<dyn DecisionSynthesizer>,
) -> (Coordinator, Arc<InMemoryRequestStore>) {
    let store = Arc::new(InMemoryRequestStore::new());
    let engine = Arc::new(Engine {
        store: Arc::clone(&store) as Arc<dyn RequestStore>,
        analysis: worker,
        scorer: Arc::new(MockOpportunityScorer::new(ScorerScript::Select(vec![]))),
        synthesizer,
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

#[tokio::test]
async fn retry_redispatches_only_the_incomplete_subset() {
    let worker = Arc::new(FlakyWorker::new(&["MSFT"]));
    let (coordinator, store) =
        harness_with_doubles(Arc::clone(&worker) as Arc<dyn AnalysisWorker>, Arc::new(MockSynthesizer::new()));

    let outcome = coordinator
        .start_rebalance(start_cmd(&[("AAPL", dec!(15)), ("MSFT", dec!(14))]))
        .await
        .unwrap();
    let id = outcome.request_id;
    assert_eq!(outcome.status, RequestStatus::Analyzing);

    // The refused dispatch is a terminal failed job; AAPL is still in flight
    let req = store.get(id).await.unwrap().unwrap();
    assert_eq!(req.analysis_jobs["MSFT"].status, JobStatus::Failed);
    assert_eq!(req.analysis_jobs["AAPL"].status, JobStatus::Dispatched);

    let outcome = coordinator.retry_rebalance(id).await.unwrap();
    assert_eq!(outcome.status, RequestStatus::Analyzing);
    assert_eq!(worker.attempts_for("MSFT"), 2);
    assert_eq!(worker.attempts_for("AAPL"), 1);

    let req = store.get(id).await.unwrap().unwrap();
    assert_eq!(req.analysis_jobs["MSFT"].status, JobStatus::Dispatched);

    coordinator
        .analysis_completed(id, success("AAPL"))
        .await
        .unwrap();
    let outcome = coordinator
        .analysis_completed(id, success("MSFT"))
        .await
        .unwrap();
    assert_eq!(outcome.status, RequestStatus::Completed);

    let req = store.get(id).await.unwrap().unwrap();
    assert_eq!(req.succeeded_jobs().len(), 2);
    assert_eq!(req.trade_actions.len(), 2);
}

#[tokio::test]
async fn retry_after_synthesis_failure_completes() {
    let (coordinator, store) = harness_with_doubles(
        Arc::new(MockAnalysisWorker::new()),
        Arc::new(FlakySynthesizer::new()),
    );

    let outcome = coordinator
        .start_rebalance(start_cmd(&[("AAPL", dec!(15))]))
        .await
        .unwrap();
    let id = outcome.request_id;

    let outcome = coordinator
        .analysis_completed(id, success("AAPL"))
        .await
        .unwrap();
    assert_eq!(outcome.status, RequestStatus::Failed);

    let req = store.get(id).await.unwrap().unwrap();
    assert!(req
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("sizing model unavailable"));

    let outcome = coordinator.retry_rebalance(id).await.unwrap();
    assert_eq!(outcome.status, RequestStatus::Completed);

    let req = store.get(id).await.unwrap().unwrap();
    assert!(req.failure_reason.is_none());
    assert_eq!(req.trade_actions.len(), 1);
    // The succeeded job was never re-dispatched
    assert_eq!(req.analysis_jobs["AAPL"].status, JobStatus::Succeeded);
}

mod http {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use rebalancer::api::{create_router, AppState};
    use tower::ServiceExt;

    fn router(h: &Harness) -> axum::Router {
        create_router(AppState {
            coordinator: h.coordinator.clone(),
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn start_body() -> serde_json::Value {
        serde_json::json!({
            "user_id": "user-1",
            "tickers": ["AAPL", "MSFT"],
            "portfolio_snapshot": {
                "positions": [
                    {"ticker": "AAPL", "drift_pct": "15"},
                    {"ticker": "MSFT", "drift_pct": "2"}
                ]
            }
        })
    }

    #[tokio::test]
    async fn start_and_get_roundtrip() {
        let h = harness(ScorerScript::Select(vec![]));
        let app = router(&h);

        let response = app
            .clone()
            .oneshot(post_json("/api/rebalance", start_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "analyzing");
        let id = body["request_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/rebalance/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["request"]["status"], "analyzing");
        assert_eq!(body["request"]["user_id"], "user-1");
    }

    #[tokio::test]
    async fn validation_error_maps_to_400() {
        let h = harness(ScorerScript::Select(vec![]));
        let body = serde_json::json!({"user_id": "user-1", "tickers": []});

        let response = router(&h)
            .oneshot(post_json("/api/rebalance", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("ticker"));
    }

    #[tokio::test]
    async fn unknown_request_maps_to_404() {
        let h = harness(ScorerScript::Select(vec![]));

        let response = router(&h)
            .oneshot(
                Request::builder()
                    .uri(format!("/api/rebalance/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn canceled_request_gets_the_canceled_envelope() {
        let h = harness(ScorerScript::Defer);
        let app = router(&h);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/rebalance",
                serde_json::json!({
                    "user_id": "user-1",
                    "tickers": ["AAPL"],
                    "portfolio_snapshot": {
                        "positions": [{"ticker": "AAPL", "drift_pct": "2"}]
                    }
                }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "filtering");
        let id = body["request_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/rebalance/{}/cancel", id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json(
                &format!("/api/rebalance/{}/complete", id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["canceled"], true);
        assert!(body["message"].as_str().is_some());
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn completion_callback_over_http() {
        let h = harness(ScorerScript::Select(vec![]));
        let app = router(&h);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/rebalance",
                serde_json::json!({
                    "user_id": "user-1",
                    "tickers": ["AAPL"],
                    "portfolio_snapshot": {
                        "positions": [{"ticker": "AAPL", "drift_pct": "15"}]
                    }
                }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let id = body["request_id"].as_str().unwrap().to_string();

        let callback = serde_json::json!({
            "ticker": "AAPL",
            "success": true,
            "result": {"action": "buy"}
        });
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/rebalance/{}/analysis-completed", id),
                callback.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["applied"], true);

        // Duplicate delivery is acknowledged but discarded
        let response = app
            .oneshot(post_json(
                &format!("/api/rebalance/{}/analysis-completed", id),
                callback,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["applied"], false);
    }

    #[tokio::test]
    async fn health_endpoint() {
        let h = harness(ScorerScript::Select(vec![]));
        let response = router(&h)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }
}
