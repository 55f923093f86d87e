use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{
    AnalysisOutcome, OpportunityEvaluation, PortfolioSnapshot, RawConstraints,
};
use crate::engine::{Coordinator, StartRebalance};

use super::envelope::{ApiResult, Envelope};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
}

#[derive(Debug, Deserialize)]
pub struct StartRebalanceBody {
    pub user_id: String,
    pub tickers: Vec<String>,
    #[serde(default)]
    pub portfolio_snapshot: PortfolioSnapshot,
    #[serde(default)]
    pub constraints: RawConstraints,
}

/// POST /api/rebalance
pub async fn start_rebalance(
    State(state): State<AppState>,
    Json(body): Json<StartRebalanceBody>,
) -> ApiResult {
    let result = state
        .coordinator
        .start_rebalance(StartRebalance {
            user_id: body.user_id,
            tickers: body.tickers,
            snapshot: body.portfolio_snapshot,
            constraints: body.constraints,
        })
        .await;
    ApiResult(result.map(|o| Envelope::ok(&o)))
}

/// GET /api/rebalance/:id
pub async fn get_rebalance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult {
    let result = state.coordinator.get_rebalance(id).await;
    ApiResult(result.map(Envelope::with_request))
}

#[derive(Debug, Deserialize)]
pub struct AnalysisCompletedBody {
    pub ticker: String,
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// POST /api/rebalance/:id/analysis-completed
pub async fn analysis_completed(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AnalysisCompletedBody>,
) -> ApiResult {
    let outcome = AnalysisOutcome {
        ticker: body.ticker,
        success: body.success,
        result: body.result,
        error: body.error,
    };
    let result = state.coordinator.analysis_completed(id, outcome).await;
    ApiResult(result.map(|o| Envelope::ok(&o)))
}

#[derive(Debug, Deserialize)]
pub struct OpportunityCompletedBody {
    pub evaluation: OpportunityEvaluation,
}

/// POST /api/rebalance/:id/opportunity-completed
pub async fn opportunity_completed(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<OpportunityCompletedBody>,
) -> ApiResult {
    let result = state
        .coordinator
        .opportunity_completed(id, body.evaluation)
        .await;
    ApiResult(result.map(|o| Envelope::ok(&o)))
}

/// POST /api/rebalance/:id/retry
pub async fn retry_rebalance(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let result = state.coordinator.retry_rebalance(id).await;
    ApiResult(result.map(|o| Envelope::ok(&o)))
}

/// POST /api/rebalance/:id/complete
pub async fn complete_rebalance(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let result = state.coordinator.complete_rebalance(id).await;
    ApiResult(result.map(|o| Envelope::ok(&o)))
}

/// POST /api/rebalance/:id/cancel
pub async fn cancel_rebalance(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let result = state.coordinator.cancel_rebalance(id).await;
    ApiResult(result.map(|o| Envelope::ok(&o)))
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
