//! PostgreSQL request store
//!
//! One row per `RebalanceRequest`; analysis jobs, constraints, the
//! opportunity evaluation, and trade actions live in JSONB columns so the
//! aggregate is always written whole under a single version check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{RebalanceRequest, RequestStatus};
use crate::error::{RebalanceError, Result};

use super::RequestStore;

#[derive(Clone)]
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_request(row: &sqlx::postgres::PgRow) -> Result<RebalanceRequest> {
        let status_str: String = row.get("status");
        let status = RequestStatus::try_from(status_str.as_str())
            .map_err(RebalanceError::Internal)?;

        let opportunity_evaluation: Option<serde_json::Value> = row.get("opportunity_evaluation");
        let opportunity_evaluation = opportunity_evaluation
            .map(serde_json::from_value)
            .transpose()?;

        let created_at: DateTime<Utc> = row.get("created_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");

        Ok(RebalanceRequest {
            id: row.get("id"),
            user_id: row.get("user_id"),
            status,
            constraints: serde_json::from_value(row.get("constraints"))?,
            snapshot: serde_json::from_value(row.get("snapshot"))?,
            candidate_tickers: row.get("candidate_tickers"),
            selected_tickers: row.get("selected_tickers"),
            analysis_jobs: serde_json::from_value(row.get("analysis_jobs"))?,
            opportunity_evaluation,
            trade_actions: serde_json::from_value(row.get("trade_actions"))?,
            failure_reason: row.get("failure_reason"),
            is_canceled: row.get("is_canceled"),
            version: row.get("version"),
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn insert(&self, request: &RebalanceRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rebalance_requests (
                id, user_id, status, constraints, snapshot,
                candidate_tickers, selected_tickers, analysis_jobs,
                opportunity_evaluation, trade_actions, failure_reason,
                is_canceled, total_stocks, stocks_analyzed, version,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(request.id)
        .bind(&request.user_id)
        .bind(request.status.as_str())
        .bind(serde_json::to_value(&request.constraints)?)
        .bind(serde_json::to_value(&request.snapshot)?)
        .bind(&request.candidate_tickers)
        .bind(&request.selected_tickers)
        .bind(serde_json::to_value(&request.analysis_jobs)?)
        .bind(
            request
                .opportunity_evaluation
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(serde_json::to_value(&request.trade_actions)?)
        .bind(&request.failure_reason)
        .bind(request.is_canceled)
        .bind(request.selected_tickers.len() as i32)
        .bind(request.stocks_analyzed() as i32)
        .bind(request.version)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(request_id = %request.id, "inserted rebalance request");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RebalanceRequest>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, status, constraints, snapshot,
                   candidate_tickers, selected_tickers, analysis_jobs,
                   opportunity_evaluation, trade_actions, failure_reason,
                   is_canceled, version, created_at, updated_at
            FROM rebalance_requests
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_request).transpose()
    }

    async fn update(&self, request: &mut RebalanceRequest) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE rebalance_requests
            SET status = $3,
                selected_tickers = $4,
                analysis_jobs = $5,
                opportunity_evaluation = $6,
                trade_actions = $7,
                failure_reason = $8,
                is_canceled = $9,
                total_stocks = $10,
                stocks_analyzed = $11,
                version = version + 1,
                updated_at = $12
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(request.id)
        .bind(request.version)
        .bind(request.status.as_str())
        .bind(&request.selected_tickers)
        .bind(serde_json::to_value(&request.analysis_jobs)?)
        .bind(
            request
                .opportunity_evaluation
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(serde_json::to_value(&request.trade_actions)?)
        .bind(&request.failure_reason)
        .bind(request.is_canceled)
        .bind(request.selected_tickers.len() as i32)
        .bind(request.stocks_analyzed() as i32)
        .bind(request.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match result {
            Some(row) => {
                request.version = row.get("version");
                Ok(())
            }
            None => Err(RebalanceError::Internal(format!(
                "version conflict for request {} at version {}",
                request.id, request.version
            ))),
        }
    }

    async fn list_active(&self) -> Result<Vec<RebalanceRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, status, constraints, snapshot,
                   candidate_tickers, selected_tickers, analysis_jobs,
                   opportunity_evaluation, trade_actions, failure_reason,
                   is_canceled, version, created_at, updated_at
            FROM rebalance_requests
            WHERE status NOT IN ('completed', 'canceled', 'failed')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_request).collect()
    }
}
