//! Coordinator: per-request mailbox actor over the rebalance engine
//!
//! Every action against a request is a message into that request's mailbox;
//! a single consumer task per request id processes messages in arrival
//! order, which is what makes each read-modify-write of the aggregate a
//! critical section. Actions for different requests never contend. The
//! persisted store (not these in-process mailboxes) stays authoritative:
//! every write is version-checked, and mailboxes are respawned lazily from
//! the store after a restart.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConstraintDefaults, EngineConfig};
use crate::domain::{
    resolve, AnalysisOutcome, CallbackDisposition, OpportunityEvaluation, PortfolioSnapshot,
    RawConstraints, RebalanceRequest, RequestStatus,
};
use crate::error::{RebalanceError, Result};
use crate::store::{self, RequestStore};
use crate::workers::{AnalysisWorker, DecisionSynthesizer, OpportunityScorer, RoleLimitsProvider};

use super::opportunity::{self, GatewayOutcome};
use super::{dispatcher, finalizer, retry, threshold, tracker};

/// Everything the engine needs to run one request end to end
pub struct Engine {
    pub store: Arc<dyn RequestStore>,
    pub analysis: Arc<dyn AnalysisWorker>,
    pub scorer: Arc<dyn OpportunityScorer>,
    pub synthesizer: Arc<dyn DecisionSynthesizer>,
    pub roles: Arc<dyn RoleLimitsProvider>,
    pub config: EngineConfig,
    pub defaults: ConstraintDefaults,
}

impl Engine {
    fn opportunity_timeout(&self) -> Duration {
        Duration::from_secs(self.config.opportunity_timeout_secs)
    }

    fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.config.dispatch_timeout_secs)
    }
}

/// start-rebalance payload
#[derive(Debug, Clone)]
pub struct StartRebalance {
    pub user_id: String,
    pub tickers: Vec<String>,
    pub snapshot: PortfolioSnapshot,
    pub constraints: RawConstraints,
}

/// What an action did, independent of transport
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub disposition: Option<CallbackDisposition>,
}

#[derive(Debug, Clone)]
enum RequestAction {
    /// Intake pipeline, queued as the first message of a new request
    Start { force_full_analysis: bool },
    AnalysisCompleted(AnalysisOutcome),
    OpportunityCompleted(OpportunityEvaluation),
    Retry,
    Complete,
    Cancel,
    /// Sweep entry: stale-job cleanup plus the completion check
    Reconcile { staleness: chrono::Duration },
}

struct RequestMessage {
    action: RequestAction,
    reply: oneshot::Sender<Result<ActionOutcome>>,
}

/// Clonable front door to the engine
#[derive(Clone)]
pub struct Coordinator {
    engine: Arc<Engine>,
    mailboxes: Arc<DashMap<Uuid, mpsc::Sender<RequestMessage>>>,
}

impl Coordinator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            mailboxes: Arc::new(DashMap::new()),
        }
    }

    /// Create a request and run resolve → threshold → (gateway) → dispatch.
    /// Returns once dispatch (or deferral) is persisted.
    pub async fn start_rebalance(&self, cmd: StartRebalance) -> Result<ActionOutcome> {
        if cmd.user_id.trim().is_empty() {
            return Err(RebalanceError::Validation("user_id is required".to_string()));
        }
        let tickers = normalize_tickers(&cmd.tickers)?;

        let role = self.engine.roles.limits_for(&cmd.user_id).await?;
        let constraints = resolve(
            &cmd.constraints,
            &role,
            tickers.len(),
            &self.engine.defaults,
        )?;

        // Pure evaluation up front so malformed payloads never leave a row behind
        let force_full_analysis =
            threshold::force_full_analysis(&cmd.snapshot, &tickers, &constraints)?;

        let request = RebalanceRequest::new(&cmd.user_id, tickers, cmd.snapshot, constraints);
        let request_id = request.id;
        self.engine.store.insert(&request).await?;
        info!(
            %request_id,
            user_id = cmd.user_id,
            candidates = request.candidate_tickers.len(),
            force_full_analysis,
            "rebalance request created"
        );

        self.send(request_id, RequestAction::Start { force_full_analysis })
            .await
    }

    /// Completion callback from the analysis worker pool
    pub async fn analysis_completed(
        &self,
        request_id: Uuid,
        outcome: AnalysisOutcome,
    ) -> Result<ActionOutcome> {
        if outcome.ticker.trim().is_empty() {
            return Err(RebalanceError::Validation("ticker is required".to_string()));
        }
        self.send(request_id, RequestAction::AnalysisCompleted(outcome))
            .await
    }

    /// Asynchronous entry for a deferred opportunity worker
    pub async fn opportunity_completed(
        &self,
        request_id: Uuid,
        evaluation: OpportunityEvaluation,
    ) -> Result<ActionOutcome> {
        self.send(request_id, RequestAction::OpportunityCompleted(evaluation))
            .await
    }

    pub async fn retry_rebalance(&self, request_id: Uuid) -> Result<ActionOutcome> {
        self.send(request_id, RequestAction::Retry).await
    }

    /// Idempotent finalization check; also the reconciliation sweep's re-entry
    pub async fn complete_rebalance(&self, request_id: Uuid) -> Result<ActionOutcome> {
        self.send(request_id, RequestAction::Complete).await
    }

    pub async fn cancel_rebalance(&self, request_id: Uuid) -> Result<ActionOutcome> {
        self.send(request_id, RequestAction::Cancel).await
    }

    /// Read-only view, straight from the store
    pub async fn get_rebalance(&self, request_id: Uuid) -> Result<RebalanceRequest> {
        store::require(self.engine.store.as_ref(), request_id).await
    }

    pub(crate) async fn reconcile_request(
        &self,
        request_id: Uuid,
        staleness: chrono::Duration,
    ) -> Result<ActionOutcome> {
        self.send(request_id, RequestAction::Reconcile { staleness })
            .await
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    #[cfg(test)]
    fn mailbox_count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Route an action through the request's mailbox, respawning the worker
    /// from the persisted store if needed.
    async fn send(&self, request_id: Uuid, action: RequestAction) -> Result<ActionOutcome> {
        // One respawn attempt: a worker that exited between lookup and send
        for _ in 0..2 {
            let tx = match self.mailboxes.get(&request_id) {
                Some(entry) => entry.clone(),
                None => self.spawn_worker(request_id).await?,
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            if tx
                .send(RequestMessage {
                    action: action.clone(),
                    reply: reply_tx,
                })
                .await
                .is_err()
            {
                self.mailboxes.remove(&request_id);
                continue;
            }

            let result = reply_rx.await.map_err(|_| {
                RebalanceError::Internal(format!("request worker {} dropped reply", request_id))
            })?;

            // Terminal requests only see idempotent discards and rejections
            // from here on; drop the mailbox (and with it the worker task)
            // and let late actions respawn it if they must.
            if result_is_terminal(&result) {
                self.mailboxes.remove(&request_id);
            }
            return result;
        }
        Err(RebalanceError::Internal(format!(
            "mailbox for request {} kept closing",
            request_id
        )))
    }

    async fn spawn_worker(&self, request_id: Uuid) -> Result<mpsc::Sender<RequestMessage>> {
        // Existence check before spawning for an unknown id
        store::require(self.engine.store.as_ref(), request_id).await?;

        let entry = self.mailboxes.entry(request_id).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.engine.config.mailbox_capacity);
            spawn_request_worker(Arc::clone(&self.engine), request_id, rx);
            tx
        });
        Ok(entry.clone())
    }
}

/// Whether an action's result proves the request is in a terminal status.
/// Rejections carry the status that caused them, so an `Err` reply against
/// a canceled or completed request still releases the mailbox.
fn result_is_terminal(result: &Result<ActionOutcome>) -> bool {
    match result {
        Ok(outcome) => outcome.status.is_terminal(),
        Err(RebalanceError::Canceled(_)) => true,
        Err(RebalanceError::InvalidState { status, .. }) => {
            RequestStatus::try_from(status.as_str())
                .map(|s| s.is_terminal())
                .unwrap_or(false)
        }
        Err(_) => false,
    }
}

fn normalize_tickers(tickers: &[String]) -> Result<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for t in tickers {
        let t = t.trim().to_uppercase();
        if t.is_empty() {
            return Err(RebalanceError::Validation("empty ticker".to_string()));
        }
        if seen.insert(t.clone()) {
            out.push(t);
        }
    }
    if out.is_empty() {
        return Err(RebalanceError::Validation(
            "at least one ticker is required".to_string(),
        ));
    }
    Ok(out)
}

fn spawn_request_worker(engine: Arc<Engine>, request_id: Uuid, mut rx: mpsc::Receiver<RequestMessage>) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let result = handle_action(&engine, request_id, msg.action).await;
            if let Err(e) = &result {
                warn!(%request_id, error = %e, "request action failed");
            }
            if msg.reply.send(result).is_err() {
                debug!(%request_id, "action caller went away before reply");
            }
        }
        debug!(%request_id, "request mailbox drained");
    });
}

async fn handle_action(
    engine: &Engine,
    request_id: Uuid,
    action: RequestAction,
) -> Result<ActionOutcome> {
    let mut request = store::require(engine.store.as_ref(), request_id).await?;
    let mut disposition = None;

    match action {
        RequestAction::Start { force_full_analysis } => {
            run_intake(engine, &mut request, force_full_analysis).await?;
        }
        RequestAction::AnalysisCompleted(outcome) => {
            disposition = Some(
                tracker::record_completion(
                    engine.store.as_ref(),
                    engine.synthesizer.as_ref(),
                    &mut request,
                    &outcome,
                )
                .await?,
            );
        }
        RequestAction::OpportunityCompleted(evaluation) => {
            handle_opportunity_callback(engine, &mut request, evaluation).await?;
        }
        RequestAction::Retry => {
            retry::retry(
                engine.store.as_ref(),
                engine.analysis.as_ref(),
                engine.synthesizer.as_ref(),
                engine.dispatch_timeout(),
                &mut request,
            )
            .await?;
        }
        RequestAction::Complete => {
            if request.is_canceled {
                return Err(RebalanceError::Canceled(format!(
                    "request {} is canceled",
                    request_id
                )));
            }
            finalizer::finalize(
                engine.store.as_ref(),
                engine.synthesizer.as_ref(),
                &mut request,
            )
            .await?;
        }
        RequestAction::Cancel => {
            if request.status == RequestStatus::Completed {
                return Err(RebalanceError::InvalidState {
                    action: "cancel-rebalance".to_string(),
                    status: request.status.to_string(),
                });
            }
            if !request.is_canceled {
                request.mark_canceled();
                engine.store.update(&mut request).await?;
                info!(%request_id, "rebalance canceled");
            }
        }
        RequestAction::Reconcile { staleness } => {
            reconcile(engine, &mut request, staleness).await?;
        }
    }

    Ok(ActionOutcome {
        request_id,
        status: request.status,
        disposition,
    })
}

/// The pipeline after creation: evaluate, optionally filter, dispatch
async fn run_intake(
    engine: &Engine,
    request: &mut RebalanceRequest,
    force_full_analysis: bool,
) -> Result<()> {
    if checkpoint_canceled(engine, request).await? {
        return Ok(());
    }

    request.transition_to(RequestStatus::Evaluating)?;
    engine.store.update(request).await?;

    if force_full_analysis || request.constraints.skip_opportunity_agent {
        let candidates = request.candidate_tickers.clone();
        request.select_tickers(candidates)?;
        engine.store.update(request).await?;

        if checkpoint_canceled(engine, request).await? {
            return Ok(());
        }
        return dispatch_and_check(engine, request).await;
    }

    request.transition_to(RequestStatus::Filtering)?;
    engine.store.update(request).await?;

    match opportunity::filter_candidates(
        engine.scorer.as_ref(),
        engine.opportunity_timeout(),
        request,
    )
    .await
    {
        GatewayOutcome::Evaluated(evaluation) => {
            if checkpoint_canceled(engine, request).await? {
                return Ok(());
            }
            apply_selection(engine, request, evaluation).await
        }
        // Worker will call opportunity-completed; the staleness sweep
        // bounds how long we wait
        GatewayOutcome::Deferred => Ok(()),
    }
}

async fn handle_opportunity_callback(
    engine: &Engine,
    request: &mut RebalanceRequest,
    evaluation: OpportunityEvaluation,
) -> Result<()> {
    if request.is_canceled {
        // Bookkeeping only; the request stays canceled
        request.opportunity_evaluation = Some(evaluation);
        request.touch();
        engine.store.update(request).await?;
        return Ok(());
    }
    if request.status != RequestStatus::Filtering {
        debug!(
            request_id = %request.id,
            status = %request.status,
            "late opportunity callback discarded"
        );
        return Ok(());
    }
    let evaluation =
        opportunity::sanitize_evaluation(request.id, &request.candidate_tickers, evaluation);
    apply_selection(engine, request, evaluation).await
}

/// Record the evaluation, fix the selection, and dispatch (or short-circuit
/// an empty selection straight to finalization)
async fn apply_selection(
    engine: &Engine,
    request: &mut RebalanceRequest,
    evaluation: OpportunityEvaluation,
) -> Result<()> {
    let selected = evaluation.selected.clone();
    request.opportunity_evaluation = Some(evaluation);
    request.select_tickers(selected)?;

    if request.selected_tickers.is_empty() {
        info!(request_id = %request.id, "no tickers worth analyzing; finalizing empty set");
        request.transition_to(RequestStatus::Aggregating)?;
        engine.store.update(request).await?;
        return finalizer::finalize(
            engine.store.as_ref(),
            engine.synthesizer.as_ref(),
            request,
        )
        .await;
    }

    engine.store.update(request).await?;
    dispatch_and_check(engine, request).await
}

/// Dispatch, then re-run the completion check: when every dispatch call
/// fails synchronously there is no callback left to finalize the request.
async fn dispatch_and_check(engine: &Engine, request: &mut RebalanceRequest) -> Result<()> {
    dispatcher::dispatch_analyses(
        engine.store.as_ref(),
        engine.analysis.as_ref(),
        engine.dispatch_timeout(),
        request,
    )
    .await?;

    if request.all_jobs_terminal() {
        finalizer::finalize(
            engine.store.as_ref(),
            engine.synthesizer.as_ref(),
            request,
        )
        .await?;
    }
    Ok(())
}

/// Re-read the persisted cancellation flag at a transition boundary.
/// In-process cancels arrive through the mailbox, so this mainly catches a
/// cancel written by another coordinator instance.
async fn checkpoint_canceled(engine: &Engine, request: &mut RebalanceRequest) -> Result<bool> {
    if !request.is_canceled {
        if let Some(stored) = engine.store.get(request.id).await? {
            if stored.is_canceled {
                *request = stored;
            }
        }
    }
    if request.is_canceled {
        if !request.status.is_terminal() {
            request.mark_canceled();
            engine.store.update(request).await?;
        }
        return Ok(true);
    }
    Ok(false)
}

/// Sweep-side recovery for one request: fail open a stale filter wait, fail
/// stale dispatched jobs, and re-run the completion check.
async fn reconcile(
    engine: &Engine,
    request: &mut RebalanceRequest,
    staleness: chrono::Duration,
) -> Result<()> {
    if checkpoint_canceled(engine, request).await? {
        return Ok(());
    }

    let stale = request.updated_at < chrono::Utc::now() - staleness;

    match request.status {
        RequestStatus::Filtering if stale => {
            warn!(request_id = %request.id, "opportunity callback overdue; failing open");
            let evaluation = OpportunityEvaluation::fail_open(
                &request.candidate_tickers,
                "opportunity callback not received within staleness window",
            );
            apply_selection(engine, request, evaluation).await?;
        }
        RequestStatus::Analyzing => {
            if stale {
                let failed = request.fail_stale_jobs(staleness);
                if failed > 0 {
                    warn!(request_id = %request.id, failed, "failed stale analysis jobs");
                    engine.store.update(request).await?;
                }
            }
            finalizer::finalize(
                engine.store.as_ref(),
                engine.synthesizer.as_ref(),
                request,
            )
            .await?;
        }
        // Crash between the Aggregating write and the Finalizing once-guard
        RequestStatus::Aggregating => {
            finalizer::finalize(
                engine.store.as_ref(),
                engine.synthesizer.as_ref(),
                request,
            )
            .await?;
        }
        RequestStatus::Finalizing if stale => {
            request.mark_failed("synthesis interrupted; retry required")?;
            engine.store.update(request).await?;
        }
        RequestStatus::Pending | RequestStatus::Evaluating if stale => {
            request.mark_failed("intake interrupted before dispatch")?;
            engine.store.update(request).await?;
        }
        _ => {}
    }

    Ok(())
}
