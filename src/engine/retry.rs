//! Retry Coordinator: re-dispatches only the incomplete subset of a
//! request's jobs, leaving succeeded jobs untouched.

use std::time::Duration;
use tracing::info;

use crate::domain::{RebalanceRequest, RequestStatus};
use crate::error::{RebalanceError, Result};
use crate::store::RequestStore;
use crate::workers::{AnalysisWorker, DecisionSynthesizer};

use super::{dispatcher, finalizer};

pub async fn retry(
    store: &dyn RequestStore,
    worker: &dyn AnalysisWorker,
    synthesizer: &dyn DecisionSynthesizer,
    dispatch_timeout: Duration,
    request: &mut RebalanceRequest,
) -> Result<()> {
    if request.is_canceled || request.status == RequestStatus::Canceled {
        return Err(RebalanceError::Canceled(format!(
            "request {} is canceled",
            request.id
        )));
    }
    match request.status {
        RequestStatus::Failed | RequestStatus::Analyzing => {}
        status => {
            return Err(RebalanceError::InvalidState {
                action: "retry-rebalance".to_string(),
                status: status.to_string(),
            })
        }
    }

    info!(
        request_id = %request.id,
        incomplete = request.tickers_needing_dispatch().len(),
        "retrying rebalance"
    );

    request.failure_reason = None;
    if request.status == RequestStatus::Failed {
        request.transition_to(RequestStatus::Analyzing)?;
    }
    store.update(request).await?;

    dispatcher::dispatch_analyses(store, worker, dispatch_timeout, request).await?;

    // A synthesis-only failure leaves no jobs to re-dispatch; re-run the
    // completion check so the finalizer gets its second attempt.
    if request.all_jobs_terminal() {
        finalizer::finalize(store, synthesizer, request).await?;
    }

    Ok(())
}
