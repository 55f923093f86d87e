//! Request State Tracker: applies completion callbacks to the persisted
//! aggregate.
//!
//! Callbacks may arrive duplicated, late, or out of order; the ticker-keyed
//! lookup plus the already-terminal check in the aggregate make every
//! delivery idempotent. Callbacks for a canceled request are recorded for
//! bookkeeping but never advance the status.

use tracing::{debug, info};

use crate::domain::{AnalysisOutcome, CallbackDisposition, RebalanceRequest, RequestStatus};
use crate::error::Result;
use crate::store::RequestStore;
use crate::workers::DecisionSynthesizer;

use super::finalizer;

pub async fn record_completion(
    store: &dyn RequestStore,
    synthesizer: &dyn DecisionSynthesizer,
    request: &mut RebalanceRequest,
    outcome: &AnalysisOutcome,
) -> Result<CallbackDisposition> {
    let disposition = request.apply_completion(outcome);
    if disposition == CallbackDisposition::Discarded {
        debug!(
            request_id = %request.id,
            ticker = outcome.ticker,
            "duplicate or late completion callback discarded"
        );
        return Ok(disposition);
    }

    info!(
        request_id = %request.id,
        ticker = outcome.ticker,
        success = outcome.success,
        analyzed = request.stocks_analyzed(),
        total = request.selected_tickers.len(),
        "analysis completed"
    );
    store.update(request).await?;

    if request.is_canceled {
        return Ok(disposition);
    }

    if request.status == RequestStatus::Analyzing && request.all_jobs_terminal() {
        finalizer::finalize(store, synthesizer, request).await?;
    }

    Ok(disposition)
}
