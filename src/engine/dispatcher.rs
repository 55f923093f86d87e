//! Analysis Dispatcher: fans one analysis job per selected ticker out to
//! the external worker pool.
//!
//! Dispatch is idempotent per ticker and persist-first: the job record
//! (status `dispatched`) is written before the external call, so a crash
//! between the two can never silently duplicate work. The stale record is
//! failed by the reconciliation sweep and retried explicitly.

use std::time::Duration;
use tracing::{info, warn};

use crate::domain::{RebalanceRequest, RequestStatus};
use crate::error::{RebalanceError, Result};
use crate::store::RequestStore;
use crate::workers::AnalysisWorker;

pub async fn dispatch_analyses(
    store: &dyn RequestStore,
    worker: &dyn AnalysisWorker,
    timeout: Duration,
    request: &mut RebalanceRequest,
) -> Result<()> {
    if request.is_canceled {
        return Ok(());
    }
    if request.status != RequestStatus::Analyzing {
        request.transition_to(RequestStatus::Analyzing)?;
    }

    let pending = request.tickers_needing_dispatch();
    info!(
        request_id = %request.id,
        jobs = pending.len(),
        "dispatching analysis jobs"
    );

    for ticker in pending {
        // Checkpoint between jobs; never interrupts a single dispatch
        if request.is_canceled {
            break;
        }

        request.record_dispatch(&ticker)?;
        store.update(request).await?;

        let call = worker.dispatch(request.id, &ticker, &request.snapshot, &request.constraints);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(job_id)) => {
                request.record_job_handle(&ticker, &job_id)?;
            }
            Ok(Err(e)) => {
                warn!(request_id = %request.id, ticker, error = %e, "analysis dispatch failed");
                request.record_dispatch_failure(&ticker, &e.to_string());
            }
            Err(_) => {
                let reason = format!("dispatch timed out after {}s", timeout.as_secs());
                warn!(request_id = %request.id, ticker, "{}", reason);
                request.record_dispatch_failure(
                    &ticker,
                    &RebalanceError::ExternalWorker(reason).to_string(),
                );
            }
        }
        store.update(request).await?;
    }

    Ok(())
}
