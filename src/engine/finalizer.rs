//! Decision Finalizer: turns a complete per-ticker result set into trade
//! actions, exactly once per attempt.
//!
//! The `Finalizing` transition is the once-guard: it is persisted before the
//! synthesis call, so a second finalization attempt sees a non-`Aggregating`
//! status and no-ops.

use tracing::{info, warn};

use crate::domain::{RebalanceRequest, RequestStatus};
use crate::error::Result;
use crate::store::RequestStore;
use crate::workers::DecisionSynthesizer;

/// Idempotent finalization check. Advances `Analyzing → Aggregating` when the
/// job set is fully resolved, then runs synthesis. A canceled request is
/// never finalized; an incomplete or already-terminal one is left alone.
pub async fn finalize(
    store: &dyn RequestStore,
    synthesizer: &dyn DecisionSynthesizer,
    request: &mut RebalanceRequest,
) -> Result<()> {
    if request.is_canceled {
        return Ok(());
    }

    match request.status {
        RequestStatus::Analyzing if request.all_jobs_terminal() => {
            request.transition_to(RequestStatus::Aggregating)?;
            store.update(request).await?;
        }
        RequestStatus::Aggregating => {}
        _ => return Ok(()),
    }

    request.transition_to(RequestStatus::Finalizing)?;
    store.update(request).await?;

    match synthesizer.synthesize(request).await {
        Ok(actions) => {
            info!(
                request_id = %request.id,
                actions = actions.len(),
                succeeded = request.succeeded_jobs().len(),
                failed = request.failed_jobs().len(),
                "rebalance finalized"
            );
            request.trade_actions = actions;
            request.transition_to(RequestStatus::Completed)?;
            store.update(request).await?;
        }
        Err(e) => {
            warn!(request_id = %request.id, error = %e, "synthesis failed");
            request.mark_failed(&e.to_string())?;
            store.update(request).await?;
        }
    }

    Ok(())
}
