//! Opportunity Filter Gateway
//!
//! Calls the external opportunity-scoring worker under a bounded timeout.
//! A broken filtering service must never block rebalancing: timeout or
//! worker error falls open to the full candidate set, with the failure
//! reason recorded on the evaluation for observability.

use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{OpportunityEvaluation, RebalanceRequest};
use crate::workers::{OpportunityScorer, ScoreOutcome};

/// Gateway result: a usable evaluation, or a deferral awaiting the
/// opportunity-completed callback
#[derive(Debug)]
pub enum GatewayOutcome {
    Evaluated(OpportunityEvaluation),
    Deferred,
}

pub async fn filter_candidates(
    scorer: &dyn OpportunityScorer,
    timeout: Duration,
    request: &RebalanceRequest,
) -> GatewayOutcome {
    let call = scorer.score(
        request.id,
        &request.candidate_tickers,
        request.snapshot.market_context.as_ref(),
    );

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(ScoreOutcome::Completed(mut evaluation))) => {
            // Workers are not trusted to respect the candidate set
            evaluation
                .selected
                .retain(|t| request.candidate_tickers.contains(t));
            info!(
                request_id = %request.id,
                selected = evaluation.selected.len(),
                candidates = request.candidate_tickers.len(),
                "opportunity filter narrowed ticker set"
            );
            GatewayOutcome::Evaluated(evaluation)
        }
        Ok(Ok(ScoreOutcome::Deferred)) => {
            info!(request_id = %request.id, "opportunity scoring deferred to callback");
            GatewayOutcome::Deferred
        }
        Ok(Err(e)) => {
            warn!(request_id = %request.id, error = %e, "opportunity worker failed, failing open");
            GatewayOutcome::Evaluated(OpportunityEvaluation::fail_open(
                &request.candidate_tickers,
                &format!("opportunity worker error: {}", e),
            ))
        }
        Err(_) => {
            warn!(
                request_id = %request.id,
                timeout_secs = timeout.as_secs(),
                "opportunity worker timed out, failing open"
            );
            GatewayOutcome::Evaluated(OpportunityEvaluation::fail_open(
                &request.candidate_tickers,
                &format!("opportunity worker timed out after {}s", timeout.as_secs()),
            ))
        }
    }
}

/// Sanitize an asynchronously delivered evaluation the same way the
/// synchronous path does
pub fn sanitize_evaluation(
    request_id: Uuid,
    candidates: &[String],
    mut evaluation: OpportunityEvaluation,
) -> OpportunityEvaluation {
    let before = evaluation.selected.len();
    evaluation.selected.retain(|t| candidates.contains(t));
    if evaluation.selected.len() != before {
        warn!(
            %request_id,
            dropped = before - evaluation.selected.len(),
            "opportunity callback selected non-candidate tickers"
        );
    }
    evaluation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConstraintDefaults;
    use crate::domain::{resolve, PortfolioSnapshot, RawConstraints, RoleLimits};
    use crate::workers::{MockOpportunityScorer, ScorerScript};

    fn request(candidates: &[&str]) -> RebalanceRequest {
        let constraints = resolve(
            &RawConstraints::default(),
            &RoleLimits {
                max_tickers: 10,
                rebalance_access: true,
                opportunity_agent_access: true,
            },
            candidates.len(),
            &ConstraintDefaults::default(),
        )
        .unwrap();
        RebalanceRequest::new(
            "user-1",
            candidates.iter().map(|t| t.to_string()).collect(),
            PortfolioSnapshot::default(),
            constraints,
        )
    }

    #[tokio::test]
    async fn narrows_to_worker_selection() {
        let scorer = MockOpportunityScorer::new(ScorerScript::Select(vec!["AAPL".to_string()]));
        let req = request(&["AAPL", "MSFT"]);

        match filter_candidates(&scorer, Duration::from_secs(5), &req).await {
            GatewayOutcome::Evaluated(eval) => {
                assert_eq!(eval.selected, vec!["AAPL"]);
                assert!(eval.error.is_none());
            }
            GatewayOutcome::Deferred => panic!("expected synchronous evaluation"),
        }
    }

    #[tokio::test]
    async fn worker_error_fails_open() {
        let scorer = MockOpportunityScorer::new(ScorerScript::Fail("llm quota".to_string()));
        let req = request(&["AAPL", "MSFT"]);

        match filter_candidates(&scorer, Duration::from_secs(5), &req).await {
            GatewayOutcome::Evaluated(eval) => {
                assert_eq!(eval.selected, req.candidate_tickers);
                assert!(eval.error.as_deref().unwrap().contains("llm quota"));
            }
            GatewayOutcome::Deferred => panic!("expected fail-open evaluation"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_open() {
        let scorer = MockOpportunityScorer::new(ScorerScript::Hang);
        let req = request(&["AAPL"]);

        match filter_candidates(&scorer, Duration::from_secs(30), &req).await {
            GatewayOutcome::Evaluated(eval) => {
                assert_eq!(eval.selected, req.candidate_tickers);
                assert!(eval.error.as_deref().unwrap().contains("timed out"));
            }
            GatewayOutcome::Deferred => panic!("expected fail-open evaluation"),
        }
    }

    #[tokio::test]
    async fn off_candidate_selections_are_dropped() {
        let scorer = MockOpportunityScorer::new(ScorerScript::Select(vec![
            "AAPL".to_string(),
            "TSLA".to_string(),
        ]));
        let req = request(&["AAPL", "MSFT"]);

        match filter_candidates(&scorer, Duration::from_secs(5), &req).await {
            GatewayOutcome::Evaluated(eval) => assert_eq!(eval.selected, vec!["AAPL"]),
            GatewayOutcome::Deferred => panic!("expected synchronous evaluation"),
        }
    }
}
