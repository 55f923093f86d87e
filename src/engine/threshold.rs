//! Threshold Evaluator: decides whether a request goes straight to full
//! analysis or through opportunity filtering first. Pure.

use rust_decimal::Decimal;

use crate::domain::{PortfolioSnapshot, ResolvedConstraints};
use crate::error::{RebalanceError, Result};

/// `true` when the threshold check is bypassed or the worst drift meets it.
///
/// Every candidate must have a non-negative drift entry in the snapshot;
/// anything else is a malformed payload.
pub fn force_full_analysis(
    snapshot: &PortfolioSnapshot,
    candidates: &[String],
    constraints: &ResolvedConstraints,
) -> Result<bool> {
    if constraints.skip_threshold_check {
        return Ok(true);
    }

    let mut max_drift = Decimal::ZERO;
    for ticker in candidates {
        let drift = snapshot.drift_for(ticker).ok_or_else(|| {
            RebalanceError::Validation(format!("snapshot missing drift for {}", ticker))
        })?;
        if drift < Decimal::ZERO {
            return Err(RebalanceError::Validation(format!(
                "negative drift {} for {}",
                drift, ticker
            )));
        }
        max_drift = max_drift.max(drift);
    }

    Ok(max_drift >= constraints.rebalance_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TickerDrift;
    use rust_decimal_macros::dec;

    fn constraints(threshold: Decimal, skip: bool) -> ResolvedConstraints {
        ResolvedConstraints {
            rebalance_threshold: threshold,
            min_position_size: dec!(100),
            max_position_size: dec!(10000),
            skip_threshold_check: skip,
            skip_opportunity_agent: skip,
        }
    }

    fn snapshot(drifts: &[(&str, Decimal)]) -> PortfolioSnapshot {
        PortfolioSnapshot {
            positions: drifts
                .iter()
                .map(|(t, d)| TickerDrift {
                    ticker: t.to_string(),
                    drift_pct: *d,
                })
                .collect(),
            market_context: None,
        }
    }

    #[test]
    fn below_threshold_does_not_force() {
        let snap = snapshot(&[("AAPL", dec!(3)), ("MSFT", dec!(2))]);
        let forced = force_full_analysis(
            &snap,
            &["AAPL".to_string(), "MSFT".to_string()],
            &constraints(dec!(10), false),
        )
        .unwrap();
        assert!(!forced);
    }

    #[test]
    fn max_drift_at_or_above_threshold_forces() {
        let snap = snapshot(&[("AAPL", dec!(15)), ("MSFT", dec!(2))]);
        let forced = force_full_analysis(
            &snap,
            &["AAPL".to_string(), "MSFT".to_string()],
            &constraints(dec!(10), false),
        )
        .unwrap();
        assert!(forced);

        let snap = snapshot(&[("AAPL", dec!(10))]);
        assert!(
            force_full_analysis(&snap, &["AAPL".to_string()], &constraints(dec!(10), false))
                .unwrap()
        );
    }

    #[test]
    fn skip_flag_bypasses_drift_entirely() {
        // No drift entries at all; bypass must not touch the snapshot
        let snap = snapshot(&[]);
        let forced =
            force_full_analysis(&snap, &["AAPL".to_string()], &constraints(dec!(10), true))
                .unwrap();
        assert!(forced);
    }

    #[test]
    fn missing_drift_is_a_validation_error() {
        let snap = snapshot(&[("AAPL", dec!(3))]);
        let err = force_full_analysis(
            &snap,
            &["AAPL".to_string(), "MSFT".to_string()],
            &constraints(dec!(10), false),
        )
        .unwrap_err();
        assert!(matches!(err, RebalanceError::Validation(_)));
    }

    #[test]
    fn negative_drift_is_a_validation_error() {
        let snap = snapshot(&[("AAPL", dec!(-1))]);
        let err =
            force_full_analysis(&snap, &["AAPL".to_string()], &constraints(dec!(10), false))
                .unwrap_err();
        assert!(matches!(err, RebalanceError::Validation(_)));
    }
}
