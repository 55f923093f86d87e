use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::ConstraintDefaults;
use crate::error::{RebalanceError, Result};

/// Constraints as submitted by the caller; every field optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConstraints {
    /// Allocation drift (percent) above which full analysis is forced
    pub rebalance_threshold: Option<Decimal>,
    pub min_position_size: Option<Decimal>,
    pub max_position_size: Option<Decimal>,
    /// Force full analysis regardless of measured drift
    pub skip_threshold_check: Option<bool>,
    /// Bypass opportunity filtering and analyze every candidate
    pub skip_opportunity_agent: Option<bool>,
}

/// Role-based capability limits, supplied by an external lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleLimits {
    pub max_tickers: usize,
    pub rebalance_access: bool,
    pub opportunity_agent_access: bool,
}

/// Fully resolved constraints; every field populated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConstraints {
    pub rebalance_threshold: Decimal,
    pub min_position_size: Decimal,
    pub max_position_size: Decimal,
    pub skip_threshold_check: bool,
    pub skip_opportunity_agent: bool,
}

/// Normalize raw request constraints against role limits and defaults.
///
/// Tie-break: `skip_threshold_check` implies `skip_opportunity_agent`;
/// forcing a rebalance means every selected stock is analyzed unconditionally.
pub fn resolve(
    raw: &RawConstraints,
    role: &RoleLimits,
    ticker_count: usize,
    defaults: &ConstraintDefaults,
) -> Result<ResolvedConstraints> {
    if !role.rebalance_access {
        return Err(RebalanceError::Configuration(
            "role does not permit rebalancing".to_string(),
        ));
    }
    if ticker_count > role.max_tickers {
        return Err(RebalanceError::Configuration(format!(
            "{} tickers exceeds role limit of {}",
            ticker_count, role.max_tickers
        )));
    }

    let rebalance_threshold = raw
        .rebalance_threshold
        .unwrap_or(defaults.rebalance_threshold);
    if rebalance_threshold < Decimal::ZERO {
        return Err(RebalanceError::Configuration(format!(
            "rebalance threshold must be non-negative, got {}",
            rebalance_threshold
        )));
    }

    let min_position_size = raw.min_position_size.unwrap_or(defaults.min_position_size);
    let max_position_size = raw.max_position_size.unwrap_or(defaults.max_position_size);
    if min_position_size < Decimal::ZERO || max_position_size < Decimal::ZERO {
        return Err(RebalanceError::Configuration(
            "position size bounds must be non-negative".to_string(),
        ));
    }
    if min_position_size > max_position_size {
        return Err(RebalanceError::Configuration(format!(
            "min position size {} exceeds max {}",
            min_position_size, max_position_size
        )));
    }

    let skip_threshold_check = raw.skip_threshold_check.unwrap_or(false);
    let skip_opportunity_agent = skip_threshold_check
        || !role.opportunity_agent_access
        || raw.skip_opportunity_agent.unwrap_or(false);

    Ok(ResolvedConstraints {
        rebalance_threshold,
        min_position_size,
        max_position_size,
        skip_threshold_check,
        skip_opportunity_agent,
    })
}
