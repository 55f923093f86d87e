use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Direction of a synthesized trade action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
            TradeSide::Hold => write!(f, "hold"),
        }
    }
}

/// One executable trade action produced by finalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAction {
    pub ticker: String,
    pub side: TradeSide,
    /// Share quantity, when the sizing routine works in shares
    pub quantity: Option<Decimal>,
    /// Dollar sizing, when the sizing routine works in notional
    pub notional_usd: Option<Decimal>,
    pub rationale: Option<String>,
}

/// Result of the opportunity-filtering stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityEvaluation {
    /// Tickers prioritized for full analysis
    pub selected: Vec<String>,
    /// Per-ticker inclusion/exclusion reasoning
    #[serde(default)]
    pub reasons: HashMap<String, String>,
    /// Set when the scoring worker failed and the gateway fell open
    pub error: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl OpportunityEvaluation {
    /// Evaluation recording a gateway fallback to the full candidate set
    pub fn fail_open(candidates: &[String], reason: &str) -> Self {
        Self {
            selected: candidates.to_vec(),
            reasons: HashMap::new(),
            error: Some(reason.to_string()),
            evaluated_at: Utc::now(),
        }
    }
}
