use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-ticker allocation drift supplied by an external portfolio snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerDrift {
    pub ticker: String,
    /// Deviation from target allocation, in percent, non-negative
    pub drift_pct: Decimal,
}

/// Point-in-time view of the portfolio, as seen by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub positions: Vec<TickerDrift>,
    /// Free-form market context forwarded to the opportunity scorer
    #[serde(default)]
    pub market_context: Option<serde_json::Value>,
}

impl PortfolioSnapshot {
    pub fn drift_for(&self, ticker: &str) -> Option<Decimal> {
        self.positions
            .iter()
            .find(|p| p.ticker == ticker)
            .map(|p| p.drift_pct)
    }
}
