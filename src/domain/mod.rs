//! Domain model: the rebalance aggregate and its pure state machine
//!
//! Every mutation of a `RebalanceRequest` goes through the methods here,
//! keeping the invariants (selection subset, per-ticker dispatch uniqueness,
//! cancellation monotonicity) in one place.

pub mod action;
pub mod constraints;
pub mod job;
pub mod request;
pub mod snapshot;

pub use action::{OpportunityEvaluation, TradeAction, TradeSide};
pub use constraints::{resolve, RawConstraints, ResolvedConstraints, RoleLimits};
pub use job::{AnalysisJob, JobStatus};
pub use request::{
    AnalysisOutcome, CallbackDisposition, RebalanceRequest, RequestStatus,
};
pub use snapshot::{PortfolioSnapshot, TickerDrift};
