pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod store;
pub mod workers;

pub use config::AppConfig;
pub use domain::{
    AnalysisJob, AnalysisOutcome, CallbackDisposition, JobStatus, OpportunityEvaluation,
    PortfolioSnapshot, RawConstraints, RebalanceRequest, RequestStatus, ResolvedConstraints,
    RoleLimits, TickerDrift, TradeAction, TradeSide,
};
pub use engine::{ActionOutcome, Coordinator, Engine, Reconciler, StartRebalance};
pub use error::{RebalanceError, Result};
pub use store::{InMemoryRequestStore, PgRequestStore, RequestStore};
pub use workers::{
    AnalysisWorker, DecisionSynthesizer, HttpWorkerClient, OpportunityScorer, RoleLimitsProvider,
    ScoreOutcome, StaticRoleLimits,
};
