//! External collaborator clients: analysis pool, opportunity scorer,
//! decision synthesizer

pub mod http;
pub mod mock;
pub mod traits;

pub use http::HttpWorkerClient;
pub use mock::{MockAnalysisWorker, MockOpportunityScorer, MockSynthesizer, ScorerScript};
pub use traits::{
    AnalysisWorker, DecisionSynthesizer, OpportunityScorer, RoleLimitsProvider, ScoreOutcome,
    StaticRoleLimits,
};
