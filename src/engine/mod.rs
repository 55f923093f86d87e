//! Rebalance Coordination Engine
//!
//! Turns a "rebalance my portfolio" request into a fan-out of per-ticker
//! analysis jobs and aggregates their results back into trade actions,
//! under cancellation and retry pressure. Control flow:
//!
//! resolve constraints → threshold check → (opportunity filter →) dispatch
//! → [external workers] → completion callbacks → finalize
//!
//! The `Coordinator` serializes all work for one request through a
//! per-request mailbox; the `Reconciler` is the at-least-once safety net
//! for callbacks that never arrive.

pub mod coordinator;
pub mod dispatcher;
pub mod finalizer;
pub mod opportunity;
pub mod reconciler;
pub mod retry;
pub mod threshold;
pub mod tracker;

pub use coordinator::{ActionOutcome, Coordinator, Engine, StartRebalance};
pub use opportunity::GatewayOutcome;
pub use reconciler::Reconciler;
