//! Auto-replay rules: matching, single-message execution, and batch replay
//! across a rule's whole scope (§4.8, §4.9, §4.10).

mod batch;
mod engine;
mod executor;

pub use batch::{BatchReplayCoordinator, BatchSummary};
pub use engine::RuleEngine;
pub use executor::AutoReplayExecutor;
