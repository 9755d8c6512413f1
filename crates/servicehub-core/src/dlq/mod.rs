//! Dead-letter message tracking: the data model, its persistent store, and
//! the background scanner that keeps the store honest (§3, §4.6, §4.7).

mod model;
mod scanner;
mod store;

pub use model::{
    Action, AutoReplayRule, Condition, DlqMessage, DlqMessageStatus, Field, Operator,
    OutcomeStatus, ReplayHistory, ReplayStrategy,
};
pub use scanner::DlqScanner;
pub use store::{DlqFilter, DlqStore, DlqSummary, ExportFormat, Paging};
