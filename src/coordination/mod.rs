//! Batch coordination: scheduling file loads and collecting their outcomes

pub mod coordinator;
pub mod report;

pub use coordinator::Coordinator;
pub use report::{BatchReport, LoadOutcome, OutcomeError};
