//! RuleGate in-memory state: the resource-version expectation table and the
//! delaying work queue used as a notification sink.

#![forbid(unsafe_code)]

mod expectations;
mod queue;

pub use expectations::{version_advanced, Expectations, DEFAULT_EXPECTATION_TTL};
pub use queue::DelayQueue;
