//! RuleGate reconcile core.
//!
//! One pass converges a RuleSet toward its declared policy: claim selected
//! targets, evaluate rule stages concurrently, write a canonical status only
//! when it changed, gate deletion on running targets, and fan changed
//! per-target outcomes out to notification sinks.

#![forbid(unsafe_code)]

mod config;
pub mod deletion;
mod error;
pub mod notify;
pub mod ownership;
mod reconciler;
pub mod retry;
pub mod stages;
pub mod status;

pub use config::{ControllerConfig, RetryBackoff};
pub use error::{Error, Result};
pub use notify::ChangeNotifier;
pub use reconciler::{ReconcileOutcome, Reconciler};

/// Name used for events, field managers and the metrics prefix.
pub const CONTROLLER_NAME: &str = "ruleset-controller";
