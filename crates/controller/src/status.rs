//! Canonical status snapshot and write-only-on-change.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use metrics::counter;
use rulegate_api::{ExpectationGuard, ObjectStore};
use rulegate_core::{Detail, RuleSet, RuleSetStatus, RuleState};
use tracing::{debug, error, info};

use crate::Result;

/// Details sorted by target name, whatever order they arrive in.
pub fn canonical_details<I: IntoIterator<Item = Detail>>(details: I) -> Vec<Detail> {
    let mut out: Vec<Detail> = details.into_iter().collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

pub fn build_status<I>(targets: &BTreeSet<String>, generation: i64, details: I, rule_states: Vec<RuleState>) -> RuleSetStatus
where
    I: IntoIterator<Item = Detail>,
{
    RuleSetStatus {
        targets: targets.iter().cloned().collect(),
        observed_generation: generation,
        details: canonical_details(details),
        rule_states,
        update_time: Some(Time(chrono::Utc::now())),
    }
}

#[derive(Debug)]
pub enum StatusWrite {
    Unchanged,
    Written(Box<RuleSet>),
}

/// Write `next` as the status of `rs` unless it matches what is stored.
///
/// The expectation for `rs` is armed at its current version before the write
/// and cleared again if the write fails.
pub async fn write_if_changed(
    store: &dyn ObjectStore,
    guard: &dyn ExpectationGuard,
    rs: &RuleSet,
    next: RuleSetStatus,
) -> Result<StatusWrite> {
    let key = rs.key();
    if rs.current_status().same_content(&next) {
        debug!(ruleset = %key, "status unchanged");
        return Ok(StatusWrite::Unchanged);
    }
    guard.expect_update(&key, &rs.resource_version().unwrap_or_default());
    let mut updated = rs.clone();
    updated.status = Some(next);
    match store.update_rule_set_status(&updated).await {
        Ok(written) => {
            counter!("ruleset_status_writes_total", 1u64);
            info!(ruleset = %key, targets = written.current_status().targets.len(), "status updated");
            Ok(StatusWrite::Written(Box::new(written)))
        }
        Err(e) => {
            guard.delete(&key);
            error!(ruleset = %key, error = %e, "failed to update status");
            Err(e.into())
        }
    }
}
