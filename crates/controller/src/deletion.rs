//! Deletion safety: a RuleSet keeps its cleanup finalizer until no selected
//! target is still running (or it is labelled for forced termination), then
//! releases every recorded target and drops the finalizer.

use k8s_openapi::api::core::v1::Pod;
use rulegate_api::ObjectStore;
use rulegate_core::{ownership, RuleSet, CLEANUP_FINALIZER};
use tracing::info;

use crate::ownership::OwnershipManager;
use crate::retry::retry_on_conflict;
use crate::{Result, RetryBackoff};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionGate {
    /// Not terminating.
    Active,
    /// Terminating, but `running` selected targets still depend on it.
    Blocked { running: usize },
    /// Terminating and free to clean up.
    CleanUp,
}

pub fn gate(rs: &RuleSet, selected: &[Pod]) -> DeletionGate {
    if !rs.is_terminating() {
        return DeletionGate::Active;
    }
    let running = selected.iter().filter(|p| ownership::is_running(p)).count();
    if running == 0 || rs.force_terminate() {
        DeletionGate::CleanUp
    } else {
        DeletionGate::Blocked { running }
    }
}

pub fn blocked_message(rs: &RuleSet) -> String {
    format!(
        "can not delete ruleset {}: some pods are still waiting to be processed by it. \
         Terminate those pods first or label the ruleset {}=true to force deletion",
        rs.key(),
        rulegate_core::TERMINATING_LABEL
    )
}

/// Add the cleanup finalizer if missing. Returns the object as stored.
pub async fn ensure_finalizer(store: &dyn ObjectStore, backoff: &RetryBackoff, rs: &RuleSet) -> Result<RuleSet> {
    if rs.has_finalizer(CLEANUP_FINALIZER) {
        return Ok(rs.clone());
    }
    let key = rs.key();
    let out = retry_on_conflict(backoff, &key, || async {
        let mut live = store.get_rule_set(&key).await?;
        if live.has_finalizer(CLEANUP_FINALIZER) {
            return Ok(live);
        }
        live.metadata.finalizers.get_or_insert_with(Vec::new).push(CLEANUP_FINALIZER.to_string());
        store.update_rule_set(&live).await
    })
    .await?;
    info!(ruleset = %key, "added cleanup finalizer");
    Ok(out)
}

/// Drop the cleanup finalizer. A vanished RuleSet counts as done.
pub async fn remove_finalizer(store: &dyn ObjectStore, backoff: &RetryBackoff, rs: &RuleSet) -> Result<()> {
    let key = rs.key();
    retry_on_conflict(backoff, &key, || async {
        let mut live = match store.get_rule_set(&key).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !live.has_finalizer(CLEANUP_FINALIZER) {
            return Ok(());
        }
        if let Some(fins) = live.metadata.finalizers.as_mut() {
            fins.retain(|f| f != CLEANUP_FINALIZER);
        }
        match store.update_rule_set(&live).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    })
    .await?;
    info!(ruleset = %key, "removed cleanup finalizer");
    Ok(())
}

/// Release every target recorded in the stored status, then drop the finalizer.
pub async fn clean_up(owners: &OwnershipManager<'_>, rs: &RuleSet) -> Result<()> {
    let key = rs.key();
    let recorded = rs.current_status().targets;
    info!(ruleset = %key, targets = recorded.len(), "cleaning up terminating ruleset");
    owners.release(&key.namespace, &key.name, &recorded).await?;
    remove_finalizer(owners.store, owners.backoff, rs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rulegate_core::{RuleSetSpec, TERMINATING_LABEL};

    fn terminating(force: bool) -> RuleSet {
        let mut rs = RuleSet::new("rs", RuleSetSpec::default());
        rs.metadata.namespace = Some("ns".into());
        rs.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        if force {
            rs.metadata.labels = Some([(TERMINATING_LABEL.to_string(), "true".to_string())].into_iter().collect());
        }
        rs
    }

    fn pod(deleting: bool) -> Pod {
        let mut p = Pod::default();
        p.metadata.name = Some("p".into());
        if deleting {
            p.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        p
    }

    #[test]
    fn active_when_not_terminating() {
        let rs = RuleSet::new("rs", RuleSetSpec::default());
        assert_eq!(gate(&rs, &[pod(false)]), DeletionGate::Active);
    }

    #[test]
    fn running_target_blocks_unless_forced() {
        assert_eq!(gate(&terminating(false), &[pod(false), pod(true)]), DeletionGate::Blocked { running: 1 });
        assert_eq!(gate(&terminating(true), &[pod(false)]), DeletionGate::CleanUp);
    }

    #[test]
    fn no_running_targets_allows_cleanup() {
        assert_eq!(gate(&terminating(false), &[pod(true)]), DeletionGate::CleanUp);
        assert_eq!(gate(&terminating(false), &[]), DeletionGate::CleanUp);
    }
}
