//! Ownership markers between a RuleSet and the targets it selects.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use rulegate_api::{ExpectationGuard, ObjectStore};
use rulegate_core::{ownership, ObjectKey};
use tracing::{debug, info};

use crate::retry::{mutate_target, TargetWrite};
use crate::{Result, RetryBackoff};

/// Targets to release (recorded, no longer selected) and to claim (all selected).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionDelta {
    pub release: Vec<String>,
    pub claim: Vec<String>,
}

pub fn plan(recorded: &[String], selected: &BTreeSet<String>) -> SelectionDelta {
    let release = recorded
        .iter()
        .filter(|n| !selected.contains(n.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    SelectionDelta { release, claim: selected.iter().cloned().collect() }
}

pub struct OwnershipManager<'a> {
    pub store: &'a dyn ObjectStore,
    pub guard: &'a dyn ExpectationGuard,
    pub backoff: &'a RetryBackoff,
}

impl<'a> OwnershipManager<'a> {
    /// Apply `delta` for `rule_set` in `namespace`. Stops at the first terminal error.
    ///
    /// Returns the claimed targets as they are stored after the claim, in
    /// claim order. Targets that vanished meanwhile are left out.
    pub async fn sync(&self, namespace: &str, rule_set: &str, delta: &SelectionDelta) -> Result<Vec<Pod>> {
        self.release(namespace, rule_set, &delta.release).await?;
        let mut live = Vec::with_capacity(delta.claim.len());
        for name in &delta.claim {
            let key = ObjectKey::new(namespace, name.as_str());
            let res = mutate_target(self.store, &key, self.backoff, |pod| ownership::add_owner(pod, rule_set)).await?;
            if let TargetWrite::Written { base_version, .. } = &res {
                debug!(pod = %key, ruleset = %rule_set, "claimed target");
                // the next pass must see this write before acting on the pod again
                self.guard.expect_update(&key, base_version);
            }
            match res.into_pod() {
                Some(pod) => live.push(pod),
                None => debug!(pod = %key, "claimed target vanished"),
            }
        }
        Ok(live)
    }

    /// Remove `rule_set` from each named target; vanished targets are skipped.
    pub async fn release(&self, namespace: &str, rule_set: &str, names: &[String]) -> Result<()> {
        for name in names {
            let key = ObjectKey::new(namespace, name.as_str());
            match mutate_target(self.store, &key, self.backoff, |pod| ownership::remove_owner(pod, rule_set)).await? {
                TargetWrite::Written { .. } => info!(pod = %key, ruleset = %rule_set, "released target"),
                TargetWrite::Gone => debug!(pod = %key, "target already gone"),
                TargetWrite::Unchanged(_) => {}
            }
        }
        Ok(())
    }
}
