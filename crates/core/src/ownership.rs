//! Ownership markers on targets. Both mutations are idempotent and report
//! whether they changed the object, so callers can skip no-op writes.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;

use crate::OWNERSHIP_ANNOTATION;

/// RuleSet names recorded on the pod. A malformed annotation reads as empty.
pub fn owners(pod: &Pod) -> BTreeSet<String> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(OWNERSHIP_ANNOTATION))
        .and_then(|raw| serde_json::from_str::<BTreeSet<String>>(raw).ok())
        .unwrap_or_default()
}

fn write_owners(pod: &mut Pod, owners: &BTreeSet<String>) {
    let annos = pod.metadata.annotations.get_or_insert_with(Default::default);
    if owners.is_empty() {
        annos.remove(OWNERSHIP_ANNOTATION);
        return;
    }
    // BTreeSet<String> always serializes
    let raw = serde_json::to_string(owners).unwrap_or_default();
    annos.insert(OWNERSHIP_ANNOTATION.to_string(), raw);
}

/// Record `rule_set` as an owner. Returns true if the pod changed.
pub fn add_owner(pod: &mut Pod, rule_set: &str) -> bool {
    // a malformed value reads as empty and gets replaced
    let mut cur = owners(pod);
    if !cur.insert(rule_set.to_string()) {
        return false;
    }
    write_owners(pod, &cur);
    true
}

/// Drop `rule_set` from the owners. Returns true if the pod changed.
pub fn remove_owner(pod: &mut Pod, rule_set: &str) -> bool {
    let mut cur = owners(pod);
    if !cur.remove(rule_set) {
        return false;
    }
    write_owners(pod, &cur);
    true
}

/// Pod is running while it carries no deletion timestamp.
pub fn is_running(pod: &Pod) -> bool { pod.metadata.deletion_timestamp.is_none() }
