//! Fan-out of changed per-target outcomes to downstream queues.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use metrics::counter;
use rulegate_api::NotificationSink;
use rulegate_core::{Detail, ObjectKey};
use tracing::{debug, warn};

/// Target names whose detail differs between `old` and `new`, including
/// targets present on only one side.
pub fn changed_targets(old: &[Detail], new: &[Detail]) -> BTreeSet<String> {
    let old: BTreeMap<&str, &Detail> = old.iter().map(|d| (d.name.as_str(), d)).collect();
    let new: BTreeMap<&str, &Detail> = new.iter().map(|d| (d.name.as_str(), d)).collect();
    let mut out = BTreeSet::new();
    for (name, before) in &old {
        if new.get(name) != Some(before) {
            out.insert(name.to_string());
        }
    }
    for name in new.keys() {
        if !old.contains_key(name) {
            out.insert(name.to_string());
        }
    }
    out
}

/// Pushes changed target keys onto every registered sink.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl ChangeNotifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self { Self { sinks } }

    pub fn is_empty(&self) -> bool { self.sinks.is_empty() }

    /// Enqueue every changed target of `namespace`. Returns how many names changed.
    pub fn notify(&self, namespace: &str, old: &[Detail], new: &[Detail]) -> usize {
        if self.sinks.is_empty() {
            return 0;
        }
        let changed = changed_targets(old, new);
        let mut dropped = 0usize;
        for name in &changed {
            let key = ObjectKey::new(namespace, name.as_str());
            for sink in &self.sinks {
                if sink.is_shutting_down() {
                    dropped += 1;
                    continue;
                }
                sink.add(key.clone());
            }
            debug!(pod = %key, "target outcome changed");
        }
        if dropped > 0 {
            warn!(namespace, dropped, "notification sink shutting down; keys dropped");
        }
        counter!("ruleset_notifications_total", changed.len() as u64);
        changed.len()
    }
}
