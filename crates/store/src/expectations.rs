//! Resource-version expectations: the stale-view gate for reconcile passes.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rulegate_api::ExpectationGuard;
use rulegate_core::ObjectKey;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// Pending expectations older than this are dropped as satisfied.
pub const DEFAULT_EXPECTATION_TTL: Duration = Duration::from_secs(300);

struct Pending {
    base: String,
    armed_at: Instant,
}

/// Keyed table of `identity -> version the last write started from`.
pub struct Expectations {
    pending: Mutex<FxHashMap<ObjectKey, Pending>>,
    ttl: Duration,
}

impl Default for Expectations {
    fn default() -> Self { Self::with_ttl(DEFAULT_EXPECTATION_TTL) }
}

impl Expectations {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { pending: Mutex::new(FxHashMap::default()), ttl }
    }

    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<ObjectKey, Pending>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// True when `observed` is newer than `base`. Integer versions compare
/// numerically; anything else only by inequality.
pub fn version_advanced(base: &str, observed: &str) -> bool {
    match (base.parse::<u64>(), observed.parse::<u64>()) {
        (Ok(b), Ok(o)) => o > b,
        _ => base != observed,
    }
}

impl ExpectationGuard for Expectations {
    fn satisfied(&self, key: &ObjectKey, observed_version: &str) -> bool {
        let mut map = self.lock();
        let Some(p) = map.get(key) else { return true };
        if p.armed_at.elapsed() >= self.ttl {
            warn!(object = %key, base = %p.base, "expectation expired; treating as satisfied");
            map.remove(key);
            return true;
        }
        if version_advanced(&p.base, observed_version) {
            debug!(object = %key, base = %p.base, observed = %observed_version, "expectation satisfied");
            map.remove(key);
            return true;
        }
        false
    }

    fn expect_update(&self, key: &ObjectKey, base_version: &str) {
        let mut map = self.lock();
        // keys that are never looked up again (deleted or deselected targets) age out here
        let ttl = self.ttl;
        map.retain(|_, p| p.armed_at.elapsed() < ttl);
        map.insert(key.clone(), Pending { base: base_version.to_string(), armed_at: Instant::now() });
    }

    fn delete(&self, key: &ObjectKey) {
        self.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ObjectKey { ObjectKey::new("ns", "rs") }

    #[test]
    fn unknown_key_is_satisfied() {
        let e = Expectations::default();
        assert!(e.satisfied(&key(), "1"));
    }

    #[test]
    fn blocks_until_newer_version_observed() {
        let e = Expectations::default();
        e.expect_update(&key(), "10");
        assert!(!e.satisfied(&key(), "10"));
        assert!(!e.satisfied(&key(), "9"));
        assert!(e.satisfied(&key(), "11"));
        // consumed once satisfied
        assert!(e.is_empty());
        assert!(e.satisfied(&key(), "10"));
    }

    #[test]
    fn delete_clears_pending() {
        let e = Expectations::default();
        e.expect_update(&key(), "5");
        e.delete(&key());
        assert!(e.satisfied(&key(), "5"));
    }

    #[test]
    fn expired_expectation_is_dropped() {
        let e = Expectations::with_ttl(Duration::ZERO);
        e.expect_update(&key(), "5");
        assert!(e.satisfied(&key(), "5"));
        assert_eq!(e.len(), 0);
    }

    #[test]
    fn arming_sweeps_expired_entries_of_other_keys() {
        let e = Expectations::with_ttl(Duration::from_millis(1));
        for i in 0..100 {
            e.expect_update(&ObjectKey::new("ns", format!("pod-{}", i)), "1");
        }
        std::thread::sleep(Duration::from_millis(20));
        e.expect_update(&ObjectKey::new("ns", "fresh"), "1");
        assert_eq!(e.len(), 1);
    }

    #[test]
    fn opaque_versions_compare_by_inequality() {
        assert!(version_advanced("abc", "abd"));
        assert!(!version_advanced("abc", "abc"));
        assert!(!version_advanced("7", "3"));
    }
}
