//! Coalescing work queue that receives changed target keys.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rulegate_api::NotificationSink;
use rulegate_core::ObjectKey;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    shutting_down: bool,
    coalesced: u64,
}

/// FIFO of object keys, coalescing duplicates that are still waiting.
///
/// Keys added while a key is already queued are folded into the existing
/// entry. After `shut_down` new adds are ignored and `pop` drains what is
/// left, then returns `None`.
#[derive(Default)]
pub struct DelayQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DelayQueue {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize { self.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.lock().order.is_empty() }
    pub fn coalesced(&self) -> u64 { self.lock().coalesced }

    pub fn push(&self, key: ObjectKey) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            if !st.queued.insert(key.clone()) {
                st.coalesced += 1;
                return;
            }
            st.order.push_back(key);
        }
        counter!("ruleset_queue_adds_total", 1u64);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed. Must be called inside a tokio runtime.
    pub fn push_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.push(key);
            return;
        }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.push(key);
        });
    }

    /// Wait for the next key. `None` once shut down and drained.
    pub async fn pop(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        debug!("notification queue shutting down");
        self.notify.notify_waiters();
    }
}

impl NotificationSink for DelayQueue {
    fn is_shutting_down(&self) -> bool { self.lock().shutting_down }
    fn add(&self, key: ObjectKey) { self.push(key) }
}
