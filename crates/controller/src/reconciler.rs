//! One reconcile pass over a RuleSet, from stale-view check to notification.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use metrics::{counter, histogram};
use rulegate_api::{EventRecorder, ExpectationGuard, NoopRecorder, ObjectStore, RuleEvaluator, StageProvider};
use rulegate_core::{selector, ObjectKey, RuleSet, CLEANUP_FINALIZER};
use tracing::{debug, info, warn};

use crate::deletion::{self, DeletionGate};
use crate::ownership::{self, OwnershipManager};
use crate::stages::run_stages;
use crate::status::{build_status, write_if_changed};
use crate::{ChangeNotifier, ControllerConfig, Error, Result};

/// What the caller should do with this RuleSet next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Requeue right away (with the caller's own backoff).
    pub requeue: bool,
    /// Requeue after this delay; takes precedence over `requeue`.
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn done() -> Self { Self::default() }
    pub fn after(d: Duration) -> Self { Self { requeue: false, requeue_after: Some(d) } }
}

/// Per-RuleSet reconcile entry point. Cheap to share behind an `Arc`.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    guard: Arc<dyn ExpectationGuard>,
    stages: Arc<dyn StageProvider>,
    evaluator: Arc<dyn RuleEvaluator>,
    notifier: ChangeNotifier,
    recorder: Arc<dyn EventRecorder>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        guard: Arc<dyn ExpectationGuard>,
        stages: Arc<dyn StageProvider>,
        evaluator: Arc<dyn RuleEvaluator>,
    ) -> Self {
        Self {
            store,
            guard,
            stages,
            evaluator,
            notifier: ChangeNotifier::default(),
            recorder: Arc::new(NoopRecorder),
            config: ControllerConfig::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: ChangeNotifier) -> Self { self.notifier = notifier; self }
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self { self.recorder = recorder; self }
    pub fn with_config(mut self, config: ControllerConfig) -> Self { self.config = config; self }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    fn owners(&self) -> OwnershipManager<'_> {
        OwnershipManager { store: self.store.as_ref(), guard: self.guard.as_ref(), backoff: &self.config.retry }
    }

    /// Run one pass for `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let t0 = Instant::now();
        counter!("ruleset_reconcile_total", 1u64);
        let res = self.reconcile_inner(key).await;
        histogram!("ruleset_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("ruleset_reconcile_errors_total", 1u64);
            warn!(ruleset = %key, error = %e, "reconcile failed");
        }
        res
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let rs = match self.store.get_rule_set(key).await {
            Ok(rs) => rs,
            Err(e) if e.is_not_found() => {
                debug!(ruleset = %key, "ruleset gone");
                return Ok(ReconcileOutcome::done());
            }
            Err(e) => return Err(e.into()),
        };

        let version = rs.resource_version().unwrap_or_default();
        if !self.guard.satisfied(key, &version) {
            counter!("ruleset_reconcile_noop_total", 1u64);
            info!(ruleset = %key, version = %version, "expected ruleset update not observed yet, retry later");
            return Ok(ReconcileOutcome::done());
        }

        selector::to_query(&rs.spec.selector).map_err(|source| Error::Selector { key: key.clone(), source })?;
        let selected = self.store.list_targets(&key.namespace, &rs.spec.selector).await?;

        let rs = match deletion::gate(&rs, &selected) {
            DeletionGate::Active => deletion::ensure_finalizer(self.store.as_ref(), &self.config.retry, &rs).await?,
            _ if !rs.has_finalizer(CLEANUP_FINALIZER) => {
                debug!(ruleset = %key, "terminating without cleanup finalizer");
                return Ok(ReconcileOutcome::done());
            }
            DeletionGate::CleanUp => {
                deletion::clean_up(&self.owners(), &rs).await?;
                return Ok(ReconcileOutcome::done());
            }
            DeletionGate::Blocked { running } => {
                counter!("ruleset_deletion_blocked_total", 1u64);
                warn!(ruleset = %key, running, "deletion blocked by running targets");
                self.recorder.warning(&rs, "BlockProtection", &deletion::blocked_message(&rs)).await;
                return Ok(ReconcileOutcome::after(self.config.deletion_recheck));
            }
        };

        let mut names = BTreeSet::new();
        for pod in &selected {
            let pod_key = ObjectKey::of(pod);
            let pod_version = pod.resource_version().unwrap_or_default();
            if !self.guard.satisfied(&pod_key, &pod_version) {
                counter!("ruleset_reconcile_noop_total", 1u64);
                info!(pod = %pod_key, version = %pod_version, "expected pod update not observed yet, retry later");
                return Ok(ReconcileOutcome::done());
            }
            names.insert(pod.name_any());
        }

        let old_status = rs.current_status();
        let delta = ownership::plan(&old_status.targets, &names);
        // evaluators get the pods as stored after the claim, not the listed snapshot
        let targets = self.owners().sync(&key.namespace, &key.name, &delta).await?;

        let stages = self.stages.stages();
        let merged = run_stages(Arc::clone(&self.evaluator), &stages, Arc::new(rs.clone()), Arc::new(targets)).await;
        let outcome = ReconcileOutcome { requeue: merged.retry, requeue_after: merged.interval };

        let generation = rs.metadata.generation.unwrap_or_default();
        let next = build_status(&names, generation, merged.details.into_values(), merged.rule_states);
        let new_details = next.details.clone();
        write_if_changed(self.store.as_ref(), self.guard.as_ref(), &rs, next).await?;

        self.notifier.notify(&key.namespace, &old_status.details, &new_details);
        Ok(outcome)
    }
}
