#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use rulegate_api::{EventRecorder, NotificationSink, ObjectStore, RuleEvaluator, StageProvider, StoreError, StoreResult};
use rulegate_controller::{ControllerConfig, Reconciler, RetryBackoff};
use rulegate_core::{selector, ObjectKey, RuleSet, RuleSetSpec, RuleSetStatus, StageResult};
use rulegate_store::Expectations;

pub const NS: &str = "default";

#[derive(Default)]
struct State {
    rule_sets: BTreeMap<ObjectKey, RuleSet>,
    pods: BTreeMap<ObjectKey, Pod>,
    rv: u64,
}

/// In-memory store with resource-version conflict checks and write counters.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
    pub lists: AtomicUsize,
    pub rule_set_updates: AtomicUsize,
    pub status_writes: AtomicUsize,
    pub pod_updates: Mutex<HashMap<String, usize>>,
    pub conflicts_left: AtomicUsize,
    pub fail_status: Mutex<Option<StoreError>>,
}

impl FakeStore {
    fn bump(st: &mut State) -> String {
        st.rv += 1;
        st.rv.to_string()
    }

    pub fn put_rule_set(&self, mut rs: RuleSet) {
        let mut st = self.state.lock().unwrap();
        rs.metadata.resource_version = Some(Self::bump(&mut st));
        st.rule_sets.insert(ObjectKey::of(&rs), rs);
    }

    pub fn put_pod(&self, mut pod: Pod) {
        let mut st = self.state.lock().unwrap();
        pod.metadata.resource_version = Some(Self::bump(&mut st));
        st.pods.insert(ObjectKey::of(&pod), pod);
    }

    pub fn rule_set(&self, name: &str) -> Option<RuleSet> {
        self.state.lock().unwrap().rule_sets.get(&ObjectKey::new(NS, name)).cloned()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state.lock().unwrap().pods.get(&ObjectKey::new(NS, name)).cloned()
    }

    pub fn pod_updates(&self, name: &str) -> usize {
        self.pod_updates.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_pod_updates(&self) -> usize { self.pod_updates.lock().unwrap().values().sum() }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_rule_set(&self, key: &ObjectKey) -> StoreResult<RuleSet> {
        self.state.lock().unwrap().rule_sets.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn update_rule_set(&self, rs: &RuleSet) -> StoreResult<RuleSet> {
        let mut st = self.state.lock().unwrap();
        let key = ObjectKey::of(rs);
        let cur = st.rule_sets.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if cur.resource_version() != rs.resource_version() {
            return Err(StoreError::Conflict(key.to_string()));
        }
        self.rule_set_updates.fetch_add(1, Ordering::SeqCst);
        let mut next = rs.clone();
        next.status = cur.status.clone();
        next.metadata.resource_version = Some(Self::bump(&mut st));
        if next.metadata.deletion_timestamp.is_some() && next.finalizers().is_empty() {
            st.rule_sets.remove(&key);
        } else {
            st.rule_sets.insert(key, next.clone());
        }
        Ok(next)
    }

    async fn update_rule_set_status(&self, rs: &RuleSet) -> StoreResult<RuleSet> {
        if let Some(e) = self.fail_status.lock().unwrap().take() {
            return Err(e);
        }
        let mut st = self.state.lock().unwrap();
        let key = ObjectKey::of(rs);
        let mut cur = st.rule_sets.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if cur.resource_version() != rs.resource_version() {
            return Err(StoreError::Conflict(key.to_string()));
        }
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        cur.status = rs.status.clone();
        cur.metadata.resource_version = Some(Self::bump(&mut st));
        st.rule_sets.insert(key, cur.clone());
        Ok(cur)
    }

    async fn list_targets(&self, namespace: &str, sel: &LabelSelector) -> StoreResult<Vec<Pod>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let st = self.state.lock().unwrap();
        Ok(st
            .pods
            .values()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| selector::matches(sel, p.labels()).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn get_target(&self, key: &ObjectKey) -> StoreResult<Pod> {
        self.state.lock().unwrap().pods.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn update_target(&self, pod: &Pod) -> StoreResult<Pod> {
        let key = ObjectKey::of(pod);
        if self.conflicts_left.load(Ordering::SeqCst) > 0 {
            self.conflicts_left.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Conflict(key.to_string()));
        }
        let mut st = self.state.lock().unwrap();
        let cur = st.pods.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if cur.resource_version() != pod.resource_version() {
            return Err(StoreError::Conflict(key.to_string()));
        }
        *self.pod_updates.lock().unwrap().entry(key.name.clone()).or_default() += 1;
        let mut next = pod.clone();
        next.metadata.resource_version = Some(Self::bump(&mut st));
        st.pods.insert(key, next.clone());
        Ok(next)
    }
}

/// Returns a fixed result per stage, counts calls and keeps the targets it was handed.
#[derive(Default)]
pub struct ScriptedEvaluator {
    pub results: HashMap<String, StageResult>,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<Pod>>,
}

impl ScriptedEvaluator {
    pub fn with(mut self, stage: &str, res: StageResult) -> Self {
        self.results.insert(stage.to_string(), res);
        self
    }
}

#[async_trait]
impl RuleEvaluator for ScriptedEvaluator {
    async fn evaluate(&self, stage: &str, _rule_set: &RuleSet, targets: &[Pod]) -> StageResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().extend(targets.iter().cloned());
        // stagger completion so merge order differs from pipeline order
        if stage == "PreCheck" {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.results.get(stage).cloned().unwrap_or_default()
    }
}

pub struct Stages(pub Vec<&'static str>);

impl StageProvider for Stages {
    fn stages(&self) -> Vec<String> { self.0.iter().map(|s| s.to_string()).collect() }
}

#[derive(Default)]
pub struct RecordingSink {
    pub keys: Mutex<Vec<ObjectKey>>,
    pub shutting_down: AtomicBool,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.keys.lock().unwrap().iter().map(|k| k.name.clone()).collect();
        v.sort();
        v
    }
}

impl NotificationSink for RecordingSink {
    fn is_shutting_down(&self) -> bool { self.shutting_down.load(Ordering::SeqCst) }
    fn add(&self, key: ObjectKey) { self.keys.lock().unwrap().push(key) }
}

#[derive(Default)]
pub struct RecordingRecorder {
    pub events: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl EventRecorder for RecordingRecorder {
    async fn warning(&self, _rule_set: &RuleSet, reason: &str, note: &str) {
        self.events.lock().unwrap().push((reason.to_string(), note.to_string()));
    }
}

pub fn labels(kv: &[(&str, &str)]) -> BTreeMap<String, String> {
    kv.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn rule_set(name: &str, app: &str) -> RuleSet {
    let mut rs = RuleSet::new(
        name,
        RuleSetSpec { selector: LabelSelector { match_labels: Some(labels(&[("app", app)])), ..Default::default() }, rules: vec![] },
    );
    rs.metadata.namespace = Some(NS.to_string());
    rs.metadata.generation = Some(1);
    rs
}

pub fn with_status(mut rs: RuleSet, status: RuleSetStatus) -> RuleSet {
    rs.status = Some(status);
    rs
}

pub fn terminating(mut rs: RuleSet, force: bool) -> RuleSet {
    rs.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    rs.metadata.finalizers = Some(vec![rulegate_core::CLEANUP_FINALIZER.to_string()]);
    if force {
        rs.metadata.labels = Some(labels(&[(rulegate_core::TERMINATING_LABEL, "true")]));
    }
    rs
}

pub fn pod(name: &str, app: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(labels(&[("app", app)])),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn owned_pod(name: &str, app: &str, owner: &str) -> Pod {
    let mut p = pod(name, app);
    rulegate_core::ownership::add_owner(&mut p, owner);
    p
}

pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        retry: RetryBackoff { steps: 5, base: Duration::from_millis(1), factor: 1.0 },
        ..Default::default()
    }
}

pub struct Harness {
    pub store: Arc<FakeStore>,
    pub guard: Arc<Expectations>,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub sink: Arc<RecordingSink>,
    pub recorder: Arc<RecordingRecorder>,
    pub reconciler: Reconciler,
}

pub fn harness(evaluator: ScriptedEvaluator) -> Harness {
    let store = Arc::new(FakeStore::default());
    let guard = Arc::new(Expectations::default());
    let evaluator = Arc::new(evaluator);
    let sink = Arc::new(RecordingSink::default());
    let recorder = Arc::new(RecordingRecorder::default());
    let reconciler = Reconciler::new(
        store.clone(),
        guard.clone(),
        Arc::new(Stages(vec!["PreCheck", "PostCheck"])),
        evaluator.clone(),
    )
    .with_notifier(rulegate_controller::ChangeNotifier::new(vec![sink.clone() as Arc<dyn NotificationSink>]))
    .with_recorder(recorder.clone())
    .with_config(fast_config());
    Harness { store, guard, evaluator, sink, recorder, reconciler }
}

pub fn key(name: &str) -> ObjectKey { ObjectKey::new(NS, name) }
