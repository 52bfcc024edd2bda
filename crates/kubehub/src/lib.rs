//! RuleGate kubehub: kube-rs backed implementations of the collaborator
//! traits, plus the watch mapping that turns pod events into RuleSet keys.

#![forbid(unsafe_code)]

use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, ListParams, PostParams},
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        reflector::ObjectRef,
    },
    Client, Resource, ResourceExt,
};
use metrics::counter;
use tracing::{debug, warn};

use rulegate_api::{EventRecorder, ObjectStore, StoreError, StoreResult};
use rulegate_core::{ownership, selector, ObjectKey, RuleSet};

/// Build a client from the ambient kubeconfig / in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    let client = Client::try_default().await?;
    Ok(client)
}

fn classify(e: kube::Error, what: &str) -> StoreError {
    let err = match &e {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(format!("{}: {}", what, resp.message)),
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(format!("{}: {}", what, resp.message)),
        _ => StoreError::Transient(format!("{}: {}", what, e)),
    };
    let class = match err {
        StoreError::NotFound(_) => "not_found",
        StoreError::Conflict(_) => "conflict",
        StoreError::Transient(_) => "transient",
    };
    counter!("kube_store_errors_total", 1u64, "class" => class);
    err
}

/// `ObjectStore` over the API server. Every read goes to the server, no cache.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn rule_sets(&self, ns: &str) -> Api<RuleSet> { Api::namespaced(self.client.clone(), ns) }
    fn pods(&self, ns: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), ns) }
}

fn ns_of<K: ResourceExt>(obj: &K) -> String { obj.namespace().unwrap_or_default() }

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get_rule_set(&self, key: &ObjectKey) -> StoreResult<RuleSet> {
        self.rule_sets(&key.namespace).get(&key.name).await.map_err(|e| classify(e, &format!("get ruleset {}", key)))
    }

    async fn update_rule_set(&self, rs: &RuleSet) -> StoreResult<RuleSet> {
        let what = format!("update ruleset {}", ObjectKey::of(rs));
        self.rule_sets(&ns_of(rs)).replace(&rs.name_any(), &PostParams::default(), rs).await.map_err(|e| classify(e, &what))
    }

    async fn update_rule_set_status(&self, rs: &RuleSet) -> StoreResult<RuleSet> {
        let what = format!("update ruleset status {}", ObjectKey::of(rs));
        let body = serde_json::to_vec(rs).map_err(|e| StoreError::Transient(format!("{}: {}", what, e)))?;
        self.rule_sets(&ns_of(rs)).replace_status(&rs.name_any(), &PostParams::default(), body).await.map_err(|e| classify(e, &what))
    }

    async fn list_targets(&self, namespace: &str, sel: &LabelSelector) -> StoreResult<Vec<Pod>> {
        let query = selector::to_query(sel).map_err(|e| StoreError::Transient(format!("invalid selector: {}", e)))?;
        let lp = ListParams::default().labels(&query);
        debug!(ns = %namespace, selector = %query, "listing pods");
        let list = self.pods(namespace).list(&lp).await.map_err(|e| classify(e, &format!("list pods in {}", namespace)))?;
        Ok(list.items)
    }

    async fn get_target(&self, key: &ObjectKey) -> StoreResult<Pod> {
        self.pods(&key.namespace).get(&key.name).await.map_err(|e| classify(e, &format!("get pod {}", key)))
    }

    async fn update_target(&self, pod: &Pod) -> StoreResult<Pod> {
        let what = format!("update pod {}", ObjectKey::of(pod));
        self.pods(&ns_of(pod)).replace(&pod.name_any(), &PostParams::default(), pod).await.map_err(|e| classify(e, &what))
    }
}

/// Publishes Kubernetes Events against the RuleSet. Failures are logged only.
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        let instance = std::env::var("POD_NAME").ok();
        Self { client, reporter: Reporter { controller: controller.to_string(), instance } }
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeRecorder {
    async fn warning(&self, rule_set: &RuleSet, reason: &str, note: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), rule_set.object_ref(&()));
        let ev = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(ev).await {
            warn!(ruleset = %rule_set.key(), error = %e, "failed to publish event");
        }
    }
}

/// RuleSets a pod event should wake: those in the pod's namespace whose
/// selector matches it, or that the pod still records as an owner.
pub fn rule_sets_for_pod<'a, I>(pod: &Pod, rule_sets: I) -> Vec<ObjectRef<RuleSet>>
where
    I: IntoIterator<Item = &'a RuleSet>,
{
    let ns = pod.namespace();
    let owners = ownership::owners(pod);
    let labels = pod.labels();
    rule_sets
        .into_iter()
        .filter(|rs| rs.namespace() == ns)
        .filter(|rs| owners.contains(&rs.name_any()) || selector::matches(&rs.spec.selector, labels).unwrap_or(false))
        .map(ObjectRef::from_obj)
        .collect()
}
