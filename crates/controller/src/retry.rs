//! Optimistic-concurrency write loops.

use std::future::Future;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use rulegate_api::{ObjectStore, StoreResult};
use rulegate_core::ObjectKey;
use tracing::debug;

use crate::{Error, Result, RetryBackoff};

/// Run `op` until it succeeds, retrying only on conflict with bounded backoff.
pub async fn retry_on_conflict<T, F, Fut>(backoff: &RetryBackoff, key: &ObjectKey, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let steps = backoff.steps.max(1);
    for attempt in 1..=steps {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_conflict() => {
                debug!(object = %key, attempt, error = %e, "write conflict");
                if attempt < steps {
                    tokio::time::sleep(backoff.delay(attempt)).await;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::RetryExhausted { key: key.clone(), attempts: steps })
}

/// What a target mutation ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetWrite {
    /// Written; carries the resource version the write started from and the pod as stored.
    Written { base_version: String, pod: Box<Pod> },
    /// Mutation was a no-op on the live object, which is returned as fetched.
    Unchanged(Box<Pod>),
    /// Target no longer exists.
    Gone,
}

impl TargetWrite {
    /// The live pod after the mutation, unless it is gone.
    pub fn into_pod(self) -> Option<Pod> {
        match self {
            TargetWrite::Written { pod, .. } | TargetWrite::Unchanged(pod) => Some(*pod),
            TargetWrite::Gone => None,
        }
    }
}

/// Re-fetch the target, apply `mutate`, write it back. Conflicts retry,
/// not-found counts as success. `mutate` must be idempotent.
pub async fn mutate_target<F>(store: &dyn ObjectStore, key: &ObjectKey, backoff: &RetryBackoff, mutate: F) -> Result<TargetWrite>
where
    F: Fn(&mut Pod) -> bool,
{
    let mutate = &mutate;
    retry_on_conflict(backoff, key, move || async move {
        let mut pod = match store.get_target(key).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => return Ok(TargetWrite::Gone),
            Err(e) => return Err(e),
        };
        if !mutate(&mut pod) {
            return Ok(TargetWrite::Unchanged(Box::new(pod)));
        }
        let base_version = pod.resource_version().unwrap_or_default();
        match store.update_target(&pod).await {
            Ok(written) => Ok(TargetWrite::Written { base_version, pod: Box::new(written) }),
            Err(e) if e.is_not_found() => Ok(TargetWrite::Gone),
            Err(e) => Err(e),
        }
    })
    .await
}
