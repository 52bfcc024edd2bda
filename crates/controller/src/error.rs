//! Errors surfaced by a reconcile pass.

use rulegate_api::StoreError;
use rulegate_core::{selector::SelectorError, ObjectKey};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("gave up writing {key} after {attempts} conflicting attempts")]
    RetryExhausted { key: ObjectKey, attempts: u32 },
    #[error("invalid selector on ruleset {key}: {source}")]
    Selector {
        key: ObjectKey,
        #[source]
        source: SelectorError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
