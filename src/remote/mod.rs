//! Remote document-store contract.
//!
//! The data-access layer never talks to a concrete backend directly. Everything it
//! needs from the store (live snapshot subscriptions, one-shot page fetches, single
//! and batched writes, approximate counts) is expressed by [`RemoteStore`].

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cursor::PageCursor;

pub use memory::MemoryRemote;

/// Maximum number of writes the store accepts in one batch commit.
pub const BATCH_LIMIT: usize = 500;

/// Document body without its identifier.
pub type Fields = Map<String, Value>;

/// A business document as delivered by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Record {
    /// Build a record, dropping any `id` key from the body so it is never duplicated.
    pub fn new(id: impl Into<String>, mut fields: Fields) -> Self {
        fields.remove("id");
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a record from a JSON object literal. Non-object values yield an empty body.
    pub fn from_json(id: impl Into<String>, value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::new(id, fields),
            _ => Self::new(id, Fields::new()),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "array-contains")]
    ArrayContains,
}

/// A single `field op value` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Query shape handed to the store for both live and one-shot reads.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteQuery {
    pub collection_path: String,
    pub predicates: Vec<Predicate>,
    pub order_by: Option<OrderBy>,
    pub limit: usize,
}

/// Write applied to a single document.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Replace the whole document, creating it when absent.
    Set(Fields),
    /// Merge the given fields into the document, creating it when absent.
    Merge(Fields),
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchWrite {
    pub id: String,
    pub mutation: Mutation,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("document `{id}` not found")]
    NotFound { id: String },
    #[error("query rejected: {0}")]
    InvalidQuery(String),
    #[error("batch of {size} writes exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
}

/// One delivery on a live subscription: a full replacement snapshot or a transport error.
pub type SnapshotEvent = Result<Vec<Record>, RemoteError>;

/// Channel the store pushes [`SnapshotEvent`]s into.
pub type SnapshotSink = mpsc::UnboundedSender<SnapshotEvent>;

/// Handle for an open live subscription.
///
/// Unsubscribing is idempotent and also happens on drop.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel, for stores that close the stream themselves.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Document-store primitives consumed by the data-access layer.
///
/// Collection paths follow `{owner_scope}/{owner_id}/{collection}`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open a live view. Snapshots and transport errors arrive through `sink`; setup
    /// itself never fails.
    fn subscribe(&self, query: &RemoteQuery, sink: SnapshotSink) -> SubscriptionHandle;

    /// Fetch a single page, starting strictly after `after` when given.
    async fn fetch_once(
        &self,
        query: &RemoteQuery,
        after: Option<&PageCursor>,
    ) -> Result<Vec<Record>, RemoteError>;

    async fn mutate(
        &self,
        collection_path: &str,
        id: &str,
        mutation: Mutation,
    ) -> Result<(), RemoteError>;

    /// Commit up to [`BATCH_LIMIT`] writes atomically.
    async fn commit_batch(
        &self,
        collection_path: &str,
        writes: Vec<BatchWrite>,
    ) -> Result<(), RemoteError>;

    async fn count_approx(
        &self,
        collection_path: &str,
        predicates: &[Predicate],
    ) -> Result<u64, RemoteError>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn record_strips_embedded_id() {
        let record = Record::from_json("c1", json!({"id": "other", "name": "Ada"}));
        assert_eq!(record.id, "c1");
        assert!(record.field("id").is_none());

        let encoded = serde_json::to_value(&record).expect("record serializes");
        assert_eq!(encoded, json!({"id": "c1", "name": "Ada"}));
    }

    #[test]
    fn subscription_handle_cancels_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut handle = SubscriptionHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.unsubscribe();
        handle.unsubscribe();
        drop(handle);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn operators_use_store_notation() {
        let predicate = Predicate::new("status", Operator::Eq, "Active");
        let encoded = serde_json::to_value(&predicate).expect("predicate serializes");
        assert_eq!(encoded["op"], json!("=="));
    }
}
