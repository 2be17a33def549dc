//! In-process document store.
//!
//! Implements the full [`RemoteStore`] contract over plain maps: predicate filtering,
//! ordering with id tie-breaks, limits, start-after cursors, approximate counts, and a
//! full-snapshot push to every matching subscriber after each write. Faults can be
//! queued per primitive to exercise the layer's failure paths.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::cursor::PageCursor;
use crate::lock::lock;

use super::{
    BATCH_LIMIT, BatchWrite, Direction, Fields, Mutation, Operator, OrderBy, Predicate, Record,
    RemoteError, RemoteQuery, RemoteStore, SnapshotSink, SubscriptionHandle,
};

const SOURCE: &str = "remote::memory";

#[derive(Default)]
struct Faults {
    subscribe: VecDeque<RemoteError>,
    fetch: VecDeque<RemoteError>,
    mutate: VecDeque<RemoteError>,
    count: VecDeque<RemoteError>,
}

struct Watcher {
    id: u64,
    query: RemoteQuery,
    sink: SnapshotSink,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, Fields>>,
    watchers: Vec<Watcher>,
    next_watcher: u64,
    faults: Faults,
    batch_commits: usize,
    fetches: usize,
}

/// In-memory [`RemoteStore`] with live push and fault injection.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `records` into `collection_path` and push snapshots once.
    pub fn seed(&self, collection_path: &str, records: impl IntoIterator<Item = Record>) {
        let mut inner = lock(&self.inner, SOURCE, "seed");
        let docs = inner
            .collections
            .entry(collection_path.to_string())
            .or_default();
        for record in records {
            docs.insert(record.id, record.fields);
        }
        inner.broadcast(collection_path);
    }

    /// Write a document as another client would, pushing snapshots to subscribers.
    pub fn insert(&self, collection_path: &str, record: Record) {
        self.seed(collection_path, [record]);
    }

    /// Delete a document as another client would, pushing snapshots to subscribers.
    pub fn remove(&self, collection_path: &str, id: &str) {
        let mut inner = lock(&self.inner, SOURCE, "remove");
        inner.apply(collection_path, id, Mutation::Delete);
        inner.broadcast(collection_path);
    }

    /// All documents of a collection in id order.
    pub fn documents(&self, collection_path: &str) -> Vec<Record> {
        let inner = lock(&self.inner, SOURCE, "documents");
        inner
            .collections
            .get(collection_path)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Record::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn document(&self, collection_path: &str, id: &str) -> Option<Record> {
        let inner = lock(&self.inner, SOURCE, "document");
        inner
            .collections
            .get(collection_path)
            .and_then(|docs| docs.get(id))
            .map(|fields| Record::new(id, fields.clone()))
    }

    /// Number of live subscriptions that have not been cancelled.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.inner, SOURCE, "active_subscriptions")
            .watchers
            .len()
    }

    pub fn batch_commits(&self) -> usize {
        lock(&self.inner, SOURCE, "batch_commits").batch_commits
    }

    pub fn fetches(&self) -> usize {
        lock(&self.inner, SOURCE, "fetches").fetches
    }

    pub fn fail_next_subscribe(&self, error: RemoteError) {
        lock(&self.inner, SOURCE, "fail_next_subscribe")
            .faults
            .subscribe
            .push_back(error);
    }

    pub fn fail_next_fetch(&self, error: RemoteError) {
        lock(&self.inner, SOURCE, "fail_next_fetch")
            .faults
            .fetch
            .push_back(error);
    }

    /// Fail the next single write or batch commit.
    pub fn fail_next_mutation(&self, error: RemoteError) {
        lock(&self.inner, SOURCE, "fail_next_mutation")
            .faults
            .mutate
            .push_back(error);
    }

    pub fn fail_next_count(&self, error: RemoteError) {
        lock(&self.inner, SOURCE, "fail_next_count")
            .faults
            .count
            .push_back(error);
    }

    /// Deliver a transport error to every subscriber of `collection_path`.
    ///
    /// Like a real listener, a subscription that received an error is closed.
    pub fn push_error(&self, collection_path: &str, error: RemoteError) {
        let mut inner = lock(&self.inner, SOURCE, "push_error");
        inner.watchers.retain(|watcher| {
            if watcher.query.collection_path != collection_path {
                return true;
            }
            let _ = watcher.sink.send(Err(error.clone()));
            false
        });
    }
}

impl Inner {
    fn apply(&mut self, collection_path: &str, id: &str, mutation: Mutation) {
        let docs = self
            .collections
            .entry(collection_path.to_string())
            .or_default();
        match mutation {
            Mutation::Set(mut fields) => {
                fields.remove("id");
                docs.insert(id.to_string(), fields);
            }
            Mutation::Merge(fields) => {
                let doc = docs.entry(id.to_string()).or_default();
                for (name, value) in fields {
                    if name != "id" {
                        doc.insert(name, value);
                    }
                }
            }
            Mutation::Delete => {
                docs.remove(id);
            }
        }
    }

    fn evaluate(&self, query: &RemoteQuery, after: Option<&PageCursor>) -> Vec<Record> {
        let Some(docs) = self.collections.get(&query.collection_path) else {
            return Vec::new();
        };
        let order = query.order_by.as_ref();

        let mut matched: Vec<Record> = docs
            .iter()
            .filter(|(_, fields)| {
                query
                    .predicates
                    .iter()
                    .all(|predicate| matches(fields, predicate))
            })
            // Ordering by a field excludes documents that lack it.
            .filter(|(_, fields)| order.is_none_or(|order| fields.contains_key(&order.field)))
            .map(|(id, fields)| Record::new(id.clone(), fields.clone()))
            .collect();

        matched.sort_by(|a, b| {
            directed(
                order,
                order_value(a, order),
                &a.id,
                order_value(b, order),
                &b.id,
            )
        });

        matched
            .into_iter()
            .filter(|record| {
                after.is_none_or(|cursor| {
                    directed(
                        order,
                        order_value(record, order),
                        &record.id,
                        cursor.value(),
                        cursor.id(),
                    ) == Ordering::Greater
                })
            })
            .take(query.limit)
            .collect()
    }

    fn broadcast(&mut self, collection_path: &str) {
        let snapshots: Vec<(u64, Vec<Record>)> = self
            .watchers
            .iter()
            .filter(|watcher| watcher.query.collection_path == collection_path)
            .map(|watcher| (watcher.id, self.evaluate(&watcher.query, None)))
            .collect();

        for (id, snapshot) in snapshots {
            if let Some(position) = self.watchers.iter().position(|watcher| watcher.id == id) {
                let delivered = self.watchers[position].sink.send(Ok(snapshot)).is_ok();
                if !delivered {
                    debug!(watcher = id, collection_path, "Dropping closed subscriber");
                    self.watchers.remove(position);
                }
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn subscribe(&self, query: &RemoteQuery, sink: SnapshotSink) -> SubscriptionHandle {
        let mut inner = lock(&self.inner, SOURCE, "subscribe");
        if let Some(error) = inner.faults.subscribe.pop_front() {
            let _ = sink.send(Err(error));
            return SubscriptionHandle::detached();
        }

        let _ = sink.send(Ok(inner.evaluate(query, None)));

        let id = inner.next_watcher;
        inner.next_watcher += 1;
        inner.watchers.push(Watcher {
            id,
            query: query.clone(),
            sink,
        });

        let store = Arc::downgrade(&self.inner);
        SubscriptionHandle::new(move || {
            if let Some(store) = store.upgrade() {
                lock(&store, SOURCE, "unsubscribe")
                    .watchers
                    .retain(|watcher| watcher.id != id);
            }
        })
    }

    async fn fetch_once(
        &self,
        query: &RemoteQuery,
        after: Option<&PageCursor>,
    ) -> Result<Vec<Record>, RemoteError> {
        let mut inner = lock(&self.inner, SOURCE, "fetch_once");
        inner.fetches += 1;
        if let Some(error) = inner.faults.fetch.pop_front() {
            return Err(error);
        }
        Ok(inner.evaluate(query, after))
    }

    async fn mutate(
        &self,
        collection_path: &str,
        id: &str,
        mutation: Mutation,
    ) -> Result<(), RemoteError> {
        let mut inner = lock(&self.inner, SOURCE, "mutate");
        if let Some(error) = inner.faults.mutate.pop_front() {
            return Err(error);
        }
        inner.apply(collection_path, id, mutation);
        inner.broadcast(collection_path);
        Ok(())
    }

    async fn commit_batch(
        &self,
        collection_path: &str,
        writes: Vec<BatchWrite>,
    ) -> Result<(), RemoteError> {
        if writes.len() > BATCH_LIMIT {
            return Err(RemoteError::BatchTooLarge {
                size: writes.len(),
                limit: BATCH_LIMIT,
            });
        }

        let mut inner = lock(&self.inner, SOURCE, "commit_batch");
        if let Some(error) = inner.faults.mutate.pop_front() {
            return Err(error);
        }
        for write in writes {
            inner.apply(collection_path, &write.id, write.mutation);
        }
        inner.batch_commits += 1;
        inner.broadcast(collection_path);
        Ok(())
    }

    async fn count_approx(
        &self,
        collection_path: &str,
        predicates: &[Predicate],
    ) -> Result<u64, RemoteError> {
        let mut inner = lock(&self.inner, SOURCE, "count_approx");
        if let Some(error) = inner.faults.count.pop_front() {
            return Err(error);
        }
        let count = inner
            .collections
            .get(collection_path)
            .map(|docs| {
                docs.values()
                    .filter(|fields| predicates.iter().all(|predicate| matches(fields, predicate)))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }
}

fn order_value<'a>(record: &'a Record, order: Option<&OrderBy>) -> Option<&'a Value> {
    order.and_then(|order| record.field(&order.field))
}

/// Compare two `(value, id)` positions under the query's ordering.
fn directed(
    order: Option<&OrderBy>,
    left_value: Option<&Value>,
    left_id: &str,
    right_value: Option<&Value>,
    right_id: &str,
) -> Ordering {
    let ascending = match order {
        Some(_) => compare_values(left_value, right_value).then_with(|| left_id.cmp(right_id)),
        None => left_id.cmp(right_id),
    };
    match order.map(|order| order.direction) {
        Some(Direction::Desc) => ascending.reverse(),
        _ => ascending,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Total order over JSON values: by type first, then by value within a type.
fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Array(a)), Some(Value::Array(b))) => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| compare_values(Some(x), Some(y)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            if a == b {
                Ordering::Equal
            } else {
                Value::Object(a.clone())
                    .to_string()
                    .cmp(&Value::Object(b.clone()).to_string())
            }
        }
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    compare_values(Some(left), Some(right)).is_eq()
}

fn matches(fields: &Fields, predicate: &Predicate) -> bool {
    let Some(actual) = fields.get(&predicate.field) else {
        return false;
    };
    let expected = &predicate.value;
    let same_type = type_rank(Some(actual)) == type_rank(Some(expected));
    let ordering = compare_values(Some(actual), Some(expected));

    match predicate.op {
        Operator::Eq => values_equal(actual, expected),
        Operator::Ne => !values_equal(actual, expected),
        Operator::Lt => same_type && ordering.is_lt(),
        Operator::Le => same_type && ordering.is_le(),
        Operator::Gt => same_type && ordering.is_gt(),
        Operator::Ge => same_type && ordering.is_ge(),
        Operator::In => expected
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|v| values_equal(actual, v))),
        Operator::ArrayContains => actual
            .as_array()
            .is_some_and(|items| items.iter().any(|v| values_equal(v, expected))),
    }
}
