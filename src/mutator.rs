//! Optimistic writes against a live view.
//!
//! Single-record updates and deletes are staged into the cached first page of the view
//! before the remote call and rolled back to the exact previous entry if it fails.
//! Adds and bulk writes stage nothing; the view is refreshed once the store accepts
//! them.

use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheStore, QueryDescriptor, QueryKey};
use crate::error::{DataError, MutationKind};
use crate::live::LiveHandle;
use crate::notify::Notifier;
use crate::remote::{BATCH_LIMIT, BatchWrite, Fields, Mutation, Record, RemoteError, RemoteStore};

const METRIC_MUTATION_ROLLBACK: &str = "biztrack_mutation_rollback_total";

/// Names used in user-facing messages, e.g. "Client" / "Clients".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLabels {
    pub singular: String,
    pub plural: String,
}

impl Default for EntityLabels {
    fn default() -> Self {
        Self::new("Record", "Records")
    }
}

impl EntityLabels {
    pub fn new(singular: impl Into<String>, plural: impl Into<String>) -> Self {
        Self {
            singular: singular.into(),
            plural: plural.into(),
        }
    }

    pub fn success_title(&self, kind: MutationKind) -> String {
        match kind {
            MutationKind::Add => format!("{} added successfully", self.singular),
            MutationKind::Update => format!("{} updated", self.singular),
            MutationKind::Delete => format!("{} deleted", self.singular),
            MutationKind::BulkAdd => format!("{} imported", self.plural),
            MutationKind::BulkUpdate => format!("{} updated", self.plural),
            MutationKind::BulkDelete => format!("{} deleted", self.plural),
        }
    }

    pub fn failure_title(&self, kind: MutationKind) -> String {
        let singular = self.singular.to_lowercase();
        match kind {
            MutationKind::Add => format!("Failed to add {singular}"),
            MutationKind::Update => format!("Failed to update {singular}"),
            MutationKind::Delete => format!("Failed to delete {singular}"),
            MutationKind::BulkAdd => format!("Failed to import {}", self.plural.to_lowercase()),
            MutationKind::BulkUpdate => "Failed to bulk update".to_string(),
            MutationKind::BulkDelete => "Failed to bulk delete".to_string(),
        }
    }
}

/// Tracks optimistic writes per (cache key, record id).
#[derive(Clone, Default)]
struct InFlightWrites {
    records: Arc<DashMap<(QueryKey, String), usize>>,
}

impl InFlightWrites {
    /// Register a write. A second concurrent write on the same record proceeds, but its
    /// rollback may clobber the first one's staged state.
    fn acquire(&self, key: &QueryKey, id: &str) -> WriteGuard {
        let slot = (key.clone(), id.to_string());
        let mut outstanding = self.records.entry(slot.clone()).or_insert(0);
        if *outstanding > 0 {
            warn!(
                target = "biztrack::mutator",
                key = %key,
                id,
                outstanding = *outstanding,
                "Concurrent optimistic write on the same record"
            );
        }
        *outstanding += 1;
        drop(outstanding);

        WriteGuard {
            slot,
            records: Arc::clone(&self.records),
        }
    }
}

struct WriteGuard {
    slot: (QueryKey, String),
    records: Arc<DashMap<(QueryKey, String), usize>>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.records
            .remove_if_mut(&self.slot, |_, outstanding| {
                *outstanding = outstanding.saturating_sub(1);
                *outstanding == 0
            });
    }
}

/// Write path bound to one live view.
pub struct OptimisticMutator {
    live: LiveHandle,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<CacheStore>,
    notifier: Arc<dyn Notifier>,
    labels: EntityLabels,
    in_flight: InFlightWrites,
}

impl OptimisticMutator {
    pub fn new(
        live: LiveHandle,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<CacheStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            live,
            remote,
            cache,
            notifier,
            labels: EntityLabels::default(),
            in_flight: InFlightWrites::default(),
        }
    }

    pub fn with_labels(mut self, labels: EntityLabels) -> Self {
        self.labels = labels;
        self
    }

    fn descriptor(&self, kind: MutationKind) -> Result<QueryDescriptor, DataError> {
        if self.live.is_disposed() {
            return Err(DataError::misuse(kind.as_str()));
        }
        self.live
            .descriptor()
            .ok_or_else(|| DataError::no_owner(kind.as_str()))
    }

    /// Replace `record` in the view and merge its fields into the remote document.
    pub async fn update(&self, record: Record) -> Result<(), DataError> {
        let descriptor = self.descriptor(MutationKind::Update)?;
        let key = descriptor.cache_key();
        let _guard = self.in_flight.acquire(&key, &record.id);

        let previous = self.cache.get(&key).await;
        if let Some(previous) = &previous {
            let next = previous
                .data
                .iter()
                .map(|cached| {
                    if cached.id == record.id {
                        record.clone()
                    } else {
                        cached.clone()
                    }
                })
                .collect();
            self.stage(previous, next).await;
        }

        let result = self
            .remote
            .mutate(
                &descriptor.collection_path(),
                &record.id,
                Mutation::Merge(record.fields.clone()),
            )
            .await;
        self.settle(MutationKind::Update, &record.id, previous, result)
            .await
    }

    /// Remove `id` from the view and delete the remote document.
    pub async fn delete(&self, id: &str) -> Result<(), DataError> {
        let descriptor = self.descriptor(MutationKind::Delete)?;
        let key = descriptor.cache_key();
        let _guard = self.in_flight.acquire(&key, id);

        let previous = self.cache.get(&key).await;
        if let Some(previous) = &previous {
            let next = previous
                .data
                .iter()
                .filter(|cached| cached.id != id)
                .cloned()
                .collect();
            self.stage(previous, next).await;
        }

        let result = self
            .remote
            .mutate(&descriptor.collection_path(), id, Mutation::Delete)
            .await;
        self.settle(MutationKind::Delete, id, previous, result).await
    }

    /// Create a document, generating an id when `record.id` is empty. Returns the id.
    pub async fn add(&self, record: Record) -> Result<String, DataError> {
        let kind = MutationKind::Add;
        let descriptor = self.descriptor(kind)?;
        let id = assign_id(record.id);

        let result = self
            .remote
            .mutate(
                &descriptor.collection_path(),
                &id,
                Mutation::Set(record.fields),
            )
            .await;
        match result {
            Ok(()) => {
                self.succeeded(kind, &id, 1);
                self.refresh_view();
                Ok(id)
            }
            Err(err) => Err(self.failed(kind, &id, err)),
        }
    }

    /// Create many documents in batches. Empty ids get a generated one.
    pub async fn bulk_add(&self, records: Vec<Record>) -> Result<usize, DataError> {
        let writes = records
            .into_iter()
            .map(|record| BatchWrite {
                id: assign_id(record.id),
                mutation: Mutation::Set(record.fields),
            })
            .collect();
        self.commit_chunked(MutationKind::BulkAdd, writes).await
    }

    /// Merge `patch` into every document in `ids`.
    pub async fn bulk_update(&self, ids: &[String], patch: Fields) -> Result<usize, DataError> {
        let writes = ids
            .iter()
            .map(|id| BatchWrite {
                id: id.clone(),
                mutation: Mutation::Merge(patch.clone()),
            })
            .collect();
        self.commit_chunked(MutationKind::BulkUpdate, writes).await
    }

    pub async fn bulk_delete(&self, ids: &[String]) -> Result<usize, DataError> {
        let writes = ids
            .iter()
            .map(|id| BatchWrite {
                id: id.clone(),
                mutation: Mutation::Delete,
            })
            .collect();
        self.commit_chunked(MutationKind::BulkDelete, writes).await
    }

    async fn stage(&self, previous: &CacheEntry, next: Vec<Record>) {
        self.cache
            .set(
                previous.key.clone(),
                next,
                &previous.owner_id,
                previous.metadata.clone(),
            )
            .await;
        self.refresh_view();
    }

    async fn settle(
        &self,
        kind: MutationKind,
        id: &str,
        previous: Option<CacheEntry>,
        result: Result<(), RemoteError>,
    ) -> Result<(), DataError> {
        match result {
            Ok(()) => {
                self.succeeded(kind, id, 1);
                Ok(())
            }
            Err(err) => {
                if let Some(previous) = previous {
                    counter!(METRIC_MUTATION_ROLLBACK).increment(1);
                    info!(
                        target = "biztrack::mutator",
                        key = %previous.key,
                        id,
                        operation = kind.as_str(),
                        "Rolling back optimistic write"
                    );
                    self.cache.restore(previous).await;
                    self.refresh_view();
                }
                Err(self.failed(kind, id, err))
            }
        }
    }

    /// Commit `writes` in store-sized batches. Batches before a failing one stay
    /// committed.
    async fn commit_chunked(
        &self,
        kind: MutationKind,
        writes: Vec<BatchWrite>,
    ) -> Result<usize, DataError> {
        let descriptor = self.descriptor(kind)?;
        if writes.is_empty() {
            return Ok(0);
        }
        let path = descriptor.collection_path();
        let total = writes.len();

        for chunk in writes.chunks(BATCH_LIMIT) {
            if let Err(err) = self.remote.commit_batch(&path, chunk.to_vec()).await {
                let first = chunk.first().map(|write| write.id.as_str()).unwrap_or_default();
                return Err(self.failed(kind, first, err));
            }
        }

        self.succeeded(kind, &path, total);
        self.refresh_view();
        Ok(total)
    }

    fn succeeded(&self, kind: MutationKind, id: &str, count: usize) {
        info!(
            target = "biztrack::mutator",
            operation = kind.as_str(),
            id,
            count,
            "Mutation committed"
        );
        self.notifier.success(&self.labels.success_title(kind), "");
    }

    fn failed(&self, kind: MutationKind, id: &str, err: RemoteError) -> DataError {
        warn!(
            target = "biztrack::mutator",
            operation = kind.as_str(),
            id,
            error = %err,
            "Mutation failed"
        );
        self.notifier
            .error(&self.labels.failure_title(kind), &err.to_string());
        DataError::mutation(kind, id, err)
    }

    fn refresh_view(&self) {
        if let Err(err) = self.live.refresh() {
            debug!(target = "biztrack::mutator", error = %err, "Skipped view refresh");
        }
    }
}

fn assign_id(id: String) -> String {
    if id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_follow_operation() {
        let labels = EntityLabels::new("Client", "Clients");
        assert_eq!(labels.success_title(MutationKind::Update), "Client updated");
        assert_eq!(
            labels.failure_title(MutationKind::Delete),
            "Failed to delete client"
        );
        assert_eq!(labels.success_title(MutationKind::BulkAdd), "Clients imported");
        assert_eq!(
            labels.failure_title(MutationKind::BulkDelete),
            "Failed to bulk delete"
        );
    }

    #[test]
    fn in_flight_slot_clears_after_last_guard() {
        let writes = InFlightWrites::default();
        let key = QueryKey::from("u1:clients:{}".to_string());

        let first = writes.acquire(&key, "c1");
        let second = writes.acquire(&key, "c1");
        assert_eq!(
            writes
                .records
                .get(&(key.clone(), "c1".to_string()))
                .map(|n| *n),
            Some(2)
        );

        drop(first);
        drop(second);
        assert!(writes.records.is_empty());
    }

    #[test]
    fn empty_ids_are_generated() {
        assert_eq!(assign_id("c1".to_string()), "c1");
        let generated = assign_id(String::new());
        assert!(Uuid::parse_str(&generated).is_ok());
    }
}
