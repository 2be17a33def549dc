//! Approximate totals for a filtered collection.
//!
//! Counts are fetched independently of the paginated view and only when the filter
//! changes or on explicit refresh. Mutations never touch them, so a count may lag an
//! add or delete until the caller refreshes it.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::QueryDescriptor;
use crate::error::DataError;
use crate::lock::lock;
use crate::remote::RemoteStore;

const SOURCE: &str = "count";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountState {
    pub count: Option<u64>,
    pub loading: bool,
    pub error: Option<DataError>,
}

#[derive(Default)]
struct Tracking {
    descriptor: Option<QueryDescriptor>,
    generation: u64,
}

pub struct CountEstimator {
    remote: Arc<dyn RemoteStore>,
    tracking: Mutex<Tracking>,
    state_tx: watch::Sender<CountState>,
}

impl CountEstimator {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        let (state_tx, _) = watch::channel(CountState::default());
        Self {
            remote,
            tracking: Mutex::new(Tracking::default()),
            state_tx,
        }
    }

    /// One-shot count for `descriptor`, leaving the tracked state alone.
    pub async fn estimate(&self, descriptor: &QueryDescriptor) -> Result<u64, DataError> {
        self.remote
            .count_approx(&descriptor.collection_path(), &descriptor.predicates)
            .await
            .map_err(DataError::Fetch)
    }

    /// Follow `descriptor`. Refetches only when its filtered set differs from the one
    /// already tracked; ordering and page size changes keep the current count.
    pub async fn track(&self, descriptor: QueryDescriptor) -> Result<Option<u64>, DataError> {
        let generation = {
            let mut tracking = lock(&self.tracking, SOURCE, "track");
            let unchanged = tracking
                .descriptor
                .as_ref()
                .is_some_and(|tracked| tracked.filter_key() == descriptor.filter_key());
            tracking.descriptor = Some(descriptor.clone());
            if unchanged {
                return Ok(self.state_tx.borrow().count);
            }
            tracking.generation += 1;
            tracking.generation
        };
        self.fetch(generation, descriptor).await
    }

    /// Refetch the tracked count. `Ok(None)` when nothing is tracked.
    pub async fn refresh(&self) -> Result<Option<u64>, DataError> {
        let (generation, descriptor) = {
            let mut tracking = lock(&self.tracking, SOURCE, "refresh");
            let Some(descriptor) = tracking.descriptor.clone() else {
                return Ok(None);
            };
            tracking.generation += 1;
            (tracking.generation, descriptor)
        };
        self.fetch(generation, descriptor).await
    }

    pub fn current(&self) -> CountState {
        self.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CountState> {
        self.state_tx.subscribe()
    }

    async fn fetch(
        &self,
        generation: u64,
        descriptor: QueryDescriptor,
    ) -> Result<Option<u64>, DataError> {
        self.state_tx.send_modify(|state| state.loading = true);
        let result = self.estimate(&descriptor).await;

        let current = lock(&self.tracking, SOURCE, "fetch").generation == generation;
        if !current {
            debug!(
                target = "biztrack::count",
                collection_path = %descriptor.collection_path(),
                "Discarding count for a superseded filter"
            );
            return result.map(Some);
        }

        match result {
            Ok(count) => {
                self.state_tx.send_replace(CountState {
                    count: Some(count),
                    loading: false,
                    error: None,
                });
                Ok(Some(count))
            }
            Err(error) => {
                warn!(
                    target = "biztrack::count",
                    collection_path = %descriptor.collection_path(),
                    error = %error,
                    "Count fetch failed"
                );
                self.state_tx.send_modify(|state| {
                    state.loading = false;
                    state.error = Some(error.clone());
                });
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::remote::{MemoryRemote, Operator, OrderBy, Predicate, Record, RemoteError};

    use super::*;

    const PATH: &str = "users/u1/clients";

    fn descriptor(status: &str, page_size: usize) -> QueryDescriptor {
        QueryDescriptor {
            owner_scope: "users".to_string(),
            owner_id: "u1".to_string(),
            collection: "clients".to_string(),
            predicates: vec![Predicate::new("status", Operator::Eq, status)],
            order_by: Some(OrderBy::asc("clientName")),
            page_size,
        }
    }

    fn seeded() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.seed(
            PATH,
            [
                Record::from_json("a", json!({"status": "Active", "clientName": "A"})),
                Record::from_json("b", json!({"status": "Active", "clientName": "B"})),
                Record::from_json("c", json!({"status": "Archived", "clientName": "C"})),
            ],
        );
        remote
    }

    #[tokio::test]
    async fn counts_follow_filter_changes_only() {
        let remote = seeded();
        let estimator = CountEstimator::new(Arc::new(remote.clone()));

        assert_eq!(estimator.track(descriptor("Active", 2)).await, Ok(Some(2)));

        remote.remove(PATH, "a");
        assert_eq!(estimator.track(descriptor("Active", 10)).await, Ok(Some(2)));
        assert_eq!(estimator.current().count, Some(2));

        assert_eq!(estimator.refresh().await, Ok(Some(1)));
        assert_eq!(estimator.track(descriptor("Archived", 10)).await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn failures_are_stored_in_state() {
        let remote = seeded();
        let estimator = CountEstimator::new(Arc::new(remote.clone()));
        remote.fail_next_count(RemoteError::Unavailable("offline".to_string()));

        let result = estimator.track(descriptor("Active", 2)).await;
        assert!(matches!(result, Err(DataError::Fetch(_))));

        let state = estimator.current();
        assert!(!state.loading);
        assert!(state.count.is_none());
        assert!(matches!(state.error, Some(DataError::Fetch(_))));
    }

    #[tokio::test]
    async fn refresh_without_tracking_is_noop() {
        let estimator = CountEstimator::new(Arc::new(MemoryRemote::new()));
        assert_eq!(estimator.refresh().await, Ok(None));
    }
}
