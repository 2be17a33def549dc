use std::collections::HashSet;

use tracing::{debug, warn};

use crate::cursor::PageCursor;
use crate::error::DataError;

use super::LiveHandle;

/// What a [`LiveHandle::load_more`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMore {
    /// A page was fetched; `count` new records were appended.
    Appended { count: usize },
    /// Another page fetch is still outstanding.
    Busy,
    /// The last page came back short, so there is nothing further.
    Exhausted,
    /// No first page yet, so there is no cursor to continue from.
    Idle,
    /// The subscription was reset while the page was in flight; the page was dropped.
    Discarded,
}

impl LiveHandle {
    /// Fetch the page after `last_cursor` once and append it to `items`.
    ///
    /// The appended tail is not live: the next delivery on the subscription replaces
    /// `items` with the first page again.
    pub async fn load_more(&self) -> Result<LoadMore, DataError> {
        let (generation, descriptor, cursor) = {
            let mut inner = self.shared.lock("load_more.start");
            if inner.disposed {
                return Err(DataError::misuse("load_more"));
            }
            if inner.state.loading_more {
                return Ok(LoadMore::Busy);
            }
            let Some(descriptor) = inner.state.descriptor.clone() else {
                return Ok(LoadMore::Idle);
            };
            let Some(cursor) = inner.state.last_cursor.clone() else {
                return Ok(LoadMore::Idle);
            };
            if !inner.state.has_more {
                return Ok(LoadMore::Exhausted);
            }

            inner.state.loading_more = true;
            let generation = inner.generation;
            self.shared.commit(inner);
            (generation, descriptor, cursor)
        };

        let fetched = self
            .shared
            .ctx
            .remote
            .fetch_once(&descriptor.remote_query(), Some(&cursor))
            .await;

        let mut inner = self.shared.lock("load_more.finish");
        if inner.disposed || inner.generation != generation {
            debug!(
                target = "biztrack::live",
                collection_path = %descriptor.collection_path(),
                generation,
                "Discarding page fetched for a stale subscription"
            );
            return Ok(LoadMore::Discarded);
        }
        inner.state.loading_more = false;

        match fetched {
            Ok(page) => {
                let page_len = page.len();
                if let Some(last) = page.last() {
                    inner.state.last_cursor =
                        Some(PageCursor::after(last, descriptor.order_by.as_ref()));
                }
                inner.state.has_more = page_len == descriptor.page_size;

                let mut seen: HashSet<String> = inner
                    .state
                    .items
                    .iter()
                    .map(|record| record.id.clone())
                    .collect();
                let mut count = 0;
                for record in page {
                    if seen.insert(record.id.clone()) {
                        inner.state.items.push(record);
                        count += 1;
                    }
                }

                debug!(
                    target = "biztrack::live",
                    collection_path = %descriptor.collection_path(),
                    fetched = page_len,
                    appended = count,
                    total = inner.state.items.len(),
                    has_more = inner.state.has_more,
                    "Appended page"
                );
                self.shared.commit(inner);
                Ok(LoadMore::Appended { count })
            }
            Err(err) => {
                let error = DataError::Fetch(err);
                inner.state.error = Some(error.clone());
                warn!(
                    target = "biztrack::live",
                    collection_path = %descriptor.collection_path(),
                    error = %error,
                    "Page fetch failed"
                );
                self.shared.commit(inner);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::cache::{CacheConfig, CacheStore};
    use crate::identity::{Identity, IdentityHandle};
    use crate::live::{LiveContext, LiveQuery, Phase, QueryState, ViewSpec};
    use crate::notify::TracingNotifier;
    use crate::remote::{MemoryRemote, OrderBy, Record, RemoteError};

    use super::*;

    const PATH: &str = "users/u1/tasks";

    fn open(remote: &MemoryRemote, page_size: usize) -> LiveQuery {
        LiveQuery::open(
            LiveContext {
                remote: Arc::new(remote.clone()),
                cache: Arc::new(CacheStore::memory_only(&CacheConfig::memory_only(8))),
                notifier: Arc::new(TracingNotifier),
                identity: IdentityHandle::new(Identity::signed_in("u1")),
                owner_scope: "users".to_string(),
                default_page_size: 50,
                views: Default::default(),
            },
            ViewSpec::new("tasks")
                .order_by(OrderBy::asc("dueDate"))
                .page_size(page_size),
        )
    }

    fn task(id: &str, due: &str) -> Record {
        Record::from_json(id, json!({"dueDate": due, "title": id}))
    }

    async fn streaming(query: &LiveQuery) -> Arc<QueryState> {
        let mut rx = query.watch();
        let state = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.phase == Phase::Streaming),
        )
        .await
        .expect("streaming in time")
        .expect("query alive");
        Arc::clone(&state)
    }

    #[tokio::test]
    async fn exhausted_after_short_first_page() {
        let remote = MemoryRemote::new();
        remote.seed(PATH, [task("t1", "2024-01-01")]);
        let query = open(&remote, 2);
        streaming(&query).await;

        assert_eq!(query.load_more().await, Ok(LoadMore::Exhausted));
        assert_eq!(remote.fetches(), 0);
    }

    #[tokio::test]
    async fn idle_before_first_page() {
        let remote = MemoryRemote::new();
        let query = open(&remote, 2);
        assert_eq!(query.load_more().await, Ok(LoadMore::Idle));
    }

    #[tokio::test]
    async fn fetch_failure_is_stored_and_returned() {
        let remote = MemoryRemote::new();
        remote.seed(
            PATH,
            [
                task("t1", "2024-01-01"),
                task("t2", "2024-01-02"),
                task("t3", "2024-01-03"),
            ],
        );
        let query = open(&remote, 2);
        streaming(&query).await;

        remote.fail_next_fetch(RemoteError::Unavailable("offline".to_string()));
        let result = query.load_more().await;
        assert!(matches!(result, Err(DataError::Fetch(_))));

        let state = query.snapshot();
        assert!(matches!(state.error, Some(DataError::Fetch(_))));
        assert_eq!(state.ids(), ["t1", "t2"]);
        assert!(!state.loading_more);

        assert_eq!(query.load_more().await, Ok(LoadMore::Appended { count: 1 }));
        assert_eq!(query.snapshot().ids(), ["t1", "t2", "t3"]);
    }
}
