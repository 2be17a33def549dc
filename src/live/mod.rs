//! Live paginated views over remote collections.
//!
//! A [`LiveQuery`] owns one remote subscription at a time. Every delivery is a full
//! replacement of the first page: it replaces `items`, is written through to the
//! [`CacheStore`], and is published to observers. Extra pages come from
//! [`LiveHandle::load_more`] and are appended until the next live delivery replaces
//! them again.
//!
//! Each (re)subscription bumps a generation counter. Deliveries and late page fetches
//! carrying an older generation are dropped, so nothing from a torn-down subscription
//! reaches the state or the cache.

mod load_more;
mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use metrics::counter;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, QueryDescriptor};
use crate::cursor::PageCursor;
use crate::error::DataError;
use crate::identity::{Identity, IdentityHandle};
use crate::lock::lock;
use crate::notify::Notifier;
use crate::remote::{Record, RemoteError, RemoteStore, SnapshotEvent, SubscriptionHandle};

pub use load_more::LoadMore;
pub use state::{Phase, QueryState, ViewSpec};

const SOURCE: &str = "live";
const METRIC_SNAPSHOT_APPLIED: &str = "biztrack_snapshot_applied_total";

/// Title shown to the user when a live view fails.
pub const LOAD_ERROR_TITLE: &str = "Failed to load data. Please try again.";

/// Collaborators shared by every live query of a data layer.
#[derive(Clone)]
pub struct LiveContext {
    pub remote: Arc<dyn RemoteStore>,
    pub cache: Arc<CacheStore>,
    pub notifier: Arc<dyn Notifier>,
    pub identity: IdentityHandle,
    pub owner_scope: String,
    pub default_page_size: usize,
    pub views: LiveRegistry,
}

/// Every live query opened through one context.
///
/// Lets an identity change reach all open queries before the caller moves on, instead of
/// waiting for each query's follower task to be scheduled.
#[derive(Clone, Default)]
pub struct LiveRegistry {
    views: Arc<Mutex<Vec<Weak<Shared>>>>,
}

impl LiveRegistry {
    fn register(&self, shared: &Arc<Shared>) {
        let mut views = lock(&self.views, SOURCE, "registry.register");
        views.retain(|view| view.strong_count() > 0);
        views.push(Arc::downgrade(shared));
    }

    fn open_views(&self) -> Vec<Arc<Shared>> {
        let mut views = lock(&self.views, SOURCE, "registry.open_views");
        views.retain(|view| view.strong_count() > 0);
        views.iter().filter_map(Weak::upgrade).collect()
    }

    /// Move every open query onto `identity` and wait until none of them is still
    /// writing a snapshot for the previous owner into the cache.
    pub async fn apply_identity(&self, identity: &Identity) {
        for shared in self.open_views() {
            shared.on_identity(identity);
            let _settled = shared.cache_writes.lock().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&QueryState) + Send + Sync>;

struct Inner {
    state: QueryState,
    view: ViewSpec,
    /// Owner the current subscription was opened for.
    owner: Option<String>,
    generation: u64,
    subscription: Option<SubscriptionHandle>,
    pump: Option<JoinHandle<()>>,
    follower: Option<JoinHandle<()>>,
    disposed: bool,
}

impl Inner {
    /// Stop the current subscription. Anything still in flight for it becomes stale.
    fn teardown(&mut self) {
        self.generation += 1;
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.state.loading_more = false;
    }
}

pub(crate) struct Shared {
    ctx: LiveContext,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<Arc<QueryState>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    /// Held across the cache write of a delivery.
    cache_writes: AsyncMutex<()>,
}

impl Shared {
    fn lock(&self, op: &'static str) -> MutexGuard<'_, Inner> {
        lock(&self.inner, SOURCE, op)
    }

    /// Publish the state held by `inner`, then run listeners outside the lock.
    fn commit(&self, inner: MutexGuard<'_, Inner>) {
        self.state_tx.send_replace(Arc::new(inner.state.clone()));
        drop(inner);

        let latest = self.state_tx.borrow().clone();
        let listeners: Vec<Listener> = lock(&self.listeners, SOURCE, "commit.listeners")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&latest);
        }
    }

    fn resubscribe(self: &Arc<Self>, reason: &'static str) {
        let mut inner = self.lock("resubscribe");
        if inner.disposed {
            return;
        }
        inner.teardown();

        let identity = self.ctx.identity.current();
        let Some(owner) = identity.active_owner() else {
            inner.owner = None;
            inner.state = QueryState::idle();
            info!(
                target = "biztrack::live",
                collection = %inner.view.collection,
                reason,
                phase = Phase::Idle.as_str(),
                "No active owner; live query idle"
            );
            self.commit(inner);
            return;
        };

        let descriptor = inner.view.descriptor(
            &self.ctx.owner_scope,
            owner,
            self.ctx.default_page_size,
        );
        let generation = inner.generation;
        inner.owner = Some(owner.to_string());
        inner.state = QueryState::subscribing(descriptor.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscription = Some(self.ctx.remote.subscribe(&descriptor.remote_query(), tx));
        inner.pump = Some(tokio::spawn(pump(
            Arc::downgrade(self),
            generation,
            descriptor.clone(),
            rx,
        )));

        info!(
            target = "biztrack::live",
            collection_path = %descriptor.collection_path(),
            generation,
            reason,
            phase = Phase::Subscribing.as_str(),
            "Live query subscribing"
        );
        self.commit(inner);
    }

    fn is_current(&self, generation: u64) -> bool {
        let inner = self.lock("is_current");
        !inner.disposed && inner.generation == generation
    }

    /// Whether a delivery for `descriptor` may still touch the cache.
    fn may_cache(&self, generation: u64, descriptor: &QueryDescriptor) -> bool {
        self.is_current(generation)
            && self.ctx.identity.current().active_owner() == Some(descriptor.owner_id.as_str())
    }

    async fn apply_snapshot(
        &self,
        generation: u64,
        descriptor: &QueryDescriptor,
        records: Vec<Record>,
    ) {
        let cursor = records
            .last()
            .map(|last| PageCursor::after(last, descriptor.order_by.as_ref()));

        {
            let _writing = self.cache_writes.lock().await;
            if !self.may_cache(generation, descriptor) {
                debug!(
                    target = "biztrack::live",
                    collection_path = %descriptor.collection_path(),
                    generation,
                    "Dropped stale live snapshot"
                );
                return;
            }
            let metadata = cursor
                .as_ref()
                .map(|cursor| json!({ "lastCursor": cursor.encode() }));
            self.ctx
                .cache
                .set(
                    descriptor.cache_key(),
                    records.clone(),
                    &descriptor.owner_id,
                    metadata,
                )
                .await;
        }

        let mut inner = self.lock("apply_snapshot");
        if inner.disposed || inner.generation != generation {
            return;
        }
        let count = records.len();
        inner.state.has_more = count == descriptor.page_size;
        inner.state.items = records;
        inner.state.last_cursor = cursor;
        inner.state.loading = false;
        inner.state.error = None;
        inner.state.phase = Phase::Streaming;

        counter!(METRIC_SNAPSHOT_APPLIED).increment(1);
        debug!(
            target = "biztrack::live",
            collection_path = %descriptor.collection_path(),
            generation,
            count,
            has_more = inner.state.has_more,
            phase = Phase::Streaming.as_str(),
            "Applied live snapshot"
        );
        self.commit(inner);
    }

    fn apply_error(&self, generation: u64, descriptor: &QueryDescriptor, error: RemoteError) {
        let mut inner = self.lock("apply_error");
        if inner.disposed || inner.generation != generation {
            return;
        }
        // The transport closes a listener after an error; a new one needs `refresh`.
        if let Some(mut subscription) = inner.subscription.take() {
            subscription.unsubscribe();
        }
        inner.state.loading = false;
        inner.state.error = Some(DataError::Subscription(error.clone()));
        inner.state.phase = Phase::Error;

        warn!(
            target = "biztrack::live",
            collection_path = %descriptor.collection_path(),
            generation,
            error = %error,
            phase = Phase::Error.as_str(),
            "Live subscription failed"
        );
        self.commit(inner);
        self.ctx.notifier.error(LOAD_ERROR_TITLE, &error.to_string());
    }

    fn on_identity(self: &Arc<Self>, identity: &Identity) {
        let unchanged = {
            let inner = self.lock("on_identity");
            inner.disposed || inner.owner.as_deref() == identity.active_owner()
        };
        if !unchanged {
            self.resubscribe("identity changed");
        }
    }
}

async fn pump(
    shared: Weak<Shared>,
    generation: u64,
    descriptor: QueryDescriptor,
    mut deliveries: mpsc::UnboundedReceiver<SnapshotEvent>,
) {
    while let Some(event) = deliveries.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            Ok(records) => {
                shared
                    .apply_snapshot(generation, &descriptor, records)
                    .await
            }
            Err(error) => shared.apply_error(generation, &descriptor, error),
        }
    }
}

async fn follow_identity(shared: Weak<Shared>, mut identity: watch::Receiver<Identity>) {
    while identity.changed().await.is_ok() {
        let current = identity.borrow_and_update().clone();
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.on_identity(&current);
    }
}

/// Cloneable handle to a live query.
///
/// Handles do not keep the query open; once its [`LiveQuery`] is disposed or dropped,
/// every operation that would touch the remote store fails with [`DataError::Misuse`].
#[derive(Clone)]
pub struct LiveHandle {
    shared: Arc<Shared>,
}

impl LiveHandle {
    /// Tear down and recreate the subscription for the same view.
    pub fn refresh(&self) -> Result<(), DataError> {
        if self.shared.lock("refresh").disposed {
            return Err(DataError::misuse("refresh"));
        }
        self.shared.resubscribe("refresh");
        Ok(())
    }

    /// Switch to a different filter, ordering or page size.
    pub fn set_view(&self, view: ViewSpec) -> Result<(), DataError> {
        {
            let mut inner = self.shared.lock("set_view");
            if inner.disposed {
                return Err(DataError::misuse("set_view"));
            }
            if inner.view == view {
                return Ok(());
            }
            inner.view = view;
        }
        self.shared.resubscribe("view changed");
        Ok(())
    }

    pub fn view(&self) -> ViewSpec {
        self.shared.lock("view").view.clone()
    }

    /// Descriptor of the current subscription, if an owner is active.
    pub fn descriptor(&self) -> Option<QueryDescriptor> {
        self.shared.lock("descriptor").state.descriptor.clone()
    }

    pub fn snapshot(&self) -> Arc<QueryState> {
        self.shared.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<QueryState>> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock("is_disposed").disposed
    }

    /// Register `listener` to run after every state change.
    pub fn on_change(&self, listener: impl Fn(&QueryState) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.listeners, SOURCE, "on_change").push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners, SOURCE, "remove_listener");
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    /// Register `listener` for as long as the returned binding lives.
    pub fn bind(&self, listener: impl Fn(&QueryState) + Send + Sync + 'static) -> ViewBinding {
        let id = self.on_change(listener);
        ViewBinding {
            handle: self.clone(),
            id,
        }
    }

    /// Stop the subscription for good. Safe to call more than once.
    pub fn dispose(&self) {
        let mut inner = self.shared.lock("dispose");
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        inner.teardown();
        if let Some(follower) = inner.follower.take() {
            follower.abort();
        }
        inner.state.items.clear();
        inner.state.loading = false;
        inner.state.has_more = false;
        inner.state.last_cursor = None;
        inner.state.phase = Phase::TornDown;

        info!(
            target = "biztrack::live",
            collection = %inner.view.collection,
            phase = Phase::TornDown.as_str(),
            "Live query disposed"
        );
        self.shared.commit(inner);
    }
}

/// Owning handle of a live query. Dropping it disposes the query.
pub struct LiveQuery {
    handle: LiveHandle,
}

impl LiveQuery {
    /// Open `view` and start following the identity signal.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(ctx: LiveContext, view: ViewSpec) -> Self {
        let identity = ctx.identity.subscribe();
        let (state_tx, _) = watch::channel(Arc::new(QueryState::idle()));
        let shared = Arc::new(Shared {
            ctx,
            inner: Mutex::new(Inner {
                state: QueryState::idle(),
                view,
                owner: None,
                generation: 0,
                subscription: None,
                pump: None,
                follower: None,
                disposed: false,
            }),
            state_tx,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            cache_writes: AsyncMutex::new(()),
        });
        shared.ctx.views.register(&shared);

        let follower = tokio::spawn(follow_identity(Arc::downgrade(&shared), identity));
        shared.lock("open").follower = Some(follower);
        shared.resubscribe("open");

        Self {
            handle: LiveHandle { shared },
        }
    }

    pub fn handle(&self) -> LiveHandle {
        self.handle.clone()
    }
}

impl std::ops::Deref for LiveQuery {
    type Target = LiveHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.handle.dispose();
    }
}

/// Listener registration tied to a scope.
pub struct ViewBinding {
    handle: LiveHandle,
    id: ListenerId,
}

impl ViewBinding {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for ViewBinding {
    fn drop(&mut self) {
        self.handle.remove_listener(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use crate::cache::CacheConfig;
    use crate::notify::ToastQueue;
    use crate::remote::{MemoryRemote, Operator, OrderBy};

    use super::*;

    const PATH: &str = "users/u1/clients";

    struct Fixture {
        remote: MemoryRemote,
        cache: Arc<CacheStore>,
        toasts: Arc<ToastQueue>,
        identity: IdentityHandle,
    }

    impl Fixture {
        fn new(identity: Identity) -> Self {
            Self {
                remote: MemoryRemote::new(),
                cache: Arc::new(CacheStore::memory_only(&CacheConfig::memory_only(16))),
                toasts: Arc::new(ToastQueue::default()),
                identity: IdentityHandle::new(identity),
            }
        }

        fn open(&self, view: ViewSpec) -> LiveQuery {
            LiveQuery::open(
                LiveContext {
                    remote: Arc::new(self.remote.clone()),
                    cache: Arc::clone(&self.cache),
                    notifier: self.toasts.clone(),
                    identity: self.identity.clone(),
                    owner_scope: "users".to_string(),
                    default_page_size: 50,
                    views: LiveRegistry::default(),
                },
                view,
            )
        }
    }

    fn clients() -> ViewSpec {
        ViewSpec::new("clients")
            .filter("status", Operator::Eq, "Active")
            .order_by(OrderBy::asc("clientName"))
            .page_size(2)
    }

    fn client(id: &str, name: &str) -> Record {
        Record::from_json(id, json!({"clientName": name, "status": "Active"}))
    }

    async fn wait_for(
        query: &LiveHandle,
        predicate: impl FnMut(&Arc<QueryState>) -> bool,
    ) -> Arc<QueryState> {
        let mut rx = query.watch();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
            .await
            .expect("state reached in time")
            .expect("live query alive");
        Arc::clone(&state)
    }

    #[tokio::test]
    async fn snapshot_replaces_items_and_writes_cache() {
        let fixture = Fixture::new(Identity::signed_in("u1"));
        fixture
            .remote
            .seed(PATH, [client("a", "Ann"), client("b", "Ben"), client("c", "Cy")]);

        let query = fixture.open(clients());
        let state = wait_for(&query, |s| s.phase == Phase::Streaming).await;
        assert_eq!(state.ids(), ["a", "b"]);
        assert!(state.has_more);
        assert!(!state.loading);

        let key = query.descriptor().expect("descriptor").cache_key();
        let cached = fixture.cache.get(&key).await.expect("first page cached");
        assert_eq!(cached.data, state.items);
        assert!(cached.metadata.is_some());
    }

    #[tokio::test]
    async fn delivery_for_previous_owner_is_not_cached() {
        let fixture = Fixture::new(Identity::signed_in("u1"));
        fixture.remote.seed(PATH, [client("a", "Ann")]);
        let query = fixture.open(clients());
        let state = wait_for(&query, |s| s.phase == Phase::Streaming).await;
        let descriptor = state.descriptor.clone().expect("descriptor");
        let generation = query.shared.lock("test").generation;
        fixture.cache.clear_for_owner("u1").await;

        // The follower has not run yet, so the generation is still current.
        fixture.identity.set(Identity::signed_out());
        query
            .shared
            .apply_snapshot(generation, &descriptor, vec![client("b", "Ben")])
            .await;

        assert!(fixture.cache.get(&descriptor.cache_key()).await.is_none());
        assert_eq!(query.snapshot().ids(), ["a"]);
    }

    #[tokio::test]
    async fn idle_without_identity_and_subscribes_once_ready() {
        let fixture = Fixture::new(Identity::pending());
        fixture.remote.seed(PATH, [client("a", "Ann")]);

        let query = fixture.open(clients());
        assert_eq!(query.snapshot().phase, Phase::Idle);
        assert_eq!(fixture.remote.active_subscriptions(), 0);

        fixture.identity.set(Identity::signed_in("u1"));
        let state = wait_for(&query, |s| s.phase == Phase::Streaming).await;
        assert_eq!(state.ids(), ["a"]);
        assert!(!state.has_more);
    }

    #[tokio::test]
    async fn remote_error_is_surfaced_and_notified() {
        let fixture = Fixture::new(Identity::signed_in("u1"));
        fixture
            .remote
            .fail_next_subscribe(RemoteError::PermissionDenied("rules".to_string()));

        let query = fixture.open(clients());
        let state = wait_for(&query, |s| s.phase == Phase::Error).await;
        assert!(matches!(state.error, Some(DataError::Subscription(_))));

        let toasts = fixture.toasts.pending();
        assert_eq!(toasts.len(), 1);
        assert_eq!(toasts[0].title, LOAD_ERROR_TITLE);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_blocks_further_use() {
        let fixture = Fixture::new(Identity::signed_in("u1"));
        let query = fixture.open(clients());
        let handle = query.handle();
        assert_eq!(fixture.remote.active_subscriptions(), 1);

        handle.dispose();
        handle.dispose();
        assert_eq!(fixture.remote.active_subscriptions(), 0);
        assert_eq!(handle.snapshot().phase, Phase::TornDown);
        assert_eq!(handle.refresh(), Err(DataError::misuse("refresh")));
        assert_eq!(
            handle.set_view(ViewSpec::new("tasks")),
            Err(DataError::misuse("set_view"))
        );
        assert!(matches!(
            handle.load_more().await,
            Err(DataError::Misuse { .. })
        ));
    }

    #[tokio::test]
    async fn bound_listener_stops_on_drop() {
        let fixture = Fixture::new(Identity::signed_in("u1"));
        let query = fixture.open(clients());
        wait_for(&query, |s| s.phase == Phase::Streaming).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let binding = query.bind(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        query.refresh().expect("refresh");
        let after_refresh = calls.load(Ordering::SeqCst);
        assert!(after_refresh >= 1);

        drop(binding);
        query.refresh().expect("refresh");
        assert_eq!(calls.load(Ordering::SeqCst), after_refresh);
    }

    #[tokio::test]
    async fn unchanged_view_keeps_subscription() {
        let fixture = Fixture::new(Identity::signed_in("u1"));
        let query = fixture.open(clients());
        let before = query.descriptor();

        query.set_view(clients()).expect("same view");
        assert_eq!(query.descriptor(), before);

        query
            .set_view(clients().page_size(5))
            .expect("resized view");
        assert_eq!(query.descriptor().map(|d| d.page_size), Some(5));
        assert_eq!(fixture.remote.active_subscriptions(), 1);
    }
}
