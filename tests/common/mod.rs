#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use biztrack::DataLayer;
use biztrack::cache::{CacheConfig, CacheStore};
use biztrack::identity::{Identity, IdentityHandle};
use biztrack::live::{LiveHandle, QueryState, ViewSpec};
use biztrack::notify::ToastQueue;
use biztrack::remote::{MemoryRemote, Operator, OrderBy, Record};
use serde_json::json;

pub const OWNER: &str = "u1";
pub const CLIENTS: &str = "users/u1/clients";

pub struct Harness {
    pub remote: MemoryRemote,
    pub cache: Arc<CacheStore>,
    pub toasts: Arc<ToastQueue>,
    pub identity: IdentityHandle,
    pub layer: DataLayer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_cache(CacheStore::memory_only(&CacheConfig::memory_only(64)))
    }

    pub fn with_cache(cache: CacheStore) -> Self {
        let remote = MemoryRemote::new();
        let cache = Arc::new(cache);
        let toasts = Arc::new(ToastQueue::default());
        let identity = IdentityHandle::new(Identity::signed_in(OWNER));
        let layer = DataLayer::new(
            Arc::new(remote.clone()),
            Arc::clone(&cache),
            toasts.clone(),
            identity.clone(),
        );
        Self {
            remote,
            cache,
            toasts,
            identity,
            layer,
        }
    }
}

pub fn active_clients(page_size: usize) -> ViewSpec {
    ViewSpec::new("clients")
        .filter("status", Operator::Eq, "Active")
        .order_by(OrderBy::asc("clientName"))
        .page_size(page_size)
}

pub fn client(id: &str, name: &str) -> Record {
    Record::from_json(id, json!({"clientName": name, "status": "Active"}))
}

pub async fn wait_for(
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
