use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheConfig, CacheStore, Cleared};
use crate::config::Settings;
use crate::count::CountEstimator;
use crate::identity::{Identity, IdentityHandle};
use crate::live::{LiveContext, LiveHandle, LiveQuery, LiveRegistry, ViewSpec};
use crate::mutator::{EntityLabels, OptimisticMutator};
use crate::notify::Notifier;
use crate::remote::RemoteStore;

/// Entry point wiring the remote store, cache, notifier and identity together.
#[derive(Clone)]
pub struct DataLayer {
    ctx: LiveContext,
}

impl DataLayer {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<CacheStore>,
        notifier: Arc<dyn Notifier>,
        identity: IdentityHandle,
    ) -> Self {
        Self {
            ctx: LiveContext {
                remote,
                cache,
                notifier,
                identity,
                owner_scope: "users".to_string(),
                default_page_size: 50,
                views: LiveRegistry::default(),
            },
        }
    }

    /// Build a layer from validated settings, opening the cache tiers.
    pub async fn from_settings(
        settings: &Settings,
        remote: Arc<dyn RemoteStore>,
        notifier: Arc<dyn Notifier>,
        identity: IdentityHandle,
    ) -> Self {
        let cache = CacheStore::open(&CacheConfig::from(&settings.cache)).await;
        Self::new(remote, Arc::new(cache), notifier, identity)
            .with_owner_scope(settings.query.owner_scope.clone())
            .with_default_page_size(settings.query.default_page_size.get())
    }

    pub fn with_owner_scope(mut self, owner_scope: impl Into<String>) -> Self {
        self.ctx.owner_scope = owner_scope.into();
        self
    }

    pub fn with_default_page_size(mut self, page_size: usize) -> Self {
        self.ctx.default_page_size = page_size.max(1);
        self
    }

    /// Open a live view. Must be called from within a tokio runtime.
    pub fn open(&self, view: ViewSpec) -> LiveQuery {
        LiveQuery::open(self.ctx.clone(), view)
    }

    pub fn mutator(&self, live: LiveHandle, labels: EntityLabels) -> OptimisticMutator {
        OptimisticMutator::new(
            live,
            Arc::clone(&self.ctx.remote),
            Arc::clone(&self.ctx.cache),
            Arc::clone(&self.ctx.notifier),
        )
        .with_labels(labels)
    }

    pub fn counter(&self) -> CountEstimator {
        CountEstimator::new(Arc::clone(&self.ctx.remote))
    }

    pub fn identity(&self) -> &IdentityHandle {
        &self.ctx.identity
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.ctx.cache
    }

    pub fn sign_in(&self, owner_id: impl Into<String>) {
        self.ctx.identity.set(Identity::signed_in(owner_id));
    }

    /// Publish the signed-out identity, tear down every open view, then drop the
    /// outgoing owner's cached pages.
    ///
    /// Views are torn down before the clear so no delivery already in flight for the
    /// outgoing owner can write its page back afterwards.
    pub async fn sign_out(&self) -> Cleared {
        let previous = self.ctx.identity.current().owner_id;
        let signed_out = Identity::signed_out();
        self.ctx.identity.set(signed_out.clone());
        self.ctx.views.apply_identity(&signed_out).await;

        let Some(owner_id) = previous else {
            return Cleared::default();
        };
        let cleared = self.ctx.cache.clear_for_owner(&owner_id).await;
        info!(
            target = "biztrack::layer",
            owner_id = %owner_id,
            memory = cleared.memory,
            persistent = cleared.persistent,
            "Signed out"
        );
        cleared
    }
}
