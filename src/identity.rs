//! Current-owner identity signal.
//!
//! Authentication itself lives elsewhere. The data layer only needs to know who the
//! current owner is and whether that answer is settled yet.

use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub owner_id: Option<String>,
    pub ready: bool,
}

impl Identity {
    pub fn signed_in(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ready: true,
        }
    }

    /// Identity still resolving.
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn signed_out() -> Self {
        Self {
            owner_id: None,
            ready: true,
        }
    }

    /// Owner whose data may be read, once identity has settled.
    pub fn active_owner(&self) -> Option<&str> {
        if self.ready {
            self.owner_id.as_deref()
        } else {
            None
        }
    }
}

/// Publishes identity changes to every live view.
#[derive(Debug, Clone)]
pub struct IdentityHandle {
    tx: watch::Sender<Identity>,
}

impl Default for IdentityHandle {
    fn default() -> Self {
        Self::new(Identity::pending())
    }
}

impl IdentityHandle {
    pub fn new(initial: Identity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish `identity`. Subscribers are woken only when it actually changed.
    pub fn set(&self, identity: Identity) {
        self.tx.send_if_modified(|current| {
            if *current == identity {
                false
            } else {
                *current = identity;
                true
            }
        });
    }

    pub fn current(&self) -> Identity {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Identity> {
        self.tx.subscribe()
    }
}
