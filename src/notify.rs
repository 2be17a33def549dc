//! User-facing notifications.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::lock::lock;

const SOURCE: &str = "notify";
const DEFAULT_TOAST_CAPACITY: usize = 32;

/// Sink for error and success messages. Fire-and-forget.
pub trait Notifier: Send + Sync {
    fn error(&self, title: &str, detail: &str);

    fn success(&self, title: &str, detail: &str);
}

/// Routes notifications into the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn error(&self, title: &str, detail: &str) {
        warn!(target = "biztrack::notify", title, detail, "Notification");
    }

    fn success(&self, title: &str, detail: &str) {
        info!(target = "biztrack::notify", title, detail, "Notification");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub detail: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Bounded in-memory queue of pending toasts. The oldest toast is dropped when full.
#[derive(Debug)]
pub struct ToastQueue {
    capacity: usize,
    pending: Mutex<VecDeque<Notification>>,
}

impl Default for ToastQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TOAST_CAPACITY)
    }
}

impl ToastQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn push(&self, kind: NotificationKind, title: &str, detail: &str) {
        let mut pending = lock(&self.pending, SOURCE, "push");
        if pending.len() == self.capacity {
            pending.pop_front();
        }
        pending.push_back(Notification {
            id: Uuid::new_v4(),
            kind,
            title: title.to_string(),
            detail: detail.to_string(),
            created_at: OffsetDateTime::now_utc(),
        });
    }

    /// Pending toasts, oldest first, without removing them.
    pub fn pending(&self) -> Vec<Notification> {
        lock(&self.pending, SOURCE, "pending")
            .iter()
            .cloned()
            .collect()
    }

    pub fn drain(&self) -> Vec<Notification> {
        lock(&self.pending, SOURCE, "drain").drain(..).collect()
    }

    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut pending = lock(&self.pending, SOURCE, "dismiss");
        let before = pending.len();
        pending.retain(|toast| toast.id != id);
        pending.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.pending, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Notifier for ToastQueue {
    fn error(&self, title: &str, detail: &str) {
        self.push(NotificationKind::Error, title, detail);
    }

    fn success(&self, title: &str, detail: &str) {
        self.push(NotificationKind::Success, title, detail);
    }
}
