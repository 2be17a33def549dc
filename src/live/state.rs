use serde_json::Value;

use crate::cache::QueryDescriptor;
use crate::cursor::PageCursor;
use crate::error::DataError;
use crate::remote::{Operator, OrderBy, Predicate, Record};

/// Lifecycle of a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No owner yet, so nothing is subscribed.
    Idle,
    Subscribing,
    Streaming,
    Error,
    TornDown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Error => "error",
            Self::TornDown => "torn_down",
        }
    }
}

/// Read snapshot of a live query, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub descriptor: Option<QueryDescriptor>,
    /// Unique by id, in server order.
    pub items: Vec<Record>,
    /// Waiting for the first delivery of the subscription.
    pub loading: bool,
    /// A [`LiveHandle::load_more`](super::LiveHandle::load_more) page is in flight.
    pub loading_more: bool,
    pub error: Option<DataError>,
    pub has_more: bool,
    pub last_cursor: Option<PageCursor>,
    pub phase: Phase,
}

impl QueryState {
    pub(crate) fn idle() -> Self {
        Self {
            descriptor: None,
            items: Vec::new(),
            loading: false,
            loading_more: false,
            error: None,
            has_more: false,
            last_cursor: None,
            phase: Phase::Idle,
        }
    }

    pub(crate) fn subscribing(descriptor: QueryDescriptor) -> Self {
        Self {
            descriptor: Some(descriptor),
            loading: true,
            phase: Phase::Subscribing,
            ..Self::idle()
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|record| record.id.as_str()).collect()
    }
}

/// Caller-facing description of a view, before it is bound to an owner.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSpec {
    pub collection: String,
    pub predicates: Vec<Predicate>,
    pub order_by: Option<OrderBy>,
    /// Falls back to `query.default_page_size` when unset.
    pub page_size: Option<usize>,
}

impl ViewSpec {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            predicates: Vec::new(),
            order_by: None,
            page_size: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::new(field, op, value));
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn descriptor(
        &self,
        owner_scope: &str,
        owner_id: &str,
        default_page_size: usize,
    ) -> QueryDescriptor {
        QueryDescriptor {
            owner_scope: owner_scope.to_string(),
            owner_id: owner_id.to_string(),
            collection: self.collection.clone(),
            predicates: self.predicates.clone(),
            order_by: self.order_by.clone(),
            page_size: self.page_size.unwrap_or(default_page_size).max(1),
        }
    }
}
