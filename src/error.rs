use std::fmt;

use thiserror::Error;

use crate::remote::RemoteError;

/// Which optimistic or bulk write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Add,
    Update,
    Delete,
    BulkAdd,
    BulkUpdate,
    BulkDelete,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::BulkAdd => "bulk_add",
            Self::BulkUpdate => "bulk_update",
            Self::BulkDelete => "bulk_delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the data-access layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    /// Live subscription failure. Lands in query state and the notifier.
    #[error("live subscription failed: {0}")]
    Subscription(#[source] RemoteError),
    /// One-shot read failure (`load_more`, counts).
    #[error("fetch failed: {0}")]
    Fetch(#[source] RemoteError),
    #[error("{operation} of `{id}` failed: {source}")]
    Mutation {
        operation: MutationKind,
        id: String,
        #[source]
        source: RemoteError,
    },
    /// An operation was invoked where it cannot be served.
    #[error("{operation} is not available: {reason}")]
    Misuse {
        operation: &'static str,
        reason: &'static str,
    },
}

impl DataError {
    pub fn mutation(operation: MutationKind, id: impl Into<String>, source: RemoteError) -> Self {
        Self::Mutation {
            operation,
            id: id.into(),
            source,
        }
    }

    /// `operation` was called on a disposed live query.
    pub fn misuse(operation: &'static str) -> Self {
        Self::Misuse {
            operation,
            reason: "live query disposed",
        }
    }

    /// `operation` needs an owner but identity has none yet.
    pub fn no_owner(operation: &'static str) -> Self {
        Self::Misuse {
            operation,
            reason: "no active owner",
        }
    }

    /// The remote failure behind this error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Subscription(err) | Self::Fetch(err) => Some(err),
            Self::Mutation { source, .. } => Some(source),
            Self::Misuse { .. } => None,
        }
    }
}
