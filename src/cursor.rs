//! Opaque page cursors.
//!
//! A cursor remembers the ordering value and id of the last record of a page so the
//! next one-shot fetch can start strictly after it.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::remote::{OrderBy, Record};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("invalid cursor: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CursorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    id: String,
}

/// Position in a remote-ordered result set.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCursor {
    value: Option<Value>,
    id: String,
}

impl PageCursor {
    pub fn new(value: Option<Value>, id: impl Into<String>) -> Self {
        Self {
            value,
            id: id.into(),
        }
    }

    /// Cursor positioned at `record` under the given ordering.
    pub fn after(record: &Record, order_by: Option<&OrderBy>) -> Self {
        let value = order_by.and_then(|order| record.field(&order.field).cloned());
        Self::new(value, record.id.clone())
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encode(&self) -> String {
        let payload = CursorPayload {
            value: self.value.clone(),
            id: self.id.clone(),
        };
        let serialized =
            serde_json::to_vec(&payload).expect("serializing page cursor payload should succeed");
        URL_SAFE_NO_PAD.encode(serialized)
    }

    pub fn decode(cursor: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|err| CursorError::Invalid(err.to_string()))?;
        let payload: CursorPayload =
            serde_json::from_slice(&bytes).map_err(|err| CursorError::Invalid(err.to_string()))?;
        Ok(Self {
            value: payload.value,
            id: payload.id,
        })
    }
}
