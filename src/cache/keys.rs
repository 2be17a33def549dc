//! Cache key definitions.
//!
//! A [`QueryKey`] identifies the cached first page of a live view. Keys are derived from
//! the canonical JSON form of the query parameters, so two logically equal queries map
//! to the same key whatever order their parameters were assembled in.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::remote::{OrderBy, Predicate, RemoteQuery};

/// Cache key in `{owner}:{collection}:{canonical-params}` form.
///
/// `%` and `:` in the owner segment are percent-encoded, so the owner always ends at
/// the first `:` of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(String);

impl QueryKey {
    /// Build a key from a collection, an owner and arbitrary JSON parameters.
    pub fn generate(collection: &str, owner_id: &str, params: &Value) -> Self {
        Self(format!(
            "{}:{collection}:{}",
            escape_owner(owner_id),
            canonical_json(params)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owner the key was generated for.
    pub fn owner_id(&self) -> Cow<'_, str> {
        unescape_owner(self.0.split(':').next().unwrap_or_default())
    }
}

fn escape_owner(owner_id: &str) -> Cow<'_, str> {
    if !owner_id.contains(['%', ':']) {
        return Cow::Borrowed(owner_id);
    }
    Cow::Owned(owner_id.replace('%', "%25").replace(':', "%3A"))
}

fn unescape_owner(segment: &str) -> Cow<'_, str> {
    if !segment.contains('%') {
        return Cow::Borrowed(segment);
    }
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let tail = &rest[at..];
        if let Some(next) = tail.strip_prefix("%3A") {
            out.push(':');
            rest = next;
        } else if let Some(next) = tail.strip_prefix("%25") {
            out.push('%');
            rest = next;
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

impl From<String> for QueryKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything that determines the remote view and its cache slot.
///
/// Equality is defined over the canonical serialized form.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    pub owner_scope: String,
    pub owner_id: String,
    pub collection: String,
    pub predicates: Vec<Predicate>,
    pub order_by: Option<OrderBy>,
    pub page_size: usize,
}

impl QueryDescriptor {
    pub fn collection_path(&self) -> String {
        format!("{}/{}/{}", self.owner_scope, self.owner_id, self.collection)
    }

    /// Parameters of the cached slot. Only the first page is ever cached, so no
    /// cursor or page number takes part in the key.
    pub fn params(&self) -> Value {
        json!({
            "constraints": self.predicates,
            "orderBy": self.order_by,
            "pageSize": self.page_size,
            "page": "first",
        })
    }

    pub fn cache_key(&self) -> QueryKey {
        QueryKey::generate(&self.collection, &self.owner_id, &self.params())
    }

    /// Identity of the filtered set, ignoring ordering and page size.
    pub fn filter_key(&self) -> String {
        canonical_json(&json!({
            "path": self.collection_path(),
            "constraints": self.predicates,
        }))
    }

    pub fn remote_query(&self) -> RemoteQuery {
        RemoteQuery {
            collection_path: self.collection_path(),
            predicates: self.predicates.clone(),
            order_by: self.order_by.clone(),
            limit: self.page_size,
        }
    }

    pub fn canonical(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        canonical_json(&value)
    }
}

impl PartialEq for QueryDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for QueryDescriptor {}

/// Serialize `value` as compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
