//! Document model for mirrored collections.
//!
//! A [`Document`] is an opaque JSON object owned by exactly one collection.
//! The mirror only relies on two fields:
//!
//! - **`_id`**: identity, used as the storage key. Strings are used as-is,
//!   integers are rendered in decimal, so `1` and `"1"` are the same id.
//! - **`_version`**: optional monotonically increasing revision used to drop
//!   stale pushes.
//!
//! Documents are always replaced or removed whole, never patched in place.
//!
//! ```rust
//! use virtool_mirror_core::document::Document;
//! use serde_json::json;
//!
//! let sample = Document::from_value(json!({
//!     "_id": "sample_1",
//!     "_version": 3,
//!     "name": "Sample 1",
//!     "group": "technicians"
//! }))?;
//!
//! assert_eq!(sample.id().as_deref(), Some("sample_1"));
//! assert_eq!(sample.version(), Some(3));
//! # Ok::<(), virtool_mirror_core::app_response::AppResponse>(())
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::app_response::AppResponse;

pub const ID_FIELD: &str = "_id";
pub const VERSION_FIELD: &str = "_version";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct Document(Map<String, JsonValue>);

impl Document {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }

    /// Wraps a JSON value, rejecting anything that is not an object.
    pub fn from_value(value: JsonValue) -> Result<Self, AppResponse> {
        match value {
            JsonValue::Object(fields) => Ok(Self(fields)),
            other => Err(AppResponse::ValidationError(format!(
                "Document must be a JSON object, got: {other}"
            ))),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, AppResponse> {
        let value: JsonValue = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, AppResponse> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    /// The storage key for this document, if it carries a usable `_id`.
    pub fn id(&self) -> Option<String> {
        self.0.get(ID_FIELD).and_then(key_string)
    }

    /// Same as [`Document::id`] but a missing identity is an error.
    pub fn require_id(&self) -> Result<String, AppResponse> {
        self.id().ok_or_else(|| {
            AppResponse::ValidationError(format!("Document has no usable {ID_FIELD} field"))
        })
    }

    pub fn version(&self) -> Option<u64> {
        self.0.get(VERSION_FIELD).and_then(JsonValue::as_u64)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

/// Renders a scalar JSON value as an identity or storage key.
///
/// Strings are taken verbatim and integers in decimal; every other value
/// (null, floats, objects, arrays, booleans) has no key.
///
/// Identities share one key space regardless of JSON type: `_id: 1` and
/// `_id: "1"` name the same document, and the later write replaces the
/// earlier one. A numeric id is looked up by its decimal form.
pub fn key_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

/// Renders any JSON value as an index key. The JSON encoding is used so
/// `"1"` and `1` stay distinct; `null` is left unindexed.
pub fn index_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}
