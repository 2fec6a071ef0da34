//! Core data models shared by the cache and the federation coordinator.
//!
//! Items are treated as immutable values: every transform consumes the item
//! and returns a new one, so a reader holding `&Item` never observes a
//! concurrent change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::Fingerprint;

/// Pseudo-attribute addressing [`Item::id`] in filters and deletes.
pub const ID_ATTRIBUTE: &str = "id";

/// Pseudo-attribute addressing [`Item::source_id`] in filters and deletes.
pub const SOURCE_ID_ATTRIBUTE: &str = "source-id";

/// A unit of content or metadata retrieved from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Identifier, unique within its source.
    pub id: String,
    /// Identifier of the source that produced the item.
    #[serde(default)]
    pub source_id: String,
    /// Open attribute map.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Item {
    pub fn new(source_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Returns a copy of this item carrying `name = value`.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Returns a copy of this item without the named attribute.
    pub fn without_attribute(mut self, name: &str) -> Self {
        self.attributes.remove(name);
        self
    }

    /// Returns a copy of this item attributed to `source_id`.
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// True when both identity fields are non-blank.
    pub fn has_identity(&self) -> bool {
        !self.id.trim().is_empty() && !self.source_id.trim().is_empty()
    }

    /// True when the item carries any of `values` under `name`.
    ///
    /// [`ID_ATTRIBUTE`] and [`SOURCE_ID_ATTRIBUTE`] address the identity
    /// fields. Array-valued attributes match when any element matches.
    pub fn attribute_matches(&self, name: &str, values: &[Value]) -> bool {
        let identity = match name {
            ID_ATTRIBUTE => Some(&self.id),
            SOURCE_ID_ATTRIBUTE => Some(&self.source_id),
            _ => None,
        };
        if let Some(field) = identity {
            let stored = Value::String(field.clone());
            return values.iter().any(|v| value_matches(&stored, v));
        }

        match self.attributes.get(name) {
            Some(Value::Array(elements)) => elements
                .iter()
                .any(|e| values.iter().any(|v| value_matches(e, v))),
            Some(stored) => values.iter().any(|v| value_matches(stored, v)),
            None => false,
        }
    }
}

/// Compare a stored attribute value with a requested one.
///
/// Values match when equal as JSON, or when their textual renderings are
/// equal, so `"true"` supplied on a command line matches a stored `true`.
pub fn value_matches(stored: &Value, wanted: &Value) -> bool {
    stored == wanted || value_text(stored) == value_text(wanted)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parameters of one retrieval beyond item identity.
///
/// Two retrievals of the same item with different contexts are cached as
/// distinct entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalContext {
    /// Requested rendering or option argument.
    #[serde(default)]
    pub option: Option<String>,
    /// Arbitrary retrieval properties. Insertion order is irrelevant.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl RetrievalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.option = Some(option.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// One batch of results returned by a source for a logical search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultBatch {
    pub items: Vec<Item>,
    /// Total hits the source reports for the query, which may exceed
    /// `items.len()` when the source pages its results.
    pub hit_count: u64,
    pub elapsed_millis: u64,
}

/// A fault reported in place of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFault {
    pub message: String,
    pub elapsed_millis: u64,
}

impl SourceFault {
    pub fn new(message: impl Into<String>, elapsed_millis: u64) -> Self {
        Self {
            message: message.into(),
            elapsed_millis,
        }
    }
}

/// What a source delivered: results or a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceResponse {
    Batch(ResultBatch),
    Fault(SourceFault),
}

impl From<ResultBatch> for SourceResponse {
    fn from(batch: ResultBatch) -> Self {
        SourceResponse::Batch(batch)
    }
}

impl From<SourceFault> for SourceResponse {
    fn from(fault: SourceFault) -> Self {
        SourceResponse::Fault(fault)
    }
}

/// A persisted cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub item: Item,
    pub stored_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transforms_return_new_items() {
        let original = Item::new("s1", "a").with_attribute("title", "Alpha");
        let stripped = original.clone().without_attribute("title");
        assert!(original.attribute("title").is_some());
        assert!(stripped.attribute("title").is_none());
    }

    #[test]
    fn test_has_identity() {
        assert!(Item::new("s1", "a").has_identity());
        assert!(!Item::new("s1", " ").has_identity());
        assert!(!Item::new("", "a").has_identity());
    }

    #[test]
    fn test_attribute_matches_identity_fields() {
        let item = Item::new("s1", "a");
        assert!(item.attribute_matches(ID_ATTRIBUTE, &[json!("a")]));
        assert!(item.attribute_matches(SOURCE_ID_ATTRIBUTE, &[json!("x"), json!("s1")]));
        assert!(!item.attribute_matches(ID_ATTRIBUTE, &[json!("b")]));
    }

    #[test]
    fn test_attribute_matches_arrays_and_text() {
        let item = Item::new("s1", "a")
            .with_attribute("tags", json!(["red", "blue"]))
            .with_attribute("restricted", json!(true));
        assert!(item.attribute_matches("tags", &[json!("blue")]));
        assert!(item.attribute_matches("restricted", &[json!("true")]));
        assert!(!item.attribute_matches("tags", &[json!("green")]));
        assert!(!item.attribute_matches("missing", &[json!("x")]));
    }
}
