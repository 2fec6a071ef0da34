//! Cache-key derivation.
//!
//! A [`Fingerprint`] is the SHA-256 of a canonical, type-tagged encoding of
//! an item's identity (`source_id`, `id`) and, when supplied, its
//! [`RetrievalContext`]. Every field is written as `tag ‖ u64 length ‖
//! bytes`, so no two distinct field sequences share an encoding. Context
//! properties live in a sorted map and nested JSON objects are re-sorted
//! while encoding, so insertion order never reaches the hash. An empty
//! context yields the identity-only key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{FederationError, Result};
use crate::models::{Item, RetrievalContext};

const TAG_SOURCE_ID: u8 = b'S';
const TAG_ID: u8 = b'I';
const TAG_OPTION: u8 = b'O';
const TAG_PROPERTY: u8 = b'P';

const TAG_NULL: u8 = b'n';
const TAG_BOOL: u8 = b'b';
const TAG_NUMBER: u8 = b'd';
const TAG_STRING: u8 = b's';
const TAG_ARRAY: u8 = b'a';
const TAG_OBJECT: u8 = b'o';

/// Deterministic cache key for an item under a retrieval context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-derived fingerprint string (e.g. one read back from a
    /// backend or supplied on a command line).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the fingerprint of `item` under an optional `context`.
///
/// # Errors
///
/// Returns [`FederationError::InvalidArgument`] when the item id is blank.
pub fn fingerprint(item: &Item, context: Option<&RetrievalContext>) -> Result<Fingerprint> {
    if item.id.trim().is_empty() {
        return Err(FederationError::InvalidArgument(
            "cannot fingerprint an item with an empty id".to_string(),
        ));
    }

    let mut hasher = Sha256::new();
    write_field(&mut hasher, TAG_SOURCE_ID, item.source_id.as_bytes());
    write_field(&mut hasher, TAG_ID, item.id.as_bytes());

    if let Some(ctx) = context {
        if let Some(option) = &ctx.option {
            write_field(&mut hasher, TAG_OPTION, option.as_bytes());
        }
        for (name, value) in &ctx.properties {
            write_field(&mut hasher, TAG_PROPERTY, name.as_bytes());
            write_value(&mut hasher, value);
        }
    }

    Ok(Fingerprint(format!("{:x}", hasher.finalize())))
}

/// Like [`fingerprint`], but accepts an absent item.
///
/// # Errors
///
/// Returns [`FederationError::InvalidArgument`] when `item` is `None` or its
/// id is blank.
pub fn fingerprint_opt(
    item: Option<&Item>,
    context: Option<&RetrievalContext>,
) -> Result<Fingerprint> {
    match item {
        Some(item) => fingerprint(item, context),
        None => Err(FederationError::InvalidArgument(
            "cannot fingerprint an absent item".to_string(),
        )),
    }
}

fn write_field(hasher: &mut Sha256, tag: u8, bytes: &[u8]) {
    hasher.update([tag]);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn write_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => write_field(hasher, TAG_NULL, &[]),
        Value::Bool(b) => write_field(hasher, TAG_BOOL, &[u8::from(*b)]),
        Value::Number(n) => write_field(hasher, TAG_NUMBER, n.to_string().as_bytes()),
        Value::String(s) => write_field(hasher, TAG_STRING, s.as_bytes()),
        Value::Array(elements) => {
            write_field(hasher, TAG_ARRAY, &(elements.len() as u64).to_le_bytes());
            for element in elements {
                write_value(hasher, element);
            }
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            write_field(hasher, TAG_OBJECT, &(keys.len() as u64).to_le_bytes());
            for key in keys {
                write_field(hasher, TAG_STRING, key.as_bytes());
                write_value(hasher, &map[key.as_str()]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(source: &str, id: &str) -> Item {
        Item::new(source, id)
    }

    #[test]
    fn test_repeated_calls_are_identical() {
        let ctx = RetrievalContext::new()
            .with_option("pdf")
            .with_property("lang", "en");
        let a = fingerprint(&item("s1", "x"), Some(&ctx)).unwrap();
        let b = fingerprint(&item("s1", "x"), Some(&ctx)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_property_insertion_order_is_irrelevant() {
        let forward = RetrievalContext::new()
            .with_property("a", 1)
            .with_property("b", json!({"y": 2, "x": 1}));
        let reverse = RetrievalContext::new()
            .with_property("b", json!({"x": 1, "y": 2}))
            .with_property("a", 1);
        assert_eq!(
            fingerprint(&item("s1", "x"), Some(&forward)).unwrap(),
            fingerprint(&item("s1", "x"), Some(&reverse)).unwrap()
        );
    }

    #[test]
    fn test_source_id_discriminates() {
        assert_ne!(
            fingerprint(&item("s1", "x"), None).unwrap(),
            fingerprint(&item("s2", "x"), None).unwrap()
        );
    }

    #[test]
    fn test_item_id_discriminates() {
        assert_ne!(
            fingerprint(&item("s1", "x"), None).unwrap(),
            fingerprint(&item("s1", "y"), None).unwrap()
        );
    }

    #[test]
    fn test_property_value_discriminates() {
        let pdf = RetrievalContext::new().with_property("format", "pdf");
        let html = RetrievalContext::new().with_property("format", "html");
        assert_ne!(
            fingerprint(&item("s1", "x"), Some(&pdf)).unwrap(),
            fingerprint(&item("s1", "x"), Some(&html)).unwrap()
        );
    }

    #[test]
    fn test_option_discriminates() {
        let pdf = RetrievalContext::new().with_option("pdf");
        let html = RetrievalContext::new().with_option("html");
        assert_ne!(
            fingerprint(&item("s1", "x"), Some(&pdf)).unwrap(),
            fingerprint(&item("s1", "x"), Some(&html)).unwrap()
        );
    }

    #[test]
    fn test_value_types_are_tagged() {
        let text = RetrievalContext::new().with_property("n", "1");
        let number = RetrievalContext::new().with_property("n", 1);
        assert_ne!(
            fingerprint(&item("s1", "x"), Some(&text)).unwrap(),
            fingerprint(&item("s1", "x"), Some(&number)).unwrap()
        );
    }

    #[test]
    fn test_field_boundaries_do_not_collide() {
        assert_ne!(
            fingerprint(&item("ab", "c"), None).unwrap(),
            fingerprint(&item("a", "bc"), None).unwrap()
        );
    }

    #[test]
    fn test_empty_context_matches_identity_only() {
        let empty = RetrievalContext::new();
        assert_eq!(
            fingerprint(&item("s1", "x"), None).unwrap(),
            fingerprint(&item("s1", "x"), Some(&empty)).unwrap()
        );
    }

    #[test]
    fn test_empty_id_is_invalid() {
        let err = fingerprint(&item("s1", ""), None).unwrap_err();
        assert!(matches!(err, FederationError::InvalidArgument(_)));
    }

    #[test]
    fn test_absent_item_is_invalid() {
        let err = fingerprint_opt(None, None).unwrap_err();
        assert!(matches!(err, FederationError::InvalidArgument(_)));
    }
}
