//! Index backend abstraction for the result cache.
//!
//! The [`IndexBackend`] trait is the only storage contract the
//! [`ResultCache`](crate::cache::ResultCache) depends on, enabling pluggable
//! backends (in-memory here, SQLite in the application crate).
//!
//! Implementations must be `Send + Sync` and are responsible for their own
//! internal consistency under concurrent calls.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::fingerprint::Fingerprint;
use crate::models::CacheEntry;

/// Error a backend returns when it cannot evaluate the supplied criteria.
///
/// The cache surfaces it as
/// [`FederationError::UnsupportedQuery`](crate::error::FederationError::UnsupportedQuery);
/// any other backend error becomes `CacheUnavailable`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UnsupportedCriteria(pub String);

/// Matches entries whose item carries any of `values` under `name`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeFilter {
    pub name: String,
    pub values: Vec<Value>,
}

/// Criteria for [`IndexBackend::query`]: a conjunction of attribute filters,
/// an optional fingerprint, and an optional result limit.
///
/// A query with no filters and no fingerprint matches every entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheQuery {
    pub filters: Vec<AttributeFilter>,
    pub fingerprint: Option<Fingerprint>,
    pub limit: Option<usize>,
}

impl CacheQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter requiring `name` to equal one of `values`.
    pub fn attribute<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.filters.push(AttributeFilter {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject criteria no backend can evaluate: blank attribute names and
    /// filters without values.
    pub fn validate(&self) -> std::result::Result<(), UnsupportedCriteria> {
        for filter in &self.filters {
            if filter.name.trim().is_empty() {
                return Err(UnsupportedCriteria(
                    "attribute filter has a blank name".to_string(),
                ));
            }
            if filter.values.is_empty() {
                return Err(UnsupportedCriteria(format!(
                    "attribute filter '{}' has no values",
                    filter.name
                )));
            }
        }
        Ok(())
    }

    /// Evaluate the criteria against one entry, ignoring `limit`.
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        if let Some(fp) = &self.fingerprint {
            if &entry.fingerprint != fp {
                return false;
            }
        }
        self.filters
            .iter()
            .all(|f| entry.item.attribute_matches(&f.name, &f.values))
    }
}

/// Entries returned by a cache query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CachedBatch {
    /// Matching entries, newest first, truncated to the query limit.
    pub entries: Vec<CacheEntry>,
    /// Number of matching entries before the limit was applied.
    pub hit_count: u64,
}

/// Abstract index backend holding cache entries.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](IndexBackend::upsert) | Insert or replace the entry with the same fingerprint |
/// | [`delete_where`](IndexBackend::delete_where) | Remove entries carrying any value under an attribute |
/// | [`query`](IndexBackend::query) | Return entries matching a [`CacheQuery`] |
#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn upsert(&self, entry: &CacheEntry) -> Result<()>;

    /// Returns the number of entries removed.
    async fn delete_where(&self, attribute: &str, values: &[Value]) -> Result<usize>;

    async fn query(&self, criteria: &CacheQuery) -> Result<CachedBatch>;
}

/// Sort newest first with the fingerprint as a stable tiebreak, then apply
/// the query limit.
pub fn finish_batch(mut entries: Vec<CacheEntry>, limit: Option<usize>) -> CachedBatch {
    entries.sort_by(|a, b| {
        b.stored_at
            .cmp(&a.stored_at)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    let hit_count = entries.len() as u64;
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    CachedBatch { entries, hit_count }
}
