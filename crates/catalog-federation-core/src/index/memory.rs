//! In-memory [`IndexBackend`] implementation for tests and embedded use.
//!
//! Entries live in a `HashMap` keyed by fingerprint behind
//! `std::sync::RwLock`. Queries are a linear scan.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::fingerprint::Fingerprint;
use crate::models::CacheEntry;

use super::{finish_batch, CacheQuery, CachedBatch, IndexBackend};

/// In-memory cache index.
pub struct InMemoryIndex {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexBackend for InMemoryIndex {
    async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.insert(entry.fingerprint.clone(), entry.clone());
        Ok(())
    }

    async fn delete_where(&self, attribute: &str, values: &[Value]) -> Result<usize> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| !e.item.attribute_matches(attribute, values));
        Ok(before - entries.len())
    }

    async fn query(&self, criteria: &CacheQuery) -> Result<CachedBatch> {
        criteria.validate()?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let matched: Vec<CacheEntry> = match &criteria.fingerprint {
            Some(fp) => entries
                .get(fp)
                .filter(|e| criteria.matches(e))
                .cloned()
                .into_iter()
                .collect(),
            None => entries
                .values()
                .filter(|e| criteria.matches(e))
                .cloned()
                .collect(),
        };
        Ok(finish_batch(matched, criteria.limit))
    }
}
