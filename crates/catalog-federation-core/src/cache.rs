//! Policy-gated result cache over an [`IndexBackend`].
//!
//! Writes are best-effort: [`ResultCache::put`] and [`ResultCache::delete`]
//! log backend faults and carry on, so caching can sit on a read path
//! without ever failing it. Reads are not: [`ResultCache::query`] surfaces
//! backend faults, because a silently empty answer would be wrong.
//!
//! The cache holds no state of its own beyond the backend handle and the
//! policy chain, and shares no lock with the federation coordinator.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FederationError, Result};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::index::{CacheQuery, CachedBatch, IndexBackend, UnsupportedCriteria};
use crate::models::{CacheEntry, Item, RetrievalContext};
use crate::policy::CachePolicyChain;

/// Outcome counts of one [`ResultCache::put`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PutSummary {
    /// Entries upserted into the backend.
    pub stored: usize,
    /// Items the policy chain declined to cache.
    pub vetoed: usize,
    /// Items dropped for lacking an id or source id.
    pub skipped: usize,
    /// Items whose upsert failed in the backend.
    pub failed: usize,
}

impl std::ops::AddAssign for PutSummary {
    fn add_assign(&mut self, other: Self) {
        self.stored += other.stored;
        self.vetoed += other.vetoed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Deduplicating cache of retrieved items keyed by [`Fingerprint`].
#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn IndexBackend>,
    policy: CachePolicyChain,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn IndexBackend>, policy: CachePolicyChain) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &CachePolicyChain {
        &self.policy
    }

    /// Cache `items` retrieved under `context`.
    ///
    /// Each item passes through the policy chain; survivors are upserted
    /// under `fingerprint(item, context)`, replacing any earlier entry with
    /// the same key. Never fails: invalid items are skipped and backend
    /// faults are logged.
    pub async fn put(&self, items: Vec<Item>, context: Option<&RetrievalContext>) -> PutSummary {
        let mut summary = PutSummary::default();

        for item in items {
            if !item.has_identity() {
                debug!(item_id = %item.id, "skipping cache put for item without identity");
                summary.skipped += 1;
                continue;
            }

            let item = match self.policy.apply(item).await {
                Some(item) => item,
                None => {
                    summary.vetoed += 1;
                    continue;
                }
            };

            // A stage may have rewritten identity fields.
            let key = match fingerprint(&item, context) {
                Ok(key) => key,
                Err(e) => {
                    debug!(error = %e, "skipping cache put after policy transform");
                    summary.skipped += 1;
                    continue;
                }
            };

            let entry = CacheEntry {
                fingerprint: key,
                item,
                stored_at: Utc::now(),
            };

            match self.backend.upsert(&entry).await {
                Ok(()) => summary.stored += 1,
                Err(e) => {
                    warn!(
                        fingerprint = %entry.fingerprint,
                        source_id = %entry.item.source_id,
                        item_id = %entry.item.id,
                        error = %e,
                        "cache upsert failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        debug!(
            stored = summary.stored,
            vetoed = summary.vetoed,
            skipped = summary.skipped,
            failed = summary.failed,
            "cache put finished"
        );
        summary
    }

    /// Query cached entries.
    ///
    /// # Errors
    ///
    /// [`FederationError::UnsupportedQuery`] when the backend cannot evaluate
    /// `criteria`; [`FederationError::CacheUnavailable`] for any other
    /// backend fault.
    pub async fn query(&self, criteria: &CacheQuery) -> Result<CachedBatch> {
        self.backend.query(criteria).await.map_err(|e| {
            if let Some(unsupported) = e.downcast_ref::<UnsupportedCriteria>() {
                FederationError::UnsupportedQuery(unsupported.0.clone())
            } else {
                FederationError::CacheUnavailable(format!("{:#}", e))
            }
        })
    }

    /// True when an entry with `fingerprint` is cached.
    pub async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let batch = self
            .query(&CacheQuery::new().fingerprint(fingerprint.clone()).limit(1))
            .await?;
        Ok(!batch.entries.is_empty())
    }

    /// Remove every entry whose item carries any of `values` under
    /// `attribute_name`, returning how many were removed.
    ///
    /// A blank attribute name or an empty value list is a no-op. Backend
    /// faults are logged and reported as zero removals.
    pub async fn delete(&self, attribute_name: &str, values: &[Value]) -> usize {
        if attribute_name.trim().is_empty() || values.is_empty() {
            debug!(attribute = attribute_name, "ignoring cache delete without criteria");
            return 0;
        }

        match self.backend.delete_where(attribute_name, values).await {
            Ok(removed) => {
                debug!(attribute = attribute_name, removed, "cache delete finished");
                removed
            }
            Err(e) => {
                warn!(attribute = attribute_name, error = %e, "cache delete failed");
                0
            }
        }
    }
}
