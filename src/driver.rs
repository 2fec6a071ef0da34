//! Async fan-out driver for federated searches.
//!
//! ```text
//! run(query)
//!   ├─ start_search ──▶ LogicalSearch (Arc, owned by run)
//!   ├─ spawn per source ──▶ SourceClient::query ──▶ on_source_response
//!   │                                             └─▶ spawn cache.put(new_items)
//!   └─ timeout(deadline) ──▶ fail_pending("deadline exceeded") ──▶ snapshot
//! ```
//!
//! Source tasks hold only a `Weak` handle to the search. Once `run` returns
//! and drops its `Arc`, a source that answers late finds nothing to deliver
//! to. Cache writes are spawned separately and never delay delivery.
//! Each write folds its [`PutSummary`] into a running total when it
//! completes, so finished handles are reaped on the next spawn and the
//! handle list only holds writes still in flight.
//! [`FederatedSearchDriver::flush_cache_writes`] awaits those and drains
//! the total.

use anyhow::{bail, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use catalog_federation_core::cache::{PutSummary, ResultCache};
use catalog_federation_core::federation::{
    CompositeResult, FederationCoordinator, LogicalSearch, ResponseOutcome,
};
use catalog_federation_core::models::{RetrievalContext, SourceFault, SourceResponse};

use crate::cache_cmd::open_cache;
use crate::config::Config;
use crate::sources::{SourceClient, SourceRegistry};

/// Reason recorded against sources still pending when the deadline passes.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Runs federated searches over a [`SourceRegistry`], feeding merged items
/// into an optional [`ResultCache`].
pub struct FederatedSearchDriver {
    coordinator: Arc<FederationCoordinator>,
    registry: SourceRegistry,
    cache: Option<ResultCache>,
    context: Option<RetrievalContext>,
    deadline: Duration,
    cache_writes: Arc<Mutex<CacheWrites>>,
}

/// Write-behind bookkeeping: in-flight put tasks and the summary of every
/// put completed since the last flush.
#[derive(Default)]
struct CacheWrites {
    in_flight: Vec<JoinHandle<()>>,
    completed: PutSummary,
}

fn lock_writes(writes: &Mutex<CacheWrites>) -> MutexGuard<'_, CacheWrites> {
    writes.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FederatedSearchDriver {
    pub fn new(registry: SourceRegistry, cache: Option<ResultCache>, deadline: Duration) -> Self {
        Self {
            coordinator: Arc::new(FederationCoordinator::new()),
            registry,
            cache,
            context: None,
            deadline,
            cache_writes: Arc::new(Mutex::new(CacheWrites::default())),
        }
    }

    /// Build a driver from config: every `[[sources]]` entry, the configured
    /// cache backend and policy chain, and `federation.deadline_ms`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = SourceRegistry::from_config(config);
        let cache = open_cache(config).await?;
        Ok(Self::new(
            registry,
            cache,
            Duration::from_millis(config.federation.deadline_ms),
        ))
    }

    /// Cache merged items under `context` instead of the identity-only key.
    pub fn with_context(mut self, context: RetrievalContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn coordinator(&self) -> &FederationCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn cache(&self) -> Option<&ResultCache> {
        self.cache.as_ref()
    }

    /// Search `source_ids` (every registered source when empty) and return
    /// the composite result once all sources answered or the deadline
    /// passed, whichever comes first.
    ///
    /// # Errors
    ///
    /// Fails when a requested source is not registered or when no source is
    /// available. Individual source failures are reported in the result.
    pub async fn run(&self, query: &str, source_ids: &[String]) -> Result<CompositeResult> {
        let ids = if source_ids.is_empty() {
            self.registry.ids()
        } else {
            source_ids.to_vec()
        };
        if ids.is_empty() {
            bail!("No sources configured. Add a [[sources]] entry to the config.");
        }

        let mut sources = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.registry.find(id) {
                Some(source) => sources.push(source),
                None => bail!("Unknown source: '{}'", id),
            }
        }

        let search = self.coordinator.start_search(query, ids)?;
        info!(search_id = %search.id(), query, sources = sources.len(), "federated search started");

        let handles: Vec<JoinHandle<()>> = sources
            .into_iter()
            .map(|source| self.spawn_source(source, Arc::downgrade(&search)))
            .collect();

        let search_id = search.id();
        let all_answered = async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(search_id = %search_id, error = %e, "source task aborted");
                }
            }
        };

        if tokio::time::timeout(self.deadline, all_answered).await.is_err() {
            let failed = self.coordinator.fail_pending(&search, DEADLINE_EXCEEDED)?;
            warn!(
                search_id = %search.id(),
                failed,
                deadline_ms = self.deadline.as_millis() as u64,
                "deadline exceeded"
            );
        } else if !search.is_finished() {
            // Only reachable when a source task panicked before delivering.
            self.coordinator.fail_pending(&search, "source task aborted")?;
        }

        Ok(self.coordinator.snapshot(&search))
    }

    /// Await every cache write still in flight and return the combined
    /// summary of all writes since the previous flush.
    pub async fn flush_cache_writes(&self) -> PutSummary {
        let pending = std::mem::take(&mut lock_writes(&self.cache_writes).in_flight);

        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "cache write task aborted");
            }
        }
        std::mem::take(&mut lock_writes(&self.cache_writes).completed)
    }

    /// Number of spawned cache writes not yet reaped.
    pub fn pending_cache_writes(&self) -> usize {
        lock_writes(&self.cache_writes).in_flight.len()
    }

    fn spawn_source(&self, source: Arc<dyn SourceClient>, search: Weak<LogicalSearch>) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let cache = self.cache.clone();
        let context = self.context.clone();
        let cache_writes = self.cache_writes.clone();

        tokio::spawn(async move {
            let source_id = source.id().to_string();
            let query = match search.upgrade() {
                Some(search) => search.query().to_string(),
                None => return,
            };

            let started = Instant::now();
            let response = match source.query(&query).await {
                Ok(batch) => SourceResponse::Batch(batch),
                Err(e) => SourceResponse::Fault(SourceFault::new(
                    format!("{:#}", e),
                    started.elapsed().as_millis() as u64,
                )),
            };

            let Some(search) = search.upgrade() else {
                debug!(source_id = %source_id, "dropping response for abandoned search");
                return;
            };

            let outcome = match coordinator.on_source_response(&search, &source_id, response) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(search_id = %search.id(), source_id = %source_id, error = %e, "response rejected");
                    return;
                }
            };

            if let (ResponseOutcome::Merged { new_items }, Some(cache)) = (outcome, cache) {
                if new_items.is_empty() {
                    return;
                }
                let completed = cache_writes.clone();
                let handle = tokio::spawn(async move {
                    let summary = cache.put(new_items, context.as_ref()).await;
                    lock_writes(&completed).completed += summary;
                });
                let mut writes = lock_writes(&cache_writes);
                writes.in_flight.retain(|h| !h.is_finished());
                writes.in_flight.push(handle);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use catalog_federation_core::index::memory::InMemoryIndex;
    use catalog_federation_core::index::CacheQuery;
    use catalog_federation_core::models::{Item, ResultBatch};
    use catalog_federation_core::policy::CachePolicyChain;
    use catalog_federation_core::tracker::TrackerState;

    struct StaticSource {
        id: &'static str,
        ids: Vec<&'static str>,
        delay: Duration,
    }

    #[async_trait]
    impl SourceClient for StaticSource {
        fn id(&self) -> &str {
            self.id
        }
        fn description(&self) -> &str {
            "static"
        }
        async fn query(&self, _query: &str) -> Result<ResultBatch> {
            tokio::time::sleep(self.delay).await;
            Ok(ResultBatch {
                items: self.ids.iter().map(|id| Item::new(self.id, *id)).collect(),
                hit_count: self.ids.len() as u64,
                elapsed_millis: self.delay.as_millis() as u64,
            })
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl SourceClient for BrokenSource {
        fn id(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        async fn query(&self, _query: &str) -> Result<ResultBatch> {
            bail!("connection refused")
        }
    }

    fn source(id: &'static str, ids: Vec<&'static str>, delay_ms: u64) -> Arc<dyn SourceClient> {
        Arc::new(StaticSource {
            id,
            ids,
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn memory_cache() -> ResultCache {
        ResultCache::new(Arc::new(InMemoryIndex::new()), CachePolicyChain::empty())
    }

    #[tokio::test]
    async fn test_all_sources_answer() {
        let mut registry = SourceRegistry::new();
        registry.register(source("s1", vec!["a", "b"], 0));
        registry.register(source("s2", vec!["a"], 5));
        let driver = FederatedSearchDriver::new(registry, None, Duration::from_secs(5));

        let result = driver.run("q", &[]).await.unwrap();
        assert!(result.finished);
        assert!(result.successful);
        assert_eq!(result.items.len(), 3);
        assert_eq!(result.total_hits, 3);
    }

    #[tokio::test]
    async fn test_fault_is_recorded_not_raised() {
        let mut registry = SourceRegistry::new();
        registry.register(source("s1", vec!["a"], 0));
        registry.register(Arc::new(BrokenSource));
        let driver = FederatedSearchDriver::new(registry, None, Duration::from_secs(5));

        let result = driver.run("q", &[]).await.unwrap();
        assert!(result.finished);
        assert!(!result.successful);
        assert_eq!(result.sources["broken"].state(), TrackerState::Failed);
        assert!(result.sources["broken"]
            .failure()
            .unwrap()
            .contains("connection refused"));
        assert_eq!(result.items.len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_fails_slow_sources() {
        let mut registry = SourceRegistry::new();
        registry.register(source("fast", vec!["a"], 0));
        registry.register(source("slow", vec!["b"], 5_000));
        let driver = FederatedSearchDriver::new(registry, None, Duration::from_millis(100));

        let result = driver.run("q", &[]).await.unwrap();
        assert!(result.finished);
        assert_eq!(result.sources["fast"].state(), TrackerState::Succeeded);
        assert_eq!(result.sources["slow"].state(), TrackerState::Failed);
        assert_eq!(result.sources["slow"].failure(), Some(DEADLINE_EXCEEDED));
        assert_eq!(result.failed_sources(), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_merged_items_are_cached() {
        let mut registry = SourceRegistry::new();
        registry.register(source("s1", vec!["a", "b"], 0));
        let driver = FederatedSearchDriver::new(registry, Some(memory_cache()), Duration::from_secs(5));

        driver.run("q", &[]).await.unwrap();
        let summary = driver.flush_cache_writes().await;
        assert_eq!(summary.stored, 2);

        let cached = driver.cache().unwrap().query(&CacheQuery::new()).await.unwrap();
        assert_eq!(cached.hit_count, 2);
    }

    #[tokio::test]
    async fn test_unflushed_cache_writes_stay_bounded() {
        let mut registry = SourceRegistry::new();
        registry.register(source("s1", vec!["a", "b"], 0));
        let driver = FederatedSearchDriver::new(registry, Some(memory_cache()), Duration::from_secs(5));

        let runs = 200;
        for _ in 0..runs {
            driver.run("q", &[]).await.unwrap();
            // Let the spawned put finish before the next run reaps it.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(driver.pending_cache_writes() <= 2);

        let summary = driver.flush_cache_writes().await;
        assert_eq!(summary.stored, runs * 2);
        assert_eq!(driver.pending_cache_writes(), 0);
        assert_eq!(driver.flush_cache_writes().await, PutSummary::default());
    }

    #[tokio::test]
    async fn test_late_response_after_deadline_is_dropped() {
        let mut registry = SourceRegistry::new();
        registry.register(source("fast", vec!["a"], 0));
        registry.register(source("slow", vec!["b"], 150));
        let driver = FederatedSearchDriver::new(registry, Some(memory_cache()), Duration::from_millis(50));

        let result = driver.run("q", &[]).await.unwrap();
        assert_eq!(result.items.len(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(driver.flush_cache_writes().await.stored, 1);
        let metrics = driver.coordinator().source_metrics();
        assert_eq!(metrics["slow"].successes, 0);
        assert_eq!(metrics["slow"].failures, 1);
    }

    #[tokio::test]
    async fn test_selected_sources_only() {
        let mut registry = SourceRegistry::new();
        registry.register(source("s1", vec!["a"], 0));
        registry.register(source("s2", vec!["b"], 0));
        let driver = FederatedSearchDriver::new(registry, None, Duration::from_secs(5));

        let result = driver.run("q", &["s2".to_string()]).await.unwrap();
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.items[0].id, "b");
        assert_eq!(driver.coordinator().source_metrics().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_or_missing_sources_are_errors() {
        let driver = FederatedSearchDriver::new(SourceRegistry::new(), None, Duration::from_secs(1));
        assert!(driver.run("q", &[]).await.is_err());

        let mut registry = SourceRegistry::new();
        registry.register(source("s1", vec![], 0));
        let driver = FederatedSearchDriver::new(registry, None, Duration::from_secs(1));
        assert!(driver.run("q", &["nope".to_string()]).await.is_err());
    }
}
