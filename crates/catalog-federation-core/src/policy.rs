//! Ordered cache-policy stages applied before an item is persisted.
//!
//! Each [`CachePolicyStage`] receives the item as left by the previous stage
//! and either passes it on (possibly transformed) or vetoes caching. The
//! chain stops at the first veto. A stage error or a stage exceeding the
//! chain's per-stage timeout counts as a veto for that item only.
//!
//! Stages are supplied explicitly through [`CachePolicyChainBuilder`]; there
//! is no runtime discovery.
//!
//! [`CachePolicyChain::apply`] relies on `tokio::time` for the per-stage
//! timeout and must be polled inside a Tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::models::Item;

/// Per-stage time budget used when none is configured.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_millis(500);

/// One step of the cache policy chain.
///
/// Implementations may consult external policy configuration but must not
/// mutate anything outside the item they are handed.
#[async_trait]
pub trait CachePolicyStage: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &str;

    /// Return `Ok(Some(item))` to continue the chain or `Ok(None)` to veto.
    async fn apply(&self, item: Item) -> Result<Option<Item>>;
}

/// An ordered, short-circuiting sequence of [`CachePolicyStage`]s.
#[derive(Clone)]
pub struct CachePolicyChain {
    stages: Vec<Arc<dyn CachePolicyStage>>,
    stage_timeout: Duration,
}

impl CachePolicyChain {
    pub fn builder() -> CachePolicyChainBuilder {
        CachePolicyChainBuilder::default()
    }

    /// A chain with no stages; every item passes unchanged.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    /// Run `item` through every stage, returning the item to cache or
    /// `None` when any stage vetoes, fails, or times out.
    pub async fn apply(&self, item: Item) -> Option<Item> {
        let source_id = item.source_id.clone();
        let item_id = item.id.clone();
        let mut current = item;

        for stage in &self.stages {
            match tokio::time::timeout(self.stage_timeout, stage.apply(current)).await {
                Ok(Ok(Some(next))) => current = next,
                Ok(Ok(None)) => {
                    debug!(
                        stage = stage.name(),
                        source_id = %source_id,
                        item_id = %item_id,
                        "cache policy vetoed item"
                    );
                    return None;
                }
                Ok(Err(e)) => {
                    warn!(
                        stage = stage.name(),
                        source_id = %source_id,
                        item_id = %item_id,
                        error = %e,
                        "cache policy stage failed; treating as veto"
                    );
                    return None;
                }
                Err(_) => {
                    warn!(
                        stage = stage.name(),
                        source_id = %source_id,
                        item_id = %item_id,
                        timeout_ms = self.stage_timeout.as_millis() as u64,
                        "cache policy stage timed out; treating as veto"
                    );
                    return None;
                }
            }
        }

        Some(current)
    }

    /// Apply the chain to each item independently, keeping survivors in
    /// their original order.
    pub async fn apply_all(&self, items: Vec<Item>) -> Vec<Item> {
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            if let Some(item) = self.apply(item).await {
                kept.push(item);
            }
        }
        kept
    }
}

impl Default for CachePolicyChain {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for CachePolicyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicyChain")
            .field("stages", &self.stage_names())
            .field("stage_timeout", &self.stage_timeout)
            .finish()
    }
}

/// Builder for [`CachePolicyChain`].
pub struct CachePolicyChainBuilder {
    stages: Vec<Arc<dyn CachePolicyStage>>,
    stage_timeout: Duration,
}

impl Default for CachePolicyChainBuilder {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }
}

impl CachePolicyChainBuilder {
    /// Append a stage; stages run in the order they are added.
    pub fn stage<S: CachePolicyStage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append an already shared stage.
    pub fn shared_stage(mut self, stage: Arc<dyn CachePolicyStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn build(self) -> CachePolicyChain {
        CachePolicyChain {
            stages: self.stages,
            stage_timeout: self.stage_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tag(&'static str);

    #[async_trait]
    impl CachePolicyStage for Tag {
        fn name(&self) -> &str {
            "tag"
        }

        async fn apply(&self, item: Item) -> Result<Option<Item>> {
            Ok(Some(item.with_attribute(self.0, true)))
        }
    }

    struct Veto;

    #[async_trait]
    impl CachePolicyStage for Veto {
        fn name(&self) -> &str {
            "veto"
        }

        async fn apply(&self, item: Item) -> Result<Option<Item>> {
            if item.id == "blocked" {
                Ok(None)
            } else {
                Ok(Some(item))
            }
        }
    }

    struct Broken;

    #[async_trait]
    impl CachePolicyStage for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn apply(&self, item: Item) -> Result<Option<Item>> {
            if item.id == "poison" {
                anyhow::bail!("policy lookup failed")
            }
            Ok(Some(item))
        }
    }

    struct Slow;

    #[async_trait]
    impl CachePolicyStage for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn apply(&self, item: Item) -> Result<Option<Item>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(item))
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl CachePolicyStage for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn apply(&self, item: Item) -> Result<Option<Item>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(item))
        }
    }

    #[tokio::test]
    async fn test_empty_chain_passes_item_through() {
        let chain = CachePolicyChain::empty();
        let item = Item::new("s1", "a");
        assert_eq!(chain.apply(item.clone()).await, Some(item));
    }

    #[tokio::test]
    async fn test_stages_see_earlier_transforms() {
        let chain = CachePolicyChain::builder()
            .stage(Tag("first"))
            .stage(Tag("second"))
            .build();
        let out = chain.apply(Item::new("s1", "a")).await.unwrap();
        assert!(out.attribute("first").is_some());
        assert!(out.attribute("second").is_some());
        assert_eq!(chain.stage_names(), vec!["tag", "tag"]);
    }

    #[tokio::test]
    async fn test_veto_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = CachePolicyChain::builder()
            .stage(Veto)
            .stage(Counter(calls.clone()))
            .build();
        assert!(chain.apply(Item::new("s1", "blocked")).await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stage_error_is_a_veto_for_that_item_only() {
        let chain = CachePolicyChain::builder().stage(Broken).build();
        let kept = chain
            .apply_all(vec![
                Item::new("s1", "a"),
                Item::new("s1", "poison"),
                Item::new("s1", "b"),
            ])
            .await;
        let ids: Vec<&str> = kept.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_slow_stage_times_out_as_veto() {
        let chain = CachePolicyChain::builder()
            .stage(Slow)
            .stage_timeout(Duration::from_millis(20))
            .build();
        assert!(chain.apply(Item::new("s1", "a")).await.is_none());
    }
}
