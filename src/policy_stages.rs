//! Built-in cache policy stages and the config-driven chain builder.
//!
//! Stages run in a fixed order: source allow-list, required attributes,
//! denied values, then attribute stripping. Vetoing stages come first so
//! that stripping never hides an attribute a later check would need.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use catalog_federation_core::models::Item;
use catalog_federation_core::policy::{CachePolicyChain, CachePolicyStage};

use crate::config::PolicyConfig;

/// Only items from the listed sources are cached.
pub struct SourceAllowList {
    allowed: BTreeSet<String>,
}

impl SourceAllowList {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CachePolicyStage for SourceAllowList {
    fn name(&self) -> &str {
        "source_allow_list"
    }

    async fn apply(&self, item: Item) -> Result<Option<Item>> {
        Ok(self.allowed.contains(&item.source_id).then_some(item))
    }
}

/// Items missing any of the listed attributes are not cached.
pub struct RequireAttributes {
    names: Vec<String>,
}

impl RequireAttributes {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

#[async_trait]
impl CachePolicyStage for RequireAttributes {
    fn name(&self) -> &str {
        "require_attributes"
    }

    async fn apply(&self, item: Item) -> Result<Option<Item>> {
        let complete = self
            .names
            .iter()
            .all(|n| matches!(item.attribute(n), Some(v) if !v.is_null()));
        Ok(complete.then_some(item))
    }
}

/// Items carrying any denied value under the named attribute are not cached.
pub struct DenyAttributeValues {
    denied: BTreeMap<String, Vec<Value>>,
}

impl DenyAttributeValues {
    pub fn new(denied: BTreeMap<String, Vec<Value>>) -> Self {
        Self { denied }
    }
}

#[async_trait]
impl CachePolicyStage for DenyAttributeValues {
    fn name(&self) -> &str {
        "deny_attribute_values"
    }

    async fn apply(&self, item: Item) -> Result<Option<Item>> {
        let denied = self
            .denied
            .iter()
            .any(|(name, values)| item.attribute_matches(name, values));
        Ok((!denied).then_some(item))
    }
}

/// Removes the listed attributes before the item is stored.
pub struct StripAttributes {
    names: Vec<String>,
}

impl StripAttributes {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

#[async_trait]
impl CachePolicyStage for StripAttributes {
    fn name(&self) -> &str {
        "strip_attributes"
    }

    async fn apply(&self, item: Item) -> Result<Option<Item>> {
        let stripped = self
            .names
            .iter()
            .fold(item, |item, name| item.without_attribute(name));
        Ok(Some(stripped))
    }
}

/// Build the policy chain described by `[cache.policy]`. Empty settings
/// contribute no stage.
pub fn build_policy_chain(config: &PolicyConfig) -> CachePolicyChain {
    let mut builder =
        CachePolicyChain::builder().stage_timeout(Duration::from_millis(config.stage_timeout_ms));

    if !config.allowed_sources.is_empty() {
        builder = builder.stage(SourceAllowList::new(config.allowed_sources.clone()));
    }
    if !config.required_attributes.is_empty() {
        builder = builder.stage(RequireAttributes::new(config.required_attributes.clone()));
    }
    if !config.deny_values.is_empty() {
        builder = builder.stage(DenyAttributeValues::new(config.deny_values.clone()));
    }
    if !config.strip_attributes.is_empty() {
        builder = builder.stage(StripAttributes::new(config.strip_attributes.clone()));
    }

    builder.build()
}
