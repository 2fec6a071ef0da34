//! Catalog-file source.
//!
//! Searches JSON catalog files under a configured path. Each file holds
//! either an array of items or an object with an `items` array:
//!
//! ```json
//! [
//!   { "id": "ds-1", "attributes": { "title": "Coastal bathymetry", "tags": ["ocean"] } }
//! ]
//! ```
//!
//! A query is split on whitespace; an item matches when every term occurs,
//! case-insensitively, in its id or in one of its string attributes
//! (including string elements of arrays). The query `*` or an empty query
//! matches every item. Files are walked with `walkdir` and filtered by the
//! source's include/exclude globs; reading happens on a blocking thread.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Instant;
use walkdir::WalkDir;

use catalog_federation_core::models::{Item, ResultBatch};

use crate::config::SourceConfig;
use crate::sources::SourceClient;

/// A [`SourceClient`] backed by JSON catalog files on disk.
pub struct CatalogFileSource {
    config: SourceConfig,
    description: String,
}

impl CatalogFileSource {
    pub fn new(config: SourceConfig) -> Self {
        let description = config
            .description
            .clone()
            .unwrap_or_else(|| format!("Catalog files under {}", config.path.display()));
        Self {
            config,
            description,
        }
    }
}

#[async_trait]
impl SourceClient for CatalogFileSource {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn source_type(&self) -> &str {
        "catalog_file"
    }

    async fn query(&self, query: &str) -> Result<ResultBatch> {
        let config = self.config.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || search_catalog(&config, &query)).await?
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    List(Vec<Item>),
    Wrapped { items: Vec<Item> },
}

/// Load every catalog item under the source path and return the matches.
pub fn search_catalog(config: &SourceConfig, query: &str) -> Result<ResultBatch> {
    let started = Instant::now();
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|t| *t != "*")
        .map(str::to_lowercase)
        .collect();

    let mut items = Vec::new();
    for item in load_catalog(config)? {
        if terms.iter().all(|t| item_contains(&item, t)) {
            items.push(item.with_source_id(config.id.clone()));
        }
    }
    items.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(ResultBatch {
        hit_count: items.len() as u64,
        items,
        elapsed_millis: started.elapsed().as_millis() as u64,
    })
}

fn load_catalog(config: &SourceConfig) -> Result<Vec<Item>> {
    let root = &config.path;
    if !root.exists() {
        bail!("catalog path does not exist: {}", root.display());
    }
    if root.is_file() {
        return read_catalog_file(root);
    }

    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut items = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        items.extend(read_catalog_file(path)?);
    }
    Ok(items)
}

fn read_catalog_file(path: &Path) -> Result<Vec<Item>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
    let file: CatalogFile = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse catalog file: {}", path.display()))?;
    Ok(match file {
        CatalogFile::List(items) => items,
        CatalogFile::Wrapped { items } => items,
    })
}

fn item_contains(item: &Item, term: &str) -> bool {
    item.id.to_lowercase().contains(term) || item.attributes.values().any(|v| value_contains(v, term))
}

fn value_contains(value: &Value, term: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(term),
        Value::Array(elements) => elements.iter().any(|e| value_contains(e, term)),
        _ => false,
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
