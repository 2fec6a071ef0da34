//! Cache construction and the `fedq cache` / `fedq fingerprint` commands.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use catalog_federation_core::cache::ResultCache;
use catalog_federation_core::fingerprint::{fingerprint, Fingerprint};
use catalog_federation_core::index::memory::InMemoryIndex;
use catalog_federation_core::index::{CacheQuery, IndexBackend};
use catalog_federation_core::models::{Item, RetrievalContext};

use crate::config::Config;
use crate::db;
use crate::migrate::apply_schema;
use crate::policy_stages::build_policy_chain;
use crate::sqlite_index::SqliteIndex;

/// Open the configured cache, or `None` when `cache.enabled = false`.
///
/// The SQLite schema is applied on open, so a fresh path works without a
/// prior `fedq init`.
pub async fn open_cache(config: &Config) -> Result<Option<ResultCache>> {
    if !config.cache.enabled {
        return Ok(None);
    }

    let backend: Arc<dyn IndexBackend> = match config.cache.backend.as_str() {
        "memory" => Arc::new(InMemoryIndex::new()),
        _ => {
            let pool = db::connect(config).await?;
            apply_schema(&pool).await?;
            Arc::new(SqliteIndex::new(pool))
        }
    };

    Ok(Some(ResultCache::new(
        backend,
        build_policy_chain(&config.cache.policy),
    )))
}

/// Parse a command-line value as JSON, falling back to a plain string.
///
/// `true`, `42` and `["a"]` become typed values; `ocean` stays a string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Run `fedq cache query`.
pub async fn cmd_cache_query(
    config: &Config,
    attrs: &[(String, String)],
    fingerprint: Option<&str>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let cache = open_cache(config)
        .await?
        .context("Cache is disabled (cache.enabled = false)")?;

    let mut grouped: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for (name, value) in attrs {
        grouped.entry(name.as_str()).or_default().push(parse_value(value));
    }

    let mut criteria = CacheQuery::new();
    for (name, values) in grouped {
        criteria = criteria.attribute(name, values);
    }
    if let Some(fp) = fingerprint {
        criteria = criteria.fingerprint(Fingerprint::from_hex(fp));
    }
    if let Some(limit) = limit {
        criteria = criteria.limit(limit);
    }

    let batch = cache.query(&criteria).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&batch.entries)?);
        return Ok(());
    }

    if batch.entries.is_empty() {
        println!("No cached entries.");
        return Ok(());
    }

    for entry in &batch.entries {
        println!("{}  {}:{}", entry.fingerprint, entry.item.source_id, entry.item.id);
        println!("    stored: {}", entry.stored_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(title) = entry.item.attribute("title").and_then(Value::as_str) {
            println!("    title: {}", title);
        }
    }
    println!();
    println!(
        "{} of {} matching entries shown.",
        batch.entries.len(),
        batch.hit_count
    );
    Ok(())
}

/// Run `fedq cache delete`.
pub async fn cmd_cache_delete(config: &Config, attribute: &str, values: &[String]) -> Result<()> {
    let cache = open_cache(config)
        .await?
        .context("Cache is disabled (cache.enabled = false)")?;

    let values: Vec<Value> = values.iter().map(|v| parse_value(v)).collect();
    let removed = cache.delete(attribute, &values).await;
    println!("Removed {} cached entries.", removed);
    Ok(())
}

/// Compute the cache key for an item identity and retrieval context.
pub fn compute_fingerprint(
    source_id: &str,
    id: &str,
    option: Option<&str>,
    props: &[(String, String)],
) -> Result<Fingerprint> {
    let item = Item::new(source_id, id);
    let mut context = RetrievalContext::new();
    if let Some(option) = option {
        context = context.with_option(option);
    }
    for (name, value) in props {
        context = context.with_property(name.clone(), parse_value(value));
    }
    Ok(fingerprint(&item, Some(&context))?)
}

/// Run `fedq fingerprint`.
pub fn cmd_fingerprint(
    source_id: &str,
    id: &str,
    option: Option<&str>,
    props: &[(String, String)],
) -> Result<()> {
    println!("{}", compute_fingerprint(source_id, id, option, props)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("ocean"), json!("ocean"));
        assert_eq!(parse_value("\"42\""), json!("42"));
    }

    #[test]
    fn test_compute_fingerprint_matches_library() {
        let props = vec![("format".to_string(), "xml".to_string())];
        let cli = compute_fingerprint("s1", "a", Some("full"), &props).unwrap();

        let context = RetrievalContext::new()
            .with_option("full")
            .with_property("format", "xml");
        let lib = fingerprint(&Item::new("s1", "a"), Some(&context)).unwrap();
        assert_eq!(cli, lib);

        let bare = compute_fingerprint("s1", "a", None, &[]).unwrap();
        assert_eq!(bare, fingerprint(&Item::new("s1", "a"), None).unwrap());
        assert!(compute_fingerprint("s1", " ", None, &[]).is_err());
    }

    #[tokio::test]
    async fn test_open_cache_respects_enabled() {
        let mut config = Config::minimal();
        assert!(open_cache(&config).await.unwrap().is_some());
        config.cache.enabled = false;
        assert!(open_cache(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_sqlite_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::minimal();
        config.cache.backend = "sqlite".to_string();
        config.cache.path = Some(tmp.path().join("data/cache.sqlite"));

        let cache = open_cache(&config).await.unwrap().unwrap();
        let summary = cache.put(vec![Item::new("s1", "a")], None).await;
        assert_eq!(summary.stored, 1);
        let key = fingerprint(&Item::new("s1", "a"), None).unwrap();
        assert!(cache.contains(&key).await.unwrap());
    }
}
