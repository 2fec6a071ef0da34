//! SQLite-backed [`IndexBackend`] implementation.
//!
//! Each cache entry is one row in `cache_entries`, keyed by fingerprint,
//! with the item stored as JSON. Fingerprint and identity filters (`id`,
//! `source-id`) are evaluated in SQL. Other attribute filters narrow the
//! scan in SQL to rows carrying the attribute (`json_type`), then compare
//! values against the decoded item so that matching semantics stay
//! identical to the in-memory backend.
//!
//! Rows whose `item_json` does not decode are skipped with a warning and
//! never fail a query or a delete.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::warn;

use catalog_federation_core::fingerprint::Fingerprint;
use catalog_federation_core::index::{finish_batch, CacheQuery, CachedBatch, IndexBackend};
use catalog_federation_core::models::{CacheEntry, Item, ID_ATTRIBUTE, SOURCE_ID_ATTRIBUTE};

/// SQLite implementation of the [`IndexBackend`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Wrap a pool whose schema was created by
    /// [`apply_schema`](crate::migrate::apply_schema).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Column for identity pseudo-attributes, if `name` is one.
fn identity_column(name: &str) -> Option<&'static str> {
    match name {
        ID_ATTRIBUTE => Some("item_id"),
        SOURCE_ID_ATTRIBUTE => Some("source_id"),
        _ => None,
    }
}

/// JSON path of a named attribute inside `item_json`, if SQLite can
/// address it.
fn attribute_path(name: &str) -> Option<String> {
    (!name.contains('"')).then(|| format!("$.attributes.\"{}\"", name))
}

/// Restrict to rows whose item carries the attribute at `path`. Malformed
/// JSON yields NULL here instead of an SQL error.
fn push_has_attribute(qb: &mut QueryBuilder<'_, Sqlite>, path: String) {
    qb.push(" AND (CASE WHEN json_valid(item_json) THEN json_type(item_json, ")
        .push_bind(path)
        .push(") END) IS NOT NULL");
}

/// Decode a row, logging and discarding it when the stored item is corrupt.
fn decode_row(row: &SqliteRow) -> Option<CacheEntry> {
    match row_to_entry(row) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "skipping undecodable cache entry");
            None
        }
    }
}

fn text_values(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}

fn row_to_entry(row: &SqliteRow) -> Result<CacheEntry> {
    let fingerprint: String = row.get("fingerprint");
    let item_json: String = row.get("item_json");
    let stored_at_ms: i64 = row.get("stored_at");

    let item: Item = serde_json::from_str(&item_json)
        .with_context(|| format!("corrupt cache entry {}", fingerprint))?;
    let stored_at = DateTime::<Utc>::from_timestamp_millis(stored_at_ms).unwrap_or_default();

    Ok(CacheEntry {
        fingerprint: Fingerprint::from_hex(fingerprint),
        item,
        stored_at,
    })
}

#[async_trait]
impl IndexBackend for SqliteIndex {
    async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let item_json = serde_json::to_string(&entry.item)?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (fingerprint, source_id, item_id, item_json, stored_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                source_id = excluded.source_id,
                item_id = excluded.item_id,
                item_json = excluded.item_json,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(entry.fingerprint.as_str())
        .bind(&entry.item.source_id)
        .bind(&entry.item.id)
        .bind(&item_json)
        .bind(entry.stored_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_where(&self, attribute: &str, values: &[Value]) -> Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }

        if let Some(column) = identity_column(attribute) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM cache_entries WHERE ");
            qb.push(column).push(" IN (");
            let mut separated = qb.separated(", ");
            for v in text_values(values) {
                separated.push_bind(v);
            }
            separated.push_unseparated(")");
            let result = qb.build().execute(&self.pool).await?;
            return Ok(result.rows_affected() as usize);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT fingerprint, item_json, stored_at FROM cache_entries WHERE 1 = 1");
        if let Some(path) = attribute_path(attribute) {
            push_has_attribute(&mut qb, path);
        }

        let mut tx = self.pool.begin().await?;
        let rows = qb.build().fetch_all(&mut *tx).await?;

        let mut removed = 0;
        for row in &rows {
            let Some(entry) = decode_row(row) else {
                continue;
            };
            if entry.item.attribute_matches(attribute, values) {
                sqlx::query("DELETE FROM cache_entries WHERE fingerprint = ?")
                    .bind(entry.fingerprint.as_str())
                    .execute(&mut *tx)
                    .await?;
                removed += 1;
            }
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn query(&self, criteria: &CacheQuery) -> Result<CachedBatch> {
        criteria.validate()?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT fingerprint, item_json, stored_at FROM cache_entries WHERE 1 = 1");

        if let Some(fp) = &criteria.fingerprint {
            qb.push(" AND fingerprint = ").push_bind(fp.as_str().to_string());
        }
        for filter in &criteria.filters {
            if let Some(column) = identity_column(&filter.name) {
                qb.push(" AND ").push(column).push(" IN (");
                let mut separated = qb.separated(", ");
                for v in text_values(&filter.values) {
                    separated.push_bind(v);
                }
                separated.push_unseparated(")");
            } else if let Some(path) = attribute_path(&filter.name) {
                push_has_attribute(&mut qb, path);
            }
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut matched = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(entry) = decode_row(row) else {
                continue;
            };
            if criteria.matches(&entry) {
                matched.push(entry);
            }
        }

        Ok(finish_batch(matched, criteria.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_path;
    use crate::migrate::apply_schema;
    use catalog_federation_core::fingerprint::fingerprint;
    use catalog_federation_core::index::UnsupportedCriteria;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteIndex {
        let pool = connect_path(&tmp.path().join("cache.sqlite")).await.unwrap();
        apply_schema(&pool).await.unwrap();
        SqliteIndex::new(pool)
    }

    fn entry(item: Item) -> CacheEntry {
        CacheEntry {
            fingerprint: fingerprint(&item, None).unwrap(),
            item,
            stored_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_query_by_identity() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert(&entry(Item::new("s1", "a").with_attribute("title", "Alpha")))
            .await
            .unwrap();
        index.upsert(&entry(Item::new("s2", "a"))).await.unwrap();

        let batch = index
            .query(
                &CacheQuery::new()
                    .attribute(ID_ATTRIBUTE, ["a"])
                    .attribute(SOURCE_ID_ATTRIBUTE, ["s1"]),
            )
            .await
            .unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].item.attribute("title"), Some(&json!("Alpha")));
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert(&entry(Item::new("s1", "a").with_attribute("v", 1)))
            .await
            .unwrap();
        index
            .upsert(&entry(Item::new("s1", "a").with_attribute("v", 2)))
            .await
            .unwrap();

        let batch = index.query(&CacheQuery::new()).await.unwrap();
        assert_eq!(batch.hit_count, 1);
        assert_eq!(batch.entries[0].item.attribute("v"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_attribute_filters_and_delete() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert(&entry(Item::new("s1", "a").with_attribute("tags", json!(["map", "geo"]))))
            .await
            .unwrap();
        index
            .upsert(&entry(Item::new("s1", "b").with_attribute("tags", json!(["doc"]))))
            .await
            .unwrap();

        let maps = index
            .query(&CacheQuery::new().attribute("tags", ["geo"]))
            .await
            .unwrap();
        assert_eq!(maps.entries.len(), 1);
        assert_eq!(maps.entries[0].item.id, "a");

        assert_eq!(index.delete_where("tags", &[json!("doc")]).await.unwrap(), 1);
        assert_eq!(index.delete_where(ID_ATTRIBUTE, &[json!("a")]).await.unwrap(), 1);
        assert_eq!(index.query(&CacheQuery::new()).await.unwrap().hit_count, 0);
    }

    async fn insert_raw(index: &SqliteIndex, fingerprint: &str, item_json: &str) {
        sqlx::query(
            "INSERT INTO cache_entries (fingerprint, source_id, item_id, item_json, stored_at) \
             VALUES (?, 's1', 'raw', ?, 0)",
        )
        .bind(fingerprint)
        .bind(item_json)
        .execute(index.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_rows_do_not_break_query_or_delete() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert(&entry(Item::new("s1", "a").with_attribute("kind", "map")))
            .await
            .unwrap();
        insert_raw(&index, "zz", "not json").await;
        insert_raw(&index, "zy", r#"{"attributes": {"kind": "map"}}"#).await;

        let maps = index
            .query(&CacheQuery::new().attribute("kind", ["map"]))
            .await
            .unwrap();
        assert_eq!(maps.entries.len(), 1);
        assert_eq!(maps.entries[0].item.id, "a");

        let everything = index.query(&CacheQuery::new()).await.unwrap();
        assert_eq!(everything.hit_count, 1);

        assert_eq!(index.delete_where("kind", &[json!("map")]).await.unwrap(), 1);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(index.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn test_null_attribute_value_is_matchable() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert(&entry(Item::new("s1", "a").with_attribute("license", Value::Null)))
            .await
            .unwrap();
        index.upsert(&entry(Item::new("s1", "b"))).await.unwrap();

        let batch = index
            .query(&CacheQuery::new().attribute("license", [Value::Null]))
            .await
            .unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].item.id, "a");
    }

    #[tokio::test]
    async fn test_query_by_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let e = entry(Item::new("s1", "a"));
        index.upsert(&e).await.unwrap();
        index.upsert(&entry(Item::new("s1", "b"))).await.unwrap();

        let batch = index
            .query(&CacheQuery::new().fingerprint(e.fingerprint.clone()))
            .await
            .unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].fingerprint, e.fingerprint);
    }

    #[tokio::test]
    async fn test_invalid_criteria_is_unsupported() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let none: [&str; 0] = [];
        let err = index
            .query(&CacheQuery::new().attribute("tags", none))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<UnsupportedCriteria>().is_some());
    }
}
