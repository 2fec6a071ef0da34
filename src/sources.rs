//! Federated sources and the registry the driver fans out over.
//!
//! A source is anything that can answer a free-text query with a
//! [`ResultBatch`]. Built-in sources are resolved from `[[sources]]` entries
//! in the config; embedders can register their own [`SourceClient`]
//! implementations alongside them.
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │           SourceRegistry           │
//! │  ┌──────────────┐ ┌─────────────┐  │
//! │  │ catalog_file │ │   Custom    │  │
//! │  │   sources    │ │   (Rust)    │  │
//! │  └──────────────┘ └─────────────┘  │
//! └─────────────────┬──────────────────┘
//!                   ▼
//!     FederatedSearchDriver::run()
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use catalog_federation_core::models::ResultBatch;

use crate::config::Config;
use crate::source_catalog::CatalogFileSource;

/// A remote or local catalog that can be searched.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use catalog_federation::sources::SourceClient;
/// use catalog_federation_core::models::ResultBatch;
///
/// struct EmptySource;
///
/// #[async_trait]
/// impl SourceClient for EmptySource {
///     fn id(&self) -> &str { "empty" }
///     fn description(&self) -> &str { "Never finds anything" }
///
///     async fn query(&self, _query: &str) -> Result<ResultBatch> {
///         Ok(ResultBatch::default())
///     }
/// }
/// ```
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Stable identifier; used as the tracker key and stamped on items.
    fn id(&self) -> &str;

    /// One-line description shown by `fedq sources`.
    fn description(&self) -> &str;

    /// Source type identifier (e.g. `"catalog_file"`). Custom sources
    /// default to `"custom"`.
    fn source_type(&self) -> &str {
        "custom"
    }

    /// Run `query` against the source.
    ///
    /// An `Err` is recorded as a fault against this source; it does not
    /// fail the federated search as a whole.
    async fn query(&self, query: &str) -> Result<ResultBatch>;
}

/// Registered sources, in registration order.
pub struct SourceRegistry {
    sources: Vec<Arc<dyn SourceClient>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Create a registry holding every source declared in the config.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for cfg in &config.sources {
            match cfg.source_type.as_str() {
                "catalog_file" => registry.register(Arc::new(CatalogFileSource::new(cfg.clone()))),
                other => tracing::warn!(source_id = %cfg.id, source_type = other, "skipping unknown source type"),
            }
        }
        registry
    }

    /// Register a source. A later source with the same id replaces the
    /// earlier one.
    pub fn register(&mut self, source: Arc<dyn SourceClient>) {
        self.sources.retain(|s| s.id() != source.id());
        self.sources.push(source);
    }

    pub fn find(&self, id: &str) -> Option<Arc<dyn SourceClient>> {
        self.sources.iter().find(|s| s.id() == id).cloned()
    }

    pub fn sources(&self) -> &[Arc<dyn SourceClient>] {
        &self.sources
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration and health of one declared source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub source_type: String,
    pub healthy: bool,
    /// Diagnostic notes (e.g. `"path does not exist"`).
    pub notes: Option<String>,
}

/// Health of every source declared in the config.
pub fn get_sources(config: &Config) -> Vec<SourceStatus> {
    config
        .sources
        .iter()
        .map(|cfg| {
            let exists = cfg.path.exists();
            SourceStatus {
                id: cfg.id.clone(),
                source_type: cfg.source_type.clone(),
                healthy: exists,
                notes: if exists {
                    cfg.description.clone()
                } else {
                    Some(format!("path does not exist: {}", cfg.path.display()))
                },
            }
        })
        .collect()
}

/// Print the `fedq sources` table.
pub fn list_sources(config: &Config) -> Result<()> {
    let statuses = get_sources(config);
    if statuses.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!("{:<20} {:<14} {:<8} NOTES", "SOURCE", "TYPE", "HEALTHY");
    for s in &statuses {
        println!(
            "{:<20} {:<14} {:<8} {}",
            s.id,
            s.source_type,
            s.healthy,
            s.notes.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
