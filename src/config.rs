//! TOML configuration for the `fedq` binary and the federation driver.
//!
//! ```toml
//! [cache]
//! backend = "sqlite"            # or "memory"
//! path = "./data/cache.sqlite"
//!
//! [cache.policy]
//! stage_timeout_ms = 500
//! allowed_sources = []
//! required_attributes = ["title"]
//! strip_attributes = ["raw"]
//! deny_values = { "security.restricted" = [true] }
//!
//! [federation]
//! deadline_ms = 10000
//!
//! [[sources]]
//! id = "local"
//! type = "catalog_file"
//! path = "./catalog"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    #[serde(default)]
    pub allowed_sources: Vec<String>,
    #[serde(default)]
    pub required_attributes: Vec<String>,
    #[serde(default)]
    pub strip_attributes: Vec<String>,
    #[serde(default)]
    pub deny_values: BTreeMap<String, Vec<Value>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: default_stage_timeout_ms(),
            allowed_sources: Vec::new(),
            required_attributes: Vec::new(),
            strip_attributes: Vec::new(),
            deny_values: BTreeMap::new(),
        }
    }
}

fn default_stage_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct FederationConfig {
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
        }
    }
}

fn default_deadline_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: String,
    #[serde(rename = "type", default = "default_source_type")]
    pub source_type: String,
    pub path: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_source_type() -> String {
    "catalog_file".to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

impl Config {
    /// In-memory cache, default deadline, no sources.
    pub fn minimal() -> Self {
        Self {
            cache: CacheConfig {
                backend: "memory".to_string(),
                path: None,
                enabled: true,
                policy: PolicyConfig::default(),
            },
            federation: FederationConfig::default(),
            sources: Vec::new(),
        }
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    match config.cache.backend.as_str() {
        "memory" => {}
        "sqlite" => {
            if config.cache.path.is_none() {
                bail!("cache.path must be set when cache.backend is 'sqlite'");
            }
        }
        other => bail!(
            "Unknown cache backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }

    if config.cache.policy.stage_timeout_ms == 0 {
        bail!("cache.policy.stage_timeout_ms must be > 0");
    }

    if config.federation.deadline_ms == 0 {
        bail!("federation.deadline_ms must be > 0");
    }

    let mut seen = HashSet::new();
    for source in &config.sources {
        if source.id.trim().is_empty() {
            bail!("sources[].id must not be empty");
        }
        if !seen.insert(source.id.as_str()) {
            bail!("Duplicate source id: '{}'", source.id);
        }
        match source.source_type.as_str() {
            "catalog_file" => {}
            other => bail!(
                "Unknown source type '{}' for source '{}'. Must be catalog_file.",
                other,
                source.id
            ),
        }
    }

    Ok(config)
}
