//! # Catalog Federation CLI (`fedq`)
//!
//! ## Usage
//!
//! ```bash
//! fedq --config ./config/fedq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fedq init` | Create the SQLite cache schema |
//! | `fedq sources` | List configured sources and their health |
//! | `fedq search "<query>"` | Run a federated search and cache the results |
//! | `fedq cache query` | List cached entries matching attribute filters |
//! | `fedq cache delete <attr> <value>...` | Remove cached entries |
//! | `fedq fingerprint <source-id> <id>` | Print the cache key for an item |
//!
//! ## Examples
//!
//! ```bash
//! # Search two sources with a 2 second deadline
//! fedq search "sea surface" --source local --source archive --deadline-ms 2000
//!
//! # Cached entries from one source, newest first
//! fedq cache query --attr source-id=local --limit 20
//!
//! # Evict everything tagged restricted
//! fedq cache delete tags restricted
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use catalog_federation::{cache_cmd, config, logging, migrate, search, sources};
use catalog_federation_core::models::RetrievalContext;

/// Catalog Federation CLI: federated catalog search with a result cache.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "fedq",
    about = "Federated catalog search with a policy-gated result cache",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fedq.toml")]
    config: PathBuf,

    /// Log filter used when neither FEDQ_LOG nor RUST_LOG is set.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the cache database schema.
    ///
    /// Idempotent. Requires `cache.backend = "sqlite"`.
    Init,

    /// List configured sources and their health.
    Sources,

    /// Run a federated search.
    ///
    /// Queries every selected source concurrently, prints the merged items
    /// and a per-source status table, and caches newly merged items.
    Search {
        /// The search query. `*` matches everything in catalog-file sources.
        query: String,

        /// Restrict the search to these source ids (repeatable). Defaults to
        /// every configured source.
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Override `federation.deadline_ms`.
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Retrieval option folded into the cache key.
        #[arg(long)]
        option: Option<String>,

        /// Retrieval property folded into the cache key, as `key=value`.
        #[arg(long = "prop", value_parser = parse_key_val)]
        props: Vec<(String, String)>,

        /// Print the composite result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or evict cached entries.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print the cache fingerprint of an item identity and context.
    Fingerprint {
        source_id: String,
        id: String,

        #[arg(long)]
        option: Option<String>,

        /// Context property as `key=value` (repeatable).
        #[arg(long = "prop", value_parser = parse_key_val)]
        props: Vec<(String, String)>,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
enum CacheAction {
    /// List cached entries, newest first.
    Query {
        /// Attribute filter as `name=value`. Repeating a name ORs its values;
        /// different names are ANDed. `id` and `source-id` address identity.
        #[arg(long = "attr", value_parser = parse_key_val)]
        attrs: Vec<(String, String)>,

        /// Only the entry with this fingerprint.
        #[arg(long)]
        fingerprint: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },
    /// Remove entries carrying any of the values under the attribute.
    Delete {
        attribute: String,
        #[arg(required = true)]
        values: Vec<String>,
    },
}

/// Parse a `key=value` pair for `--attr` and `--prop` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn retrieval_context(option: Option<String>, props: &[(String, String)]) -> Option<RetrievalContext> {
    if option.is_none() && props.is_empty() {
        return None;
    }
    let mut context = RetrievalContext::new();
    if let Some(option) = option {
        context = context.with_option(option);
    }
    for (name, value) in props {
        context = context.with_property(name.clone(), cache_cmd::parse_value(value));
    }
    Some(context)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_level.as_deref())?;

    // Commands that don't require config
    if let Commands::Fingerprint {
        source_id,
        id,
        option,
        props,
    } = &cli.command
    {
        return cache_cmd::cmd_fingerprint(source_id, id, option.as_deref(), props);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Cache database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Search {
            query,
            sources,
            deadline_ms,
            option,
            props,
            json,
        } => {
            let opts = search::SearchOptions {
                sources,
                deadline_ms,
                context: retrieval_context(option, &props),
                json,
            };
            search::run_search(&cfg, &query, &opts).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Query {
                attrs,
                fingerprint,
                limit,
                json,
            } => {
                cache_cmd::cmd_cache_query(&cfg, &attrs, fingerprint.as_deref(), limit, json)
                    .await?;
            }
            CacheAction::Delete { attribute, values } => {
                cache_cmd::cmd_cache_delete(&cfg, &attribute, &values).await?;
            }
        },
        Commands::Fingerprint { .. } => {}
    }

    Ok(())
}
