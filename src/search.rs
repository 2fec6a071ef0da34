//! The `fedq search` command.

use anyhow::Result;
use serde_json::Value;
use std::time::Duration;

use catalog_federation_core::federation::CompositeResult;
use catalog_federation_core::models::RetrievalContext;
use catalog_federation_core::tracker::TrackerState;

use crate::config::Config;
use crate::driver::FederatedSearchDriver;

/// Options for one `fedq search` invocation.
#[derive(Debug, Default, Clone)]
pub struct SearchOptions {
    pub sources: Vec<String>,
    pub deadline_ms: Option<u64>,
    pub context: Option<RetrievalContext>,
    pub json: bool,
}

/// Run a federated search, print the composite result, and wait for the
/// cache writes it triggered.
pub async fn run_search(config: &Config, query: &str, opts: &SearchOptions) -> Result<()> {
    let mut driver = FederatedSearchDriver::from_config(config).await?;
    if let Some(ms) = opts.deadline_ms {
        driver = driver.with_deadline(Duration::from_millis(ms));
    }
    if let Some(context) = &opts.context {
        driver = driver.with_context(context.clone());
    }

    let result = driver.run(query, &opts.sources).await?;
    let cached = driver.flush_cache_writes().await;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
        if driver.cache().is_some() {
            println!(
                "cache: {} stored, {} vetoed, {} skipped, {} failed",
                cached.stored, cached.vetoed, cached.skipped, cached.failed
            );
        }
    }
    Ok(())
}

fn print_result(result: &CompositeResult) {
    if result.items.is_empty() {
        println!("No results.");
    }

    for (i, item) in result.items.iter().enumerate() {
        let title = item
            .attribute("title")
            .and_then(Value::as_str)
            .unwrap_or("(untitled)");
        println!("{}. [{}] {}", i + 1, item.source_id, title);
        println!("    id: {}", item.id);
    }
    println!();

    println!(
        "{:<20} {:<10} {:>8} {:>8} {:>10}  NOTES",
        "SOURCE", "STATE", "HITS", "ITEMS", "ELAPSED"
    );
    for tracker in result.sources.values() {
        println!(
            "{:<20} {:<10} {:>8} {:>8} {:>8}ms  {}",
            tracker.source_id(),
            tracker.state(),
            tracker.hit_count(),
            tracker.result_count(),
            tracker.elapsed_millis(),
            tracker.failure().unwrap_or("")
        );
    }
    println!();

    let failed = result
        .sources
        .values()
        .filter(|t| t.state() == TrackerState::Failed)
        .count();
    println!(
        "{} items, {} total hits, {} of {} sources failed (search {})",
        result.items.len(),
        result.total_hits,
        failed,
        result.sources.len(),
        result.search_id
    );
}
