//! Tracing subscriber setup for the `fedq` binary.
//!
//! Logs go to stderr so that `fedq search --json` output stays parseable.
//!
//! # Filter priority (highest to lowest)
//!
//! 1. `FEDQ_LOG` env var (e.g. `catalog_federation_core=debug,warn`)
//! 2. `RUST_LOG` env var
//! 3. `--log-level` flag
//! 4. `warn`

use anyhow::{anyhow, Result};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Project-specific filter variable, consulted before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "FEDQ_LOG";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = build_env_filter(log_level);
    let use_ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(use_ansi)
                .with_target(true)
                .without_time()
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {}", e))
}

fn build_env_filter(log_level: Option<&str>) -> EnvFilter {
    filter_from(
        std::env::var(LOG_ENV_VAR).ok().as_deref(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
        log_level,
    )
}

/// First parseable source wins; unparseable directives fall through to the
/// next one.
fn filter_from(fedq_log: Option<&str>, rust_log: Option<&str>, log_level: Option<&str>) -> EnvFilter {
    [fedq_log, rust_log, log_level]
        .into_iter()
        .flatten()
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_used_when_no_env() {
        assert_eq!(filter_from(None, None, Some("debug")).to_string(), "debug");
        assert_eq!(filter_from(None, None, None).to_string(), "warn");
    }

    #[test]
    fn test_fedq_log_beats_rust_log_and_flag() {
        let filter = filter_from(Some("trace"), Some("info"), Some("debug"));
        assert_eq!(filter.to_string(), "trace");

        let filter = filter_from(None, Some("info"), Some("debug"));
        assert_eq!(filter.to_string(), "info");
    }

    #[test]
    fn test_invalid_directives_fall_through() {
        let filter = filter_from(Some("catalog_federation=loud"), Some("info"), None);
        assert_eq!(filter.to_string(), "info");

        let filter = filter_from(None, None, Some("catalog_federation=loud"));
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_multi_directive_flag() {
        let rendered = filter_from(None, None, Some("catalog_federation=info,warn")).to_string();
        assert!(rendered.contains("catalog_federation=info"));
        assert!(rendered.contains("warn"));
    }
}
