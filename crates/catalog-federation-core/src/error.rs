//! Error taxonomy for the federation core.
//!
//! Only failures a caller must act on are represented here. Best-effort
//! cache writes and per-source faults never surface as errors: the former
//! are logged at the [`ResultCache`](crate::cache::ResultCache) boundary,
//! the latter become terminal tracker states.

/// Errors surfaced by the federation core.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    /// Malformed input to a pure function (e.g. fingerprinting an item with
    /// an empty id). Never retried internally.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A tracker or search state machine was driven out of order, such as
    /// recording success twice for the same source.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The index backend failed while serving a cache query.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The index backend cannot evaluate the supplied query criteria.
    #[error("unsupported cache query: {0}")]
    UnsupportedQuery(String),
}

/// Convenience alias used across the core crate.
pub type Result<T> = std::result::Result<T, FederationError>;
