//! # Catalog Federation Core
//!
//! Runtime-light logic for federated catalog search: item models,
//! fingerprinting, the cache policy chain, the result cache over an
//! abstract index backend, and the federation coordinator that merges
//! per-source result batches.
//!
//! This crate performs no network or filesystem I/O. Source clients, the
//! persistent index backend, and the driver that fans queries out live in
//! the application crate.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Items, retrieval contexts, result batches, cache entries |
//! | [`fingerprint`] | Deterministic cache-key derivation |
//! | [`policy`] | Ordered, vetoing cache policy stages |
//! | [`index`] | Index backend trait and in-memory backend |
//! | [`cache`] | Policy-gated, best-effort result cache |
//! | [`tracker`] | Per-source progress of one search |
//! | [`federation`] | Logical search lifecycle and result merging |

pub mod cache;
pub mod error;
pub mod federation;
pub mod fingerprint;
pub mod index;
pub mod models;
pub mod policy;
pub mod tracker;

pub use error::{FederationError, Result};
