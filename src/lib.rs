//! # Catalog Federation
//!
//! Federated search across catalog sources, with a policy-gated cache of
//! retrieved items.
//!
//! The core logic (fingerprinting, policy chain, result cache, federation
//! coordinator) lives in [`catalog_federation_core`]. This crate supplies
//! what the core leaves abstract: configuration, source clients, the SQLite
//! index backend, the async fan-out driver, and the `fedq` CLI.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!   fedq search ─▶│ FederatedSearchDriver│
//!                 └───┬──────────────┬───┘
//!        spawn/source │              │ on_source_response
//!                     ▼              ▼
//!              ┌────────────┐  ┌───────────────────────┐
//!              │SourceClient│  │ FederationCoordinator │
//!              │ (catalog)  │  └──────────┬────────────┘
//!              └────────────┘             │ new items
//!                                         ▼
//!                           ┌───────────────────────────┐
//!                           │ ResultCache ─▶ PolicyChain │
//!                           │      └─▶ SqliteIndex       │
//!                           └───────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fedq init                          # create the cache database
//! fedq sources                       # check configured sources
//! fedq search "bathymetry"           # federated search, caches results
//! fedq cache query --attr source-id=local
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Cache schema |
//! | [`sqlite_index`] | SQLite index backend |
//! | [`sources`] | Source client trait and registry |
//! | [`source_catalog`] | JSON catalog-file source |
//! | [`policy_stages`] | Built-in cache policy stages |
//! | [`driver`] | Async fan-out with deadline and cache write-behind |
//! | [`search`] | `fedq search` output |
//! | [`cache_cmd`] | Cache construction and `fedq cache` commands |
//! | [`logging`] | Tracing subscriber setup |

pub mod cache_cmd;
pub mod config;
pub mod db;
pub mod driver;
pub mod logging;
pub mod migrate;
pub mod policy_stages;
pub mod search;
pub mod source_catalog;
pub mod sources;
pub mod sqlite_index;
