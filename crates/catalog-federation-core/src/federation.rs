//! Federated search coordination.
//!
//! A [`FederationCoordinator`] owns the lifecycle of each [`LogicalSearch`]
//! it starts: one [`SourceQueryTracker`] per expected source, a composite
//! result that only grows, and a `finished` flag that flips once, when the
//! last tracker turns terminal.
//!
//! The coordinator never talks to sources itself. An external driver calls
//! [`FederationCoordinator::on_source_response`] as each source answers,
//! possibly from many threads at once and possibly more than once per
//! source. All mutable search state sits behind a single mutex per search,
//! so the terminal check, the merge, and the tracker transition happen as
//! one step; unrelated searches never contend.
//!
//! ```text
//!   start_search ──▶ trackers {s1: Pending, s2: Pending}
//!        │
//!   on_source_response(s1, Batch) ──▶ merge + s1: Succeeded
//!   on_source_response(s2, Fault) ──▶ s2: Failed ──▶ finished
//!   on_source_response(s1, Batch) ──▶ ignored (already terminal)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FederationError, Result};
use crate::models::{Item, SourceFault, SourceResponse};
use crate::tracker::{SourceQueryTracker, TrackerState};

/// One federated query in flight.
///
/// Shared through an `Arc`; once every handle is dropped the search is
/// abandoned and late responses have nowhere to land.
pub struct LogicalSearch {
    id: Uuid,
    query: String,
    expected_source_ids: BTreeSet<String>,
    created_at: DateTime<Utc>,
    finished: AtomicBool,
    state: Mutex<SearchState>,
}

struct SearchState {
    trackers: BTreeMap<String, SourceQueryTracker>,
    items: Vec<Item>,
    seen: HashSet<(String, String)>,
    total_hits: u64,
    finished: bool,
}

impl LogicalSearch {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn expected_source_ids(&self) -> &BTreeSet<String> {
        &self.expected_source_ids
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True once every tracker is terminal. Never reverts.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Copy of the tracker for `source_id`, if it is an expected source.
    pub fn tracker(&self, source_id: &str) -> Option<SourceQueryTracker> {
        self.lock().trackers.get(source_id).cloned()
    }

    /// Sources that have not answered yet.
    pub fn pending_sources(&self) -> Vec<String> {
        self.lock()
            .trackers
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.source_id().to_string())
            .collect()
    }

    fn elapsed_millis(&self) -> u64 {
        (Utc::now() - self.created_at).num_milliseconds().max(0) as u64
    }

    fn lock(&self) -> MutexGuard<'_, SearchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LogicalSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalSearch")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("expected_source_ids", &self.expected_source_ids)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Why a response did not change the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The source id is not one the search expects.
    UnknownSource,
    /// The source's tracker is already terminal (duplicate or late delivery).
    AlreadyTerminal,
}

/// Effect of one [`FederationCoordinator::on_source_response`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Ignored(IgnoreReason),
    /// The batch was accepted; `new_items` are the items it added to the
    /// composite result after deduplication.
    Merged { new_items: Vec<Item> },
    /// The fault was recorded against the source.
    Failed,
}

/// Read-only view of a search at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct CompositeResult {
    pub search_id: Uuid,
    pub query: String,
    pub items: Vec<Item>,
    pub total_hits: u64,
    pub sources: BTreeMap<String, SourceQueryTracker>,
    pub finished: bool,
    pub successful: bool,
}

impl CompositeResult {
    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .values()
            .filter(|t| t.state() == TrackerState::Failed)
            .map(|t| t.source_id())
            .collect()
    }
}

/// Cumulative per-source counters across every search a coordinator ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceMetrics {
    pub queries: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_hits: u64,
    pub total_results: u64,
    pub total_elapsed_millis: u64,
}

impl SourceMetrics {
    /// Mean latency over answered queries.
    pub fn average_elapsed_millis(&self) -> Option<f64> {
        let answered = self.successes + self.failures;
        (answered > 0).then(|| self.total_elapsed_millis as f64 / answered as f64)
    }
}

#[derive(Default)]
struct SourceCounters {
    queries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    hits: AtomicU64,
    results: AtomicU64,
    elapsed_millis: AtomicU64,
}

impl SourceCounters {
    fn snapshot(&self) -> SourceMetrics {
        SourceMetrics {
            queries: self.queries.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_hits: self.hits.load(Ordering::Relaxed),
            total_results: self.results.load(Ordering::Relaxed),
            total_elapsed_millis: self.elapsed_millis.load(Ordering::Relaxed),
        }
    }
}

/// Owns logical searches and the per-source metrics they feed.
#[derive(Default)]
pub struct FederationCoordinator {
    metrics: RwLock<HashMap<String, Arc<SourceCounters>>>,
}

impl FederationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a logical search over `source_ids`.
    ///
    /// Duplicate ids collapse to one tracker.
    ///
    /// # Errors
    ///
    /// [`FederationError::InvalidArgument`] when `source_ids` is empty or
    /// contains a blank id.
    pub fn start_search<I, S>(
        &self,
        query: impl Into<String>,
        source_ids: I,
    ) -> Result<Arc<LogicalSearch>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expected: BTreeSet<String> = source_ids.into_iter().map(Into::into).collect();
        if expected.is_empty() {
            return Err(FederationError::InvalidArgument(
                "a search needs at least one source".to_string(),
            ));
        }
        if expected.iter().any(|id| id.trim().is_empty()) {
            return Err(FederationError::InvalidArgument(
                "source ids must not be blank".to_string(),
            ));
        }

        let trackers = expected
            .iter()
            .map(|id| (id.clone(), SourceQueryTracker::new(id.clone())))
            .collect();
        for id in &expected {
            self.counters(id).queries.fetch_add(1, Ordering::Relaxed);
        }

        let search = Arc::new(LogicalSearch {
            id: Uuid::new_v4(),
            query: query.into(),
            expected_source_ids: expected,
            created_at: Utc::now(),
            finished: AtomicBool::new(false),
            state: Mutex::new(SearchState {
                trackers,
                items: Vec::new(),
                seen: HashSet::new(),
                total_hits: 0,
                finished: false,
            }),
        });

        debug!(
            search_id = %search.id,
            sources = search.expected_source_ids.len(),
            "search started"
        );
        Ok(search)
    }

    /// Deliver one source's answer to `search`.
    ///
    /// Unknown sources and sources whose tracker is already terminal are
    /// ignored, which makes redelivery harmless. A batch is merged with
    /// duplicates of `(source_id, item.id)` dropped, its hit count is added
    /// to the running total, and the tracker succeeds; a fault fails the
    /// tracker. Merged items are attributed to the responding source, so
    /// an item's `source_id` always agrees with the key it was deduplicated
    /// under.
    pub fn on_source_response(
        &self,
        search: &LogicalSearch,
        source_id: &str,
        response: SourceResponse,
    ) -> Result<ResponseOutcome> {
        if !search.expected_source_ids.contains(source_id) {
            debug!(search_id = %search.id, source_id, "ignoring response from unexpected source");
            return Ok(ResponseOutcome::Ignored(IgnoreReason::UnknownSource));
        }

        let mut state = search.lock();
        let outcome = self.apply_locked(search, &mut state, source_id, response)?;
        self.refresh_finished(search, &mut state);
        Ok(outcome)
    }

    /// Fail every still-pending source with `reason`, returning how many
    /// were failed. Used by drivers when a deadline expires.
    pub fn fail_pending(&self, search: &LogicalSearch, reason: &str) -> Result<usize> {
        let elapsed = search.elapsed_millis();
        let mut state = search.lock();
        let pending: Vec<String> = state
            .trackers
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.source_id().to_string())
            .collect();

        for source_id in &pending {
            let fault = SourceResponse::Fault(SourceFault::new(reason, elapsed));
            self.apply_locked(search, &mut state, source_id, fault)?;
        }
        self.refresh_finished(search, &mut state);
        Ok(pending.len())
    }

    /// True when no source failed and at least one succeeded.
    pub fn is_successful(&self, search: &LogicalSearch) -> bool {
        Self::successful(&search.lock())
    }

    /// Copy of the search's current composite state. Never waits for the
    /// search to finish.
    pub fn snapshot(&self, search: &LogicalSearch) -> CompositeResult {
        let state = search.lock();
        CompositeResult {
            search_id: search.id,
            query: search.query.clone(),
            items: state.items.clone(),
            total_hits: state.total_hits,
            sources: state.trackers.clone(),
            finished: state.finished,
            successful: Self::successful(&state),
        }
    }

    /// Cumulative metrics for every source this coordinator has queried.
    pub fn source_metrics(&self) -> BTreeMap<String, SourceMetrics> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, c)| (id.clone(), c.snapshot()))
            .collect()
    }

    fn apply_locked(
        &self,
        search: &LogicalSearch,
        state: &mut SearchState,
        source_id: &str,
        response: SourceResponse,
    ) -> Result<ResponseOutcome> {
        match state.trackers.get(source_id) {
            Some(t) if t.is_terminal() => {
                debug!(search_id = %search.id, source_id, "ignoring duplicate response");
                return Ok(ResponseOutcome::Ignored(IgnoreReason::AlreadyTerminal));
            }
            Some(_) => {}
            None => return Ok(ResponseOutcome::Ignored(IgnoreReason::UnknownSource)),
        }

        let counters = self.counters(source_id);
        match response {
            SourceResponse::Batch(batch) => {
                let mut new_items = Vec::new();
                for item in batch.items {
                    if item.id.trim().is_empty() {
                        debug!(search_id = %search.id, source_id, "dropping item without id");
                        continue;
                    }
                    if state.seen.insert((source_id.to_string(), item.id.clone())) {
                        let item = if item.source_id != source_id {
                            item.with_source_id(source_id)
                        } else {
                            item
                        };
                        new_items.push(item);
                    }
                }

                let tracker = state.trackers.get_mut(source_id).ok_or_else(|| {
                    FederationError::InvalidState(format!("tracker for '{}' vanished", source_id))
                })?;
                tracker.record_success(batch.hit_count, batch.elapsed_millis)?;
                tracker.add_results(new_items.len() as u64);
                state.items.extend(new_items.iter().cloned());
                state.total_hits = state.total_hits.saturating_add(batch.hit_count);

                counters.successes.fetch_add(1, Ordering::Relaxed);
                counters.hits.fetch_add(batch.hit_count, Ordering::Relaxed);
                counters
                    .results
                    .fetch_add(new_items.len() as u64, Ordering::Relaxed);
                counters
                    .elapsed_millis
                    .fetch_add(batch.elapsed_millis, Ordering::Relaxed);

                debug!(
                    search_id = %search.id,
                    source_id,
                    hits = batch.hit_count,
                    merged = new_items.len(),
                    elapsed_ms = batch.elapsed_millis,
                    "source responded"
                );
                Ok(ResponseOutcome::Merged { new_items })
            }
            SourceResponse::Fault(fault) => {
                let tracker = state.trackers.get_mut(source_id).ok_or_else(|| {
                    FederationError::InvalidState(format!("tracker for '{}' vanished", source_id))
                })?;
                tracker.record_failure(fault.elapsed_millis, fault.message.clone())?;

                counters.failures.fetch_add(1, Ordering::Relaxed);
                counters
                    .elapsed_millis
                    .fetch_add(fault.elapsed_millis, Ordering::Relaxed);

                info!(
                    search_id = %search.id,
                    source_id,
                    elapsed_ms = fault.elapsed_millis,
                    reason = %fault.message,
                    "source failed"
                );
                Ok(ResponseOutcome::Failed)
            }
        }
    }

    fn refresh_finished(&self, search: &LogicalSearch, state: &mut SearchState) {
        if state.finished || !state.trackers.values().all(|t| t.is_terminal()) {
            return;
        }
        state.finished = true;
        search.finished.store(true, Ordering::Release);
        info!(
            search_id = %search.id,
            total_hits = state.total_hits,
            items = state.items.len(),
            successful = Self::successful(state),
            elapsed_ms = search.elapsed_millis(),
            "search finished"
        );
    }

    fn successful(state: &SearchState) -> bool {
        let mut any_succeeded = false;
        for tracker in state.trackers.values() {
            match tracker.state() {
                TrackerState::Failed => return false,
                TrackerState::Succeeded => any_succeeded = true,
                TrackerState::Pending => {}
            }
        }
        any_succeeded
    }

    fn counters(&self, source_id: &str) -> Arc<SourceCounters> {
        if let Some(c) = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
        {
            return c.clone();
        }
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(source_id.to_string())
            .or_default()
            .clone()
    }
}
