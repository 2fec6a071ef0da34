//! Per-source progress of one logical search.

use serde::Serialize;

use crate::error::{FederationError, Result};

/// Lifecycle state of a [`SourceQueryTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Pending,
    Succeeded,
    Failed,
}

impl TrackerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerState::Pending => "pending",
            TrackerState::Succeeded => "succeeded",
            TrackerState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one (logical search, source) pair.
///
/// Starts [`Pending`](TrackerState::Pending) and moves to a terminal state
/// exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceQueryTracker {
    source_id: String,
    state: TrackerState,
    hit_count: u64,
    elapsed_millis: u64,
    result_count: u64,
    failure: Option<String>,
}

impl SourceQueryTracker {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            state: TrackerState::Pending,
            hit_count: 0,
            elapsed_millis: 0,
            result_count: 0,
            failure: None,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed_millis
    }

    /// Items attributed to this source in the composite result.
    pub fn result_count(&self) -> u64 {
        self.result_count
    }

    /// Failure reason, present only in the `Failed` state.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state != TrackerState::Pending
    }

    /// Transition `Pending → Succeeded`.
    ///
    /// # Errors
    ///
    /// [`FederationError::InvalidState`] if the tracker is already terminal.
    pub fn record_success(&mut self, hit_count: u64, elapsed_millis: u64) -> Result<()> {
        self.ensure_pending("record success")?;
        self.state = TrackerState::Succeeded;
        self.hit_count = hit_count;
        self.elapsed_millis = elapsed_millis;
        Ok(())
    }

    /// Transition `Pending → Failed`.
    ///
    /// # Errors
    ///
    /// [`FederationError::InvalidState`] if the tracker is already terminal.
    pub fn record_failure(&mut self, elapsed_millis: u64, reason: impl Into<String>) -> Result<()> {
        self.ensure_pending("record failure")?;
        self.state = TrackerState::Failed;
        self.elapsed_millis = elapsed_millis;
        self.failure = Some(reason.into());
        Ok(())
    }

    pub(crate) fn add_results(&mut self, count: u64) {
        self.result_count += count;
    }

    fn ensure_pending(&self, action: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(FederationError::InvalidState(format!(
                "cannot {} for source '{}': tracker already {}",
                action, self.source_id, self.state
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tracker_is_pending_with_zero_counts() {
        let t = SourceQueryTracker::new("s1");
        assert_eq!(t.state(), TrackerState::Pending);
        assert!(!t.is_terminal());
        assert_eq!(t.hit_count(), 0);
        assert_eq!(t.elapsed_millis(), 0);
        assert_eq!(t.result_count(), 0);
    }

    #[test]
    fn test_success_sets_counts() {
        let mut t = SourceQueryTracker::new("s1");
        t.record_success(42, 17).unwrap();
        assert_eq!(t.state(), TrackerState::Succeeded);
        assert!(t.is_terminal());
        assert_eq!(t.hit_count(), 42);
        assert_eq!(t.elapsed_millis(), 17);
    }

    #[test]
    fn test_double_success_is_invalid_state() {
        let mut t = SourceQueryTracker::new("s1");
        t.record_success(1, 1).unwrap();
        let err = t.record_success(2, 2).unwrap_err();
        assert!(matches!(err, FederationError::InvalidState(_)));
        assert_eq!(t.hit_count(), 1);
    }

    #[test]
    fn test_success_after_failure_is_invalid_state() {
        let mut t = SourceQueryTracker::new("s1");
        t.record_failure(5, "timeout").unwrap();
        assert!(t.record_success(1, 1).is_err());
        assert!(t.record_failure(9, "again").is_err());
        assert_eq!(t.state(), TrackerState::Failed);
        assert_eq!(t.failure(), Some("timeout"));
        assert_eq!(t.elapsed_millis(), 5);
    }
}
