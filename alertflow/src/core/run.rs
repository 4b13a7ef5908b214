//! Stage run records and per-pass statistics.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Phase, RunStatus};
use crate::utils::{generate_id, Timestamp};

/// Counters collected during one stage invocation.
///
/// Each stage fills in the counters relevant to it and leaves the rest at zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    /// Events read from the intake log.
    pub events_scanned: u64,
    /// Events rejected as malformed.
    pub events_malformed: u64,
    /// Subscribers skipped because their plan tier is unknown.
    pub subscribers_invalid: u64,
    /// Deliveries inserted.
    pub deliveries_created: u64,
    /// Inserts that hit the uniqueness constraint.
    pub duplicates: u64,
    /// Inserts refused because the daily quota was spent.
    pub quota_exhausted: u64,
    /// Digests created.
    pub digests_created: u64,
    /// Deliveries attached to a digest.
    pub deliveries_attached: u64,
    /// Digest members whose digest had already closed.
    pub late_dispatched: u64,
    /// Units claimed by Send.
    pub claimed: u64,
    /// Units accepted by the provider.
    pub sent: u64,
    /// Units rescheduled after a transient failure.
    pub retried: u64,
    /// Units pushed back by a rate limit.
    pub deferred: u64,
    /// Units that failed terminally.
    pub failed: u64,
    /// Units skipped with a reason.
    pub skipped: u64,
    /// Units released without an outcome because the store errored.
    pub errors: u64,
    /// The per-pass send ceiling was reached.
    pub circuit_tripped: bool,
    /// The stage deadline or cancellation cut the pass short.
    pub deadline_hit: bool,
}

impl StageStats {
    /// Returns true if the pass stopped before draining its selection.
    #[must_use]
    pub const fn stopped_early(&self) -> bool {
        self.circuit_tripped || self.deadline_hit
    }
}

/// Audit record for one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRun {
    /// Run identifier.
    pub id: Uuid,
    /// Stage.
    pub phase: Phase,
    /// Start time.
    pub started_at: Timestamp,
    /// End time.
    pub completed_at: Option<Timestamp>,
    /// Outcome.
    pub status: RunStatus,
    /// Counters.
    pub stats: StageStats,
    /// Error that stopped the stage, if any.
    pub error: Option<String>,
}

impl EngineRun {
    /// Opens a run record.
    #[must_use]
    pub fn start(phase: Phase, started_at: Timestamp) -> Self {
        Self {
            id: generate_id(),
            phase,
            started_at,
            completed_at: None,
            status: RunStatus::Completed,
            stats: StageStats::default(),
            error: None,
        }
    }

    /// Closes the run record.
    #[must_use]
    pub fn finish(mut self, status: RunStatus, stats: StageStats, completed_at: Timestamp) -> Self {
        self.status = status;
        self.stats = stats;
        self.completed_at = Some(completed_at);
        self
    }

    /// Attaches the error that stopped the stage.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Structured result returned by every stage entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// Run identifier, matching the persisted [`EngineRun`].
    pub run_id: Uuid,
    /// Stage.
    pub phase: Phase,
    /// Outcome.
    pub status: RunStatus,
    /// Counters.
    pub stats: StageStats,
    /// Human-readable reason for a disabled or partial run.
    pub reason: Option<String>,
}

impl StageReport {
    /// Builds a report from a closed run record.
    #[must_use]
    pub fn from_run(run: &EngineRun, reason: Option<String>) -> Self {
        Self {
            run_id: run.id,
            phase: run.phase,
            status: run.status,
            stats: run.stats.clone(),
            reason,
        }
    }

    /// Returns true if a kill-switch turned the stage into a no-op.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.status == RunStatus::Disabled
    }
}
