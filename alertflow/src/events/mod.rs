//! Engine events for observability.
//!
//! Every stage emits a typed [`EngineEvent`] stream through an [`EventSink`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Channel, Phase, RunStatus, StageStats};
use crate::utils::Timestamp;

/// Something worth telling an operator about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A stage acquired its lock and began work.
    StageStarted {
        /// Run identifier.
        run_id: Uuid,
        /// Stage.
        phase: Phase,
    },
    /// A stage finished.
    StageCompleted {
        /// Run identifier.
        run_id: Uuid,
        /// Stage.
        phase: Phase,
        /// Outcome.
        status: RunStatus,
        /// Counters.
        stats: StageStats,
    },
    /// A kill-switch turned the stage into a no-op.
    StageDisabled {
        /// Run identifier.
        run_id: Uuid,
        /// Stage.
        phase: Phase,
        /// Which switch.
        reason: String,
    },
    /// A delivery or digest was accepted by its provider.
    DeliverySent {
        /// Delivery or digest id.
        unit_id: Uuid,
        /// Subscriber.
        user_id: String,
        /// Channel.
        channel: Channel,
        /// Transport calls made, including this one.
        attempts: u32,
    },
    /// A transient failure was rescheduled.
    DeliveryRetryScheduled {
        /// Delivery or digest id.
        unit_id: Uuid,
        /// Transport calls made so far.
        attempts: u32,
        /// When the unit becomes due again.
        next_retry_at: Timestamp,
        /// Provider error.
        error: String,
    },
    /// A rate limit pushed the unit back without a transport call.
    DeliveryDeferred {
        /// Delivery or digest id.
        unit_id: Uuid,
        /// When the unit becomes due again.
        next_retry_at: Timestamp,
    },
    /// A unit failed terminally.
    DeliveryFailed {
        /// Delivery or digest id.
        unit_id: Uuid,
        /// Subscriber.
        user_id: String,
        /// Transport calls made.
        attempts: u32,
        /// Last error.
        error: String,
    },
    /// A unit was skipped with a reason.
    DeliverySkipped {
        /// Delivery or digest id.
        unit_id: Uuid,
        /// Subscriber.
        user_id: String,
        /// Why.
        reason: String,
    },
    /// Aggregation created a digest.
    DigestCreated {
        /// Digest id.
        digest_id: Uuid,
        /// Subscriber.
        user_id: String,
        /// Channel.
        channel: Channel,
        /// Members attached so far.
        event_count: u32,
    },
    /// A digest was accepted by its provider.
    DigestSent {
        /// Digest id.
        digest_id: Uuid,
        /// Members delivered.
        event_count: u32,
    },
    /// The send pass hit its ceiling.
    CircuitTripped {
        /// Run identifier.
        run_id: Uuid,
        /// Configured ceiling.
        ceiling: u32,
    },
}

impl EngineEvent {
    /// Dotted event name, e.g. `stage.started`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } => "stage.started",
            Self::StageCompleted { .. } => "stage.completed",
            Self::StageDisabled { .. } => "stage.disabled",
            Self::DeliverySent { .. } => "delivery.sent",
            Self::DeliveryRetryScheduled { .. } => "delivery.retry_scheduled",
            Self::DeliveryDeferred { .. } => "delivery.deferred",
            Self::DeliveryFailed { .. } => "delivery.failed",
            Self::DeliverySkipped { .. } => "delivery.skipped",
            Self::DigestCreated { .. } => "digest.created",
            Self::DigestSent { .. } => "digest.sent",
            Self::CircuitTripped { .. } => "circuit.tripped",
        }
    }
}
