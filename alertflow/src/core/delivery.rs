//! Deliveries and the per-unit send state machine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AlertEvent, Channel, DeliveryKind, DeliveryStatus};
use crate::errors::StoreError;
use crate::utils::{generate_id, TimeWindow, Timestamp};

/// Natural key enforcing one delivery per subscriber, event and channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryKey {
    /// Subscriber.
    pub user_id: String,
    /// Event.
    pub alert_event_id: Uuid,
    /// Channel.
    pub channel: Channel,
}

/// A single obligation to notify one subscriber about one event on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Delivery identifier.
    pub id: Uuid,
    /// Subscriber.
    pub user_id: String,
    /// Event being delivered.
    pub alert_event_id: Uuid,
    /// Creation time of the event, copied for window assignment.
    pub event_created_at: Timestamp,
    /// Target channel.
    pub channel: Channel,
    /// Instant or digest.
    pub delivery_kind: DeliveryKind,
    /// Current status.
    pub status: DeliveryStatus,
    /// Number of transport calls made so far.
    pub attempts: u32,
    /// Last error or skip reason.
    pub last_error: Option<String>,
    /// Earliest time Send may pick this delivery up again.
    pub next_retry_at: Option<Timestamp>,
    /// When the provider accepted the message.
    pub sent_at: Option<Timestamp>,
    /// Provider message identifier.
    pub provider_message_id: Option<String>,
    /// Digest window this delivery belongs to (digest kind only).
    pub window: Option<TimeWindow>,
    /// Digest this delivery was attached to.
    pub digest_id: Option<Uuid>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last modification time.
    pub updated_at: Timestamp,
}

impl Delivery {
    /// Creates a queued delivery for `event`.
    ///
    /// `digest_window_minutes` of zero produces an instant delivery; anything
    /// else assigns the wall-clock window containing the event timestamp.
    #[must_use]
    pub fn queued(
        user_id: impl Into<String>,
        event: &AlertEvent,
        channel: Channel,
        digest_window_minutes: u32,
        now: Timestamp,
    ) -> Self {
        let window = TimeWindow::containing(event.created_at, digest_window_minutes);
        let delivery_kind = if window.is_some() {
            DeliveryKind::Digest
        } else {
            DeliveryKind::Instant
        };
        Self {
            id: generate_id(),
            user_id: user_id.into(),
            alert_event_id: event.id,
            event_created_at: event.created_at,
            channel,
            delivery_kind,
            status: DeliveryStatus::Queued,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            sent_at: None,
            provider_message_id: None,
            window,
            digest_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the uniqueness key.
    #[must_use]
    pub fn key(&self) -> DeliveryKey {
        DeliveryKey {
            user_id: self.user_id.clone(),
            alert_event_id: self.alert_event_id,
            channel: self.channel,
        }
    }

    /// Returns true if Send may pick this delivery up at `now`.
    #[must_use]
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == DeliveryStatus::Queued && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Applies a send outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] unless the delivery is queued.
    pub fn apply(&mut self, outcome: &SendOutcome, now: Timestamp) -> Result<(), StoreError> {
        let next = outcome.status();
        if self.status != DeliveryStatus::Queued || !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        if outcome.counts_attempt() {
            self.attempts += 1;
        }
        match outcome {
            SendOutcome::Sent {
                provider_message_id,
            } => {
                self.sent_at = Some(now);
                self.next_retry_at = None;
                self.provider_message_id.clone_from(provider_message_id);
            }
            SendOutcome::RetryScheduled {
                error,
                next_retry_at,
            } => {
                self.last_error = Some(error.clone());
                self.next_retry_at = Some(*next_retry_at);
            }
            SendOutcome::Deferred {
                reason,
                next_retry_at,
            } => {
                self.last_error = Some(reason.clone());
                self.next_retry_at = Some(*next_retry_at);
            }
            SendOutcome::Failed { error } => {
                self.last_error = Some(error.clone());
                self.next_retry_at = None;
            }
            SendOutcome::Skipped { reason } => {
                self.last_error = Some(reason.clone());
                self.next_retry_at = None;
            }
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Moves a failed delivery back to the queue for an operator retry.
    ///
    /// A former digest member goes out on its own, since its digest is closed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] unless the delivery is failed.
    pub fn requeue(&mut self, now: Timestamp) -> Result<(), StoreError> {
        if self.status != DeliveryStatus::Failed {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: DeliveryStatus::Queued.to_string(),
            });
        }
        self.status = DeliveryStatus::Queued;
        if self.digest_id.is_some() {
            self.delivery_kind = DeliveryKind::Instant;
        }
        self.next_retry_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

/// What Send decided for a claimed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    /// Provider accepted the message.
    Sent {
        /// Provider message identifier.
        provider_message_id: Option<String>,
    },
    /// Transient failure; try again later.
    RetryScheduled {
        /// Provider error.
        error: String,
        /// When to try again.
        next_retry_at: Timestamp,
    },
    /// Not attempted because a rate limit window is full.
    Deferred {
        /// Which limit was hit.
        reason: String,
        /// When the window frees up.
        next_retry_at: Timestamp,
    },
    /// Permanent failure or retries exhausted.
    Failed {
        /// Provider error.
        error: String,
    },
    /// Not sent, for a recorded reason.
    Skipped {
        /// Why the unit was skipped.
        reason: String,
    },
}

impl SendOutcome {
    /// Returns the delivery status this outcome leads to.
    #[must_use]
    pub const fn status(&self) -> DeliveryStatus {
        match self {
            Self::Sent { .. } => DeliveryStatus::Sent,
            Self::RetryScheduled { .. } | Self::Deferred { .. } => DeliveryStatus::Queued,
            Self::Failed { .. } => DeliveryStatus::Failed,
            Self::Skipped { .. } => DeliveryStatus::Skipped,
        }
    }

    /// Returns true if the outcome followed a transport call.
    #[must_use]
    pub const fn counts_attempt(&self) -> bool {
        matches!(
            self,
            Self::Sent { .. } | Self::RetryScheduled { .. } | Self::Failed { .. }
        )
    }

    /// Short label used in logs and events.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::Deferred { .. } => "deferred",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}
