//! Digest batches.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Channel, DigestStatus, SendOutcome};
use crate::errors::StoreError;
use crate::utils::{generate_id, natural_key, TimeWindow, Timestamp};

/// Derives the idempotency key for a digest.
#[must_use]
pub fn digest_key(user_id: &str, channel: Channel, window_start: Timestamp) -> String {
    let start = window_start.timestamp().to_string();
    natural_key("digest", &[user_id, channel.as_str(), &start])
}

/// A batch of digest-kind deliveries sent as one transport call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    /// Digest identifier.
    pub id: Uuid,
    /// Subscriber.
    pub user_id: String,
    /// Target channel.
    pub channel: Channel,
    /// Natural key over user, channel and window start.
    pub digest_key: String,
    /// Current status.
    pub status: DigestStatus,
    /// Window start (inclusive).
    pub window_start: Timestamp,
    /// Window end (exclusive).
    pub window_end: Timestamp,
    /// Number of member deliveries.
    pub event_count: u32,
    /// Member delivery ids.
    pub member_ids: Vec<Uuid>,
    /// Number of transport calls made so far.
    pub attempts: u32,
    /// Last error.
    pub last_error: Option<String>,
    /// Earliest time Send may pick this digest up again.
    pub next_retry_at: Option<Timestamp>,
    /// When the provider accepted the digest.
    pub sent_at: Option<Timestamp>,
    /// Provider message identifier.
    pub provider_message_id: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
}

impl Digest {
    /// Creates an empty pending digest for a closed window.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        channel: Channel,
        window: TimeWindow,
        now: Timestamp,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            id: generate_id(),
            digest_key: digest_key(&user_id, channel, window.start),
            user_id,
            channel,
            status: DigestStatus::Pending,
            window_start: window.start,
            window_end: window.end,
            event_count: 0,
            member_ids: Vec::new(),
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            sent_at: None,
            provider_message_id: None,
            created_at: now,
        }
    }

    /// Returns true if Send may pick this digest up at `now`.
    #[must_use]
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == DigestStatus::Pending
            && self.window_end <= now
            && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Applies a send outcome.
    ///
    /// Skips have no digest status of their own and are recorded as failures;
    /// the member deliveries carry the skip.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidTransition`] unless the digest is pending.
    pub fn apply(&mut self, outcome: &SendOutcome, now: Timestamp) -> Result<(), StoreError> {
        let next = match outcome {
            SendOutcome::Sent { .. } => DigestStatus::Sent,
            SendOutcome::RetryScheduled { .. } | SendOutcome::Deferred { .. } => {
                DigestStatus::Pending
            }
            SendOutcome::Failed { .. } | SendOutcome::Skipped { .. } => DigestStatus::Failed,
        };
        if self.status != DigestStatus::Pending {
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
                error: message,
                next_retry_at,
            }
            | SendOutcome::Deferred {
                reason: message,
                next_retry_at,
            } => {
                self.last_error = Some(message.clone());
                self.next_retry_at = Some(*next_retry_at);
            }
            SendOutcome::Failed { error: message } | SendOutcome::Skipped { reason: message } => {
                self.last_error = Some(message.clone());
                self.next_retry_at = None;
            }
        }
        self.status = next;
        Ok(())
    }
}
