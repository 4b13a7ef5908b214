//! Channel, status and phase enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A delivery channel.
///
/// The set is closed; each channel maps to exactly one transport adapter in
/// the [`TransportRegistry`](crate::transport::TransportRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// One-to-one direct message.
    DirectMessage,
    /// Post to a workspace channel the subscriber is a member of.
    ChannelMember,
    /// Email.
    Email,
}

impl Channel {
    /// All channels, in a stable order.
    pub const ALL: [Self; 3] = [Self::DirectMessage, Self::ChannelMember, Self::Email];

    /// Returns the wire name of the channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DirectMessage => "direct_message",
            Self::ChannelMember => "channel_member",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a delivery is sent on its own or batched into a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    /// Sent as soon as Send picks it up.
    #[default]
    Instant,
    /// Held until its window closes, then sent inside a digest.
    Digest,
}

impl fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instant => write!(f, "instant"),
            Self::Digest => write!(f, "digest"),
        }
    }
}

/// Lifecycle status of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting to be sent (possibly after a retry delay).
    #[default]
    Queued,
    /// Accepted by the provider.
    Sent,
    /// Permanently failed or out of retries.
    Failed,
    /// Not sent, with a recorded reason.
    Skipped,
}

impl DeliveryStatus {
    /// Returns true if no further transition is allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Skipped)
    }

    /// Returns true if the state machine permits moving to `next`.
    ///
    /// `queued` may move anywhere; `failed` may only be requeued; `sent` and
    /// `skipped` never move.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Queued => true,
            Self::Failed => matches!(next, Self::Queued),
            Self::Sent | Self::Skipped => false,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Lifecycle status of a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestStatus {
    /// Waiting for Send.
    #[default]
    Pending,
    /// Accepted by the provider.
    Sent,
    /// Permanently failed or out of retries.
    Failed,
}

impl fmt::Display for DigestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A pipeline stage owned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Event → delivery expansion.
    Fanout,
    /// Digest window aggregation.
    Aggregate,
    /// Transport and retry.
    Send,
}

impl Phase {
    /// All phases in pipeline order.
    pub const ALL: [Self; 3] = [Self::Fanout, Self::Aggregate, Self::Send];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fanout => write!(f, "fanout"),
            Self::Aggregate => write!(f, "aggregate"),
            Self::Send => write!(f, "send"),
        }
    }
}

/// Outcome of a single stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Stage processed everything it selected.
    Completed,
    /// Stage stopped early (deadline, cancellation or circuit breaker).
    Partial,
    /// Stage was switched off by a kill-switch.
    Disabled,
    /// Stage could not run.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Disabled => write!(f, "disabled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
