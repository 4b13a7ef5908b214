//! Sliding-window rate limiting per channel and per recipient.

use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};

use crate::config::RateLimitConfig;
use crate::core::Channel;
use crate::utils::{saturating_add, saturating_sub, Timestamp};

/// Which window refused the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// The channel-wide window.
    Channel,
    /// The per-recipient window.
    Recipient,
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The call may go ahead and has been counted.
    Allowed,
    /// The call would exceed a window.
    Denied {
        /// Window that is full.
        scope: LimitScope,
        /// When the oldest call in that window expires.
        retry_at: Timestamp,
    },
}

impl RateLimitResult {
    /// Returns true if the call may go ahead.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Sliding-window log of recent transport calls.
///
/// Owned by the store so every engine sharing that store charges the same
/// windows. Limits come from the configuration snapshot of each call.
#[derive(Debug, Default)]
pub struct RateLimiter {
    channels: DashMap<Channel, VecDeque<Timestamp>>,
    recipients: DashMap<(Channel, String), VecDeque<Timestamp>>,
}

fn prune(log: &mut VecDeque<Timestamp>, window_start: Timestamp) {
    while log.front().is_some_and(|at| *at <= window_start) {
        log.pop_front();
    }
}

fn check_window(
    log: &VecDeque<Timestamp>,
    limit: u32,
    limits: &RateLimitConfig,
) -> Option<Timestamp> {
    if log.len() < limit as usize {
        return None;
    }
    let oldest_blocking = log.len() - limit as usize;
    log.get(oldest_blocking)
        .map(|at| saturating_add(*at, limits.window()))
}

impl RateLimiter {
    /// Creates an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks and, if allowed, records a call to `recipient` on `channel`.
    ///
    /// Both windows are checked before either is charged, so a denied call
    /// consumes nothing.
    pub fn check(
        &self,
        channel: Channel,
        recipient: &str,
        limits: &RateLimitConfig,
        now: Timestamp,
    ) -> RateLimitResult {
        let window_start = saturating_sub(now, limits.window());

        // Channel window first, then recipient window; always in this order.
        let mut channel_log = self.channels.entry(channel).or_default();
        prune(&mut channel_log, window_start);
        if let Some(retry_at) = check_window(&channel_log, limits.max_requests, limits) {
            return RateLimitResult::Denied {
                scope: LimitScope::Channel,
                retry_at,
            };
        }

        if let Some(per_recipient) = limits.per_recipient {
            let mut recipient_log = self
                .recipients
                .entry((channel, recipient.to_string()))
                .or_default();
            prune(&mut recipient_log, window_start);
            if let Some(retry_at) = check_window(&recipient_log, per_recipient, limits) {
                return RateLimitResult::Denied {
                    scope: LimitScope::Recipient,
                    retry_at,
                };
            }
            recipient_log.push_back(now);
        }

        channel_log.push_back(now);
        RateLimitResult::Allowed
    }

    /// Returns the number of calls in the channel window ending at `now`.
    #[must_use]
    pub fn in_window(&self, channel: Channel, limits: &RateLimitConfig, now: Timestamp) -> usize {
        let window_start = saturating_sub(now, limits.window());
        self.channels
            .get(&channel)
            .map_or(0, |log| log.iter().filter(|at| **at > window_start).count())
    }

    /// Prunes expired calls and drops windows with nothing left in them.
    ///
    /// Channels without a configured limit lose their windows entirely.
    /// Returns the number of recipient windows dropped.
    pub fn expire(&self, limits: &BTreeMap<Channel, RateLimitConfig>, now: Timestamp) -> usize {
        self.channels.retain(|channel, log| {
            match limits.get(channel) {
                Some(config) => prune(log, saturating_sub(now, config.window())),
                None => log.clear(),
            }
            !log.is_empty()
        });
        let before = self.recipients.len();
        self.recipients.retain(|(channel, _), log| {
            match limits.get(channel) {
                Some(config) => prune(log, saturating_sub(now, config.window())),
                None => log.clear(),
            }
            !log.is_empty()
        });
        before.saturating_sub(self.recipients.len())
    }

    /// Returns the number of recipients with a live window.
    #[must_use]
    pub fn tracked_recipients(&self) -> usize {
        self.recipients.len()
    }
}
