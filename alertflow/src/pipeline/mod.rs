//! The three engine stages and the machinery they share.
//!
//! - [`FanoutStage`]: events to deliveries, with eligibility and quota
//! - [`AggregateStage`]: closed-window digest deliveries to digests
//! - [`SendStage`]: claim, transport, classify, record
//!
//! Stages communicate only through the store.

mod aggregate;
mod circuit;
mod context;
mod fanout;
mod locking;
mod rate_limit;
mod retry;
mod send;

#[cfg(test)]
mod integration_tests;

pub use aggregate::AggregateStage;
pub use circuit::PassBreaker;
pub use context::{StageContext, StopReason};
pub use fanout::FanoutStage;
pub use locking::{ClaimGuard, ClaimKind, StageLockGuard};
pub use rate_limit::{LimitScope, RateLimitResult, RateLimiter};
pub use retry::{RetryDecision, RetryPolicy};
pub use send::{
    SendStage, SKIP_CHANNEL_DISABLED, SKIP_EVENT_MISSING, SKIP_NO_RECIPIENT,
    SKIP_SUBSCRIBER_MISSING,
};
