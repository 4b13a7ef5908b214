//! # Alertflow
//!
//! An alert delivery engine that turns a stream of risk events into
//! per-subscriber notifications.
//!
//! The engine runs three stages that talk only through a durable store:
//!
//! - **Fanout**: match new events against subscriber preferences, plan-tier
//!   entitlements and daily quotas, writing one delivery per subscriber,
//!   event and channel
//! - **Aggregate**: batch digest deliveries into one digest per subscriber,
//!   channel and closed time window
//! - **Send**: claim due units, call channel transports, and record the outcome
//!   with exponential backoff for transient failures
//!
//! Every stage can run concurrently with itself on several workers without
//! sending anything twice. Kill-switches, a per-pass circuit breaker and
//! channel rate limits bound what a single pass may do.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use alertflow::prelude::*;
//!
//! let engine = AlertEngine::builder(store, directory)
//!     .with_transport(Channel::Email, Arc::new(SmtpTransport::new(settings)))
//!     .with_event_sink(Arc::new(LoggingEventSink::info()))
//!     .build();
//!
//! let config = EngineConfig::from_env()?;
//! let cycle = engine.run_cycle(&config, now_utc()).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod directory;
pub mod engine;
pub mod errors;
pub mod events;
pub mod health;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod transport;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        EngineConfig, KillSwitches, QuotaResetPolicy, RateLimitConfig, RetryConfig, TierPolicy,
    };
    pub use crate::core::{
        AlertEvent, Channel, ChannelSettings, Delivery, DeliveryKind, DeliveryStatus, Digest,
        DigestStatus, EngineRun, Phase, RunStatus, SendOutcome, StageReport, StageStats,
        Subscriber,
    };
    pub use crate::directory::{InMemorySubscriberDirectory, SubscriberDirectory};
    pub use crate::engine::{AlertEngine, AlertEngineBuilder, CycleReport};
    pub use crate::errors::{
        ConfigError, EngineError, FailureClass, StoreError, TransportError, TransportErrorKind,
    };
    pub use crate::events::{
        CollectingEventSink, EngineEvent, EventSink, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::health::{HealthReport, PreflightReport};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::scheduler::Scheduler;
    pub use crate::store::{DeliveryStore, InMemoryStore};
    pub use crate::transport::{
        MessageRenderer, PlainRenderer, ProviderReceipt, Transport, TransportRegistry,
    };
    pub use crate::utils::{now_utc, Timestamp};
}
