//! Core domain model for the delivery engine.
//!
//! This module contains the records the pipeline reads and writes:
//! - Alert events and the intake cursor
//! - Subscribers and their channel settings
//! - Deliveries, digests and the send state machine
//! - Stage run records and statistics

mod delivery;
mod digest;
mod event;
mod run;
mod status;
mod subscriber;

pub use delivery::{Delivery, DeliveryKey, SendOutcome};
pub use digest::{digest_key, Digest};
pub use event::{AlertEvent, EventCursor, MAX_SEVERITY};
pub use run::{EngineRun, StageReport, StageStats};
pub use status::{Channel, DeliveryKind, DeliveryStatus, DigestStatus, Phase, RunStatus};
pub use subscriber::{ChannelSettings, Subscriber};
