//! Testing utilities for the delivery engine.
//!
//! This module provides:
//! - Fixed-time event and subscriber fixtures
//! - A scripted transport that records every call
//! - A harness wiring in-memory collaborators into an engine

mod fixtures;
mod mocks;

pub use fixtures::{
    base_time, digest_subscriber, instant_subscriber, minutes_after_base, sample_event,
    EngineHarness,
};
pub use mocks::{ScriptedTransport, SentMessage};
