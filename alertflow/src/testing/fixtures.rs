//! Fixtures for engine tests and benchmarks.

use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::ScriptedTransport;
use crate::core::{AlertEvent, Channel, ChannelSettings, Subscriber};
use crate::directory::InMemorySubscriberDirectory;
use crate::engine::{AlertEngine, AlertEngineBuilder};
use crate::events::CollectingEventSink;
use crate::store::InMemoryStore;
use crate::utils::Timestamp;

/// Fixed reference time: 2024-03-01 10:00:00 UTC.
#[must_use]
pub fn base_time() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Returns [`base_time`] shifted by `minutes`.
#[must_use]
pub fn minutes_after_base(minutes: i64) -> Timestamp {
    base_time() + Duration::minutes(minutes)
}

/// An event created at `created_at` with a plain summary payload.
#[must_use]
pub fn sample_event(severity: u8, created_at: Timestamp) -> AlertEvent {
    AlertEvent::new("liquidity", "eu", severity)
        .with_created_at(created_at)
        .with_asset_tags(["ETH"])
        .with_payload(serde_json::json!({ "summary": "Pool depth dropped below threshold" }))
}

/// A pro-tier subscriber receiving instant alerts on `channel`.
#[must_use]
pub fn instant_subscriber(user_id: &str, channel: Channel, daily_quota: u32) -> Subscriber {
    Subscriber::new(user_id, "pro")
        .with_channel(channel, ChannelSettings::new(format!("{user_id}@{channel}"), daily_quota))
}

/// A pro-tier subscriber receiving digests on `channel`.
#[must_use]
pub fn digest_subscriber(user_id: &str, channel: Channel, window_minutes: u32) -> Subscriber {
    instant_subscriber(user_id, channel, 1_000).with_digest_window(window_minutes)
}

/// In-memory collaborators wired to a scripted transport per channel.
pub struct EngineHarness {
    /// The store.
    pub store: Arc<InMemoryStore>,
    /// The subscriber directory.
    pub directory: Arc<InMemorySubscriberDirectory>,
    /// Captured engine events.
    pub sink: Arc<CollectingEventSink>,
    transports: BTreeMap<Channel, Arc<ScriptedTransport>>,
}

impl EngineHarness {
    /// Creates a harness with an always-succeeding transport on every channel.
    #[must_use]
    pub fn new(subscribers: impl IntoIterator<Item = Subscriber>) -> Self {
        let transports = Channel::ALL
            .into_iter()
            .map(|c| (c, Arc::new(ScriptedTransport::new())))
            .collect();
        Self {
            store: Arc::new(InMemoryStore::new()),
            directory: Arc::new(InMemorySubscriberDirectory::with_subscribers(subscribers)),
            sink: Arc::new(CollectingEventSink::new()),
            transports,
        }
    }

    /// Replaces the transport for `channel`.
    #[must_use]
    pub fn with_transport(mut self, channel: Channel, transport: ScriptedTransport) -> Self {
        self.transports.insert(channel, Arc::new(transport));
        self
    }

    /// Removes the transport for `channel`.
    #[must_use]
    pub fn without_transport(mut self, channel: Channel) -> Self {
        self.transports.remove(&channel);
        self
    }

    /// Returns the scripted transport for `channel`.
    #[must_use]
    pub fn transport(&self, channel: Channel) -> Option<Arc<ScriptedTransport>> {
        self.transports.get(&channel).cloned()
    }

    /// Appends events to the intake log.
    pub fn publish(&self, events: impl IntoIterator<Item = AlertEvent>) {
        for event in events {
            self.store.append_event(event);
        }
    }

    /// Starts an engine builder over the harness collaborators.
    #[must_use]
    pub fn builder(&self) -> AlertEngineBuilder {
        let mut builder = AlertEngine::builder(self.store.clone(), self.directory.clone())
            .with_event_sink(self.sink.clone());
        for (channel, transport) in &self.transports {
            builder = builder.with_transport(*channel, transport.clone());
        }
        builder
    }

    /// Builds an engine over the harness collaborators.
    #[must_use]
    pub fn engine(&self) -> AlertEngine {
        self.builder().build()
    }
}
