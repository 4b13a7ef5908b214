//! Channel transport adapters.
//!
//! Each channel has exactly one adapter. The engine only sees the
//! success / classified error / message id contract; how an adapter talks to
//! its provider is its own business.

mod render;

pub use render::{MessageRenderer, PlainRenderer, RenderedMessage};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::Channel;
use crate::errors::TransportError;

/// What a provider returns on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReceipt {
    /// Provider-side message identifier, if the provider issues one.
    pub provider_message_id: Option<String>,
}

impl ProviderReceipt {
    /// Creates a receipt carrying a message id.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            provider_message_id: Some(id.into()),
        }
    }
}

/// A channel-specific adapter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] whose kind decides whether the engine
    /// retries.
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<ProviderReceipt, TransportError>;
}

/// Maps each channel to its adapter.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    adapters: BTreeMap<Channel, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, replacing any previous one for the channel.
    #[must_use]
    pub fn with_transport(mut self, channel: Channel, transport: Arc<dyn Transport>) -> Self {
        self.register(channel, transport);
        self
    }

    /// Registers an adapter in place.
    pub fn register(&mut self, channel: Channel, transport: Arc<dyn Transport>) {
        self.adapters.insert(channel, transport);
    }

    /// Returns the adapter for `channel`.
    #[must_use]
    pub fn get(&self, channel: Channel) -> Option<Arc<dyn Transport>> {
        self.adapters.get(&channel).cloned()
    }

    /// Returns the channels with an adapter.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.adapters.keys().copied().collect()
    }

    /// Returns true if `channel` has an adapter.
    #[must_use]
    pub fn contains(&self, channel: Channel) -> bool {
        self.adapters.contains_key(&channel)
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}
