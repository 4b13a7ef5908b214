//! Scripted collaborators for engine tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::TransportError;
use crate::transport::{ProviderReceipt, Transport};

/// One message handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Provider address.
    pub recipient: String,
    /// Rendered subject.
    pub subject: String,
    /// Rendered body.
    pub body: String,
}

/// A transport that replays queued results, then succeeds.
///
/// Every call is recorded, including failed ones.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<ProviderReceipt, TransportError>>>,
    calls: Mutex<Vec<SentMessage>>,
    delay: Option<Duration>,
    counter: AtomicUsize,
}

impl ScriptedTransport {
    /// Creates a transport that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next unscripted call.
    #[must_use]
    pub fn then_fail(self, error: TransportError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Queues a success with a fixed message id.
    #[must_use]
    pub fn then_succeed(self, message_id: impl Into<String>) -> Self {
        self.script
            .lock()
            .push_back(Ok(ProviderReceipt::with_id(message_id)));
        self
    }

    /// Makes every call sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<SentMessage> {
        self.calls.lock().clone()
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<ProviderReceipt, TransportError> {
        self.calls.lock().push(SentMessage {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderReceipt::with_id(format!("msg-{n}")))
        })
    }
}
