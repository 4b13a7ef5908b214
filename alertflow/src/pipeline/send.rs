//! Send: claim due units, call transports, record outcomes.
//!
//! Each batch claims at most the breaker's remaining budget, so concurrent
//! transport calls inside one pass can never overshoot the ceiling. Claims are
//! held by [`ClaimGuard`]s and come back to the queue unchanged if anything
//! goes wrong before the outcome is stored.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::circuit::PassBreaker;
use super::locking::{ClaimGuard, ClaimKind};
use super::rate_limit::{LimitScope, RateLimitResult};
use super::retry::{RetryDecision, RetryPolicy};
use super::StageContext;
use crate::config::EngineConfig;
use crate::core::{AlertEvent, Channel, Delivery, SendOutcome, StageStats, Subscriber};
use crate::directory::SubscriberDirectory;
use crate::errors::{EngineError, Result, StoreError, TransportError};
use crate::events::{EngineEvent, EventSink};
use crate::observability::SpanTimer;
use crate::store::{ClaimFilter, ClaimedDigest, DeliveryStore};
use crate::transport::{MessageRenderer, ProviderReceipt, RenderedMessage, TransportRegistry};
use crate::utils::Timestamp;

/// Skip reason when the subscriber no longer exists.
pub const SKIP_SUBSCRIBER_MISSING: &str = "subscriber not found";
/// Skip reason when the subscriber turned the channel off.
pub const SKIP_CHANNEL_DISABLED: &str = "channel disabled by subscriber";
/// Skip reason when the subscriber has no address for the channel.
pub const SKIP_NO_RECIPIENT: &str = "no recipient address for channel";
/// Skip reason when the referenced events are gone.
pub const SKIP_EVENT_MISSING: &str = "alert event not found";

/// A claimed unit of work.
enum SendUnit {
    Instant(Delivery),
    Digest(ClaimedDigest),
}

impl SendUnit {
    fn id(&self) -> Uuid {
        match self {
            Self::Instant(d) => d.id,
            Self::Digest(c) => c.digest.id,
        }
    }

    fn kind(&self) -> ClaimKind {
        match self {
            Self::Instant(_) => ClaimKind::Delivery,
            Self::Digest(_) => ClaimKind::Digest,
        }
    }

    fn user_id(&self) -> &str {
        match self {
            Self::Instant(d) => &d.user_id,
            Self::Digest(c) => &c.digest.user_id,
        }
    }

    fn channel(&self) -> Channel {
        match self {
            Self::Instant(d) => d.channel,
            Self::Digest(c) => c.digest.channel,
        }
    }

    fn attempts(&self) -> u32 {
        match self {
            Self::Instant(d) => d.attempts,
            Self::Digest(c) => c.digest.attempts,
        }
    }

    fn event_ids(&self) -> Vec<Uuid> {
        match self {
            Self::Instant(d) => vec![d.alert_event_id],
            Self::Digest(c) => c.members.iter().map(|m| m.alert_event_id).collect(),
        }
    }
}

/// What happened to one claimed unit.
enum UnitResult {
    /// Outcome stored.
    Recorded(SendOutcome),
    /// Released unchanged because the breaker was exhausted.
    Released,
    /// Released unchanged because the store or directory failed.
    Errored(EngineError),
}

/// Everything Send reads besides the store.
pub struct SendStage<'a> {
    store: &'a dyn DeliveryStore,
    directory: &'a dyn SubscriberDirectory,
    transports: &'a TransportRegistry,
    renderer: &'a dyn MessageRenderer,
    events: &'a dyn EventSink,
    config: &'a EngineConfig,
    ctx: &'a StageContext,
}

impl<'a> SendStage<'a> {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        store: &'a dyn DeliveryStore,
        directory: &'a dyn SubscriberDirectory,
        transports: &'a TransportRegistry,
        renderer: &'a dyn MessageRenderer,
            events: &'a dyn EventSink,
        config: &'a EngineConfig,
        ctx: &'a StageContext,
    ) -> Self {
        Self {
            store,
            directory,
            transports,
            renderer,
            events,
            config,
            ctx,
        }
    }

    fn claim_filter(&self) -> ClaimFilter {
        let mut disabled_channels = self.config.kill_switches.disabled_channels();
        // Units for channels without an adapter wait for one to be registered.
        disabled_channels.extend(
            Channel::ALL
                .into_iter()
                .filter(|c| !self.transports.contains(*c)),
        );
        ClaimFilter {
            disabled_channels,
            allowlist: self.config.kill_switches.allowlist.clone(),
        }
    }

    /// Runs the stage, filling `stats` as it goes.
    pub async fn run(&self, now: Timestamp, stats: &mut StageStats) -> Result<()> {
        let filter = self.claim_filter();
        let breaker = PassBreaker::new(self.config.kill_switches.circuit_breaker_ceiling);

        loop {
            if self.ctx.should_stop() {
                stats.deadline_hit = true;
                break;
            }
            let budget = breaker.remaining() as usize;
            if budget == 0 {
                breaker.trip();
                break;
            }
            let limit = budget.min(self.config.send_batch_size);

            let digests = self.store.claim_due_digests(now, &filter, limit).await?;
            let mut units: Vec<SendUnit> = digests.into_iter().map(SendUnit::Digest).collect();
            let room = limit - units.len();
            if room > 0 {
                match self.store.claim_due_deliveries(now, &filter, room).await {
                    Ok(deliveries) => units.extend(deliveries.into_iter().map(SendUnit::Instant)),
                    Err(e) => {
                        for unit in &units {
                            self.store.release_digest(unit.id());
                        }
                        return Err(e.into());
                    }
                }
            }
            if units.is_empty() {
                break;
            }
            stats.claimed += units.len() as u64;

            let results: Vec<UnitResult> = stream::iter(units)
                .map(|unit| self.process(unit, &breaker, now))
                .buffer_unordered(self.config.send_concurrency)
                .collect()
                .await;

            let mut store_trouble = false;
            for result in results {
                match result {
                    UnitResult::Recorded(outcome) => tally(stats, &outcome),
                    UnitResult::Released => {}
                    UnitResult::Errored(e) => {
                        stats.errors += 1;
                        store_trouble = true;
                        warn!(error = %e, "Unit released after store error");
                    }
                }
            }
            if store_trouble {
                break;
            }
        }

        if breaker.is_tripped() {
            stats.circuit_tripped = true;
            warn!(
                ceiling = breaker.ceiling(),
                attempted = breaker.attempted(),
                "Circuit breaker tripped; remaining units wait for the next pass"
            );
            self.events.try_emit(&EngineEvent::CircuitTripped {
                run_id: self.ctx.run_id(),
                ceiling: breaker.ceiling(),
            });
        }

        match self.store.expire_rate_windows(&self.config.rate_limits, now).await {
            Ok(0) => {}
            Ok(dropped) => debug!(dropped, "Expired idle rate windows"),
            Err(e) => warn!(error = %e, "Failed to expire rate windows"),
        }
        Ok(())
    }

    async fn process(&self, unit: SendUnit, breaker: &PassBreaker, now: Timestamp) -> UnitResult {
        let guard = ClaimGuard::new(self.store, unit.kind(), unit.id());

        let outcome = match self.decide(&unit, breaker, now).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return UnitResult::Released,
            Err(e) => return UnitResult::Errored(e),
        };

        let stored = match &unit {
            SendUnit::Instant(d) => self
                .store
                .complete_delivery(d.id, &outcome, now)
                .await
                .map(|d| d.attempts),
            SendUnit::Digest(c) => self
                .store
                .complete_digest(c.digest.id, &outcome, now)
                .await
                .map(|d| d.attempts),
        };
        match stored {
            Ok(attempts) => {
                guard.disarm();
                self.report(&unit, &outcome, attempts);
                UnitResult::Recorded(outcome)
            }
            Err(StoreError::ClaimNotHeld { id }) => {
                guard.disarm();
                UnitResult::Errored(StoreError::ClaimNotHeld { id }.into())
            }
            Err(e) => UnitResult::Errored(e.into()),
        }
    }

    /// Returns the outcome to store, or `None` to release the unit unchanged.
    async fn decide(
        &self,
        unit: &SendUnit,
        breaker: &PassBreaker,
        now: Timestamp,
    ) -> Result<Option<SendOutcome>> {
        let channel = unit.channel();
        let Some(subscriber) = self.directory.get(unit.user_id()).await? else {
            return Ok(Some(skip(SKIP_SUBSCRIBER_MISSING)));
        };
        let recipient = match recipient_for(&subscriber, channel) {
            Ok(recipient) => recipient,
            Err(reason) => return Ok(Some(skip(reason))),
        };

        let events = self.store.events_by_id(&unit.event_ids()).await?;
        let Some(message) = self.render(unit, &events) else {
            return Ok(Some(skip(SKIP_EVENT_MISSING)));
        };

        let Some(transport) = self.transports.get(channel) else {
            return Ok(None);
        };
        if let Some(limits) = self.config.rate_limits.get(&channel) {
            if let RateLimitResult::Denied { scope, retry_at } = self
                .store
                .reserve_send_slot(channel, &recipient, limits, now)
                .await?
            {
                let reason = match scope {
                    LimitScope::Channel => format!("rate limited on {channel}"),
                    LimitScope::Recipient => format!("rate limited for recipient on {channel}"),
                };
                return Ok(Some(SendOutcome::Deferred {
                    reason,
                    next_retry_at: retry_at,
                }));
            }
        }

        if !breaker.try_acquire() {
            return Ok(None);
        }

        let timer = SpanTimer::start("transport.send");
        let result = match tokio::time::timeout(
            self.config.transport_timeout(),
            transport.send(&recipient, &message.subject, &message.body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!(
                "no response within {}ms",
                self.config.transport_timeout_ms
            ))),
        };
        let span = timer.name();
        debug!(
            unit_id = %unit.id(),
            %channel,
            span,
            elapsed_ms = timer.finish(),
            ok = result.is_ok(),
            "Transport call finished"
        );

        Ok(Some(self.classify(result, unit.attempts().saturating_add(1), now)))
    }

    fn render(
        &self,
        unit: &SendUnit,
        events: &HashMap<Uuid, AlertEvent>,
    ) -> Option<RenderedMessage> {
        match unit {
            SendUnit::Instant(d) => events
                .get(&d.alert_event_id)
                .map(|event| self.renderer.render_instant(event, d.channel)),
            SendUnit::Digest(c) => {
                let members: Vec<AlertEvent> = c
                    .members
                    .iter()
                    .filter_map(|m| events.get(&m.alert_event_id).cloned())
                    .collect();
                if members.is_empty() {
                    None
                } else {
                    Some(self.renderer.render_digest(&c.digest, &members))
                }
            }
        }
    }

    fn classify(
        &self,
        result: std::result::Result<ProviderReceipt, TransportError>,
        attempts: u32,
        now: Timestamp,
    ) -> SendOutcome {
        let error = match result {
            Ok(receipt) => {
                return SendOutcome::Sent {
                    provider_message_id: receipt.provider_message_id,
                }
            }
            Err(error) => error,
        };
        if !error.is_transient() {
            return SendOutcome::Failed {
                error: error.to_string(),
            };
        }

        let decision = {
            let mut rng = rand::thread_rng();
            RetryPolicy::new(&self.config.retry).decide(attempts, now, error.retry_after, &mut rng)
        };
        match decision {
            RetryDecision::Retry { next_retry_at } => SendOutcome::RetryScheduled {
                error: error.to_string(),
                next_retry_at,
            },
            RetryDecision::Exhausted => SendOutcome::Failed {
                error: format!("retries exhausted after {attempts} attempts: {error}"),
            },
        }
    }

    fn report(&self, unit: &SendUnit, outcome: &SendOutcome, attempts: u32) {
        let unit_id = unit.id();
        let user_id = unit.user_id().to_string();
        let channel = unit.channel();
        let event = match outcome {
            SendOutcome::Sent { .. } => {
                info!(%unit_id, %user_id, %channel, attempts, "Delivered");
                if let SendUnit::Digest(c) = unit {
                    self.events.try_emit(&EngineEvent::DigestSent {
                        digest_id: unit_id,
                        event_count: u32::try_from(c.members.len()).unwrap_or(u32::MAX),
                    });
                }
                EngineEvent::DeliverySent {
                    unit_id,
                    user_id,
                    channel,
                    attempts,
                }
            }
            SendOutcome::RetryScheduled {
                error,
                next_retry_at,
            } => {
                info!(%unit_id, %channel, attempts, %next_retry_at, %error, "Retry scheduled");
                EngineEvent::DeliveryRetryScheduled {
                    unit_id,
                    attempts,
                    next_retry_at: *next_retry_at,
                    error: error.clone(),
                }
            }
            SendOutcome::Deferred {
                reason,
                next_retry_at,
            } => {
                debug!(%unit_id, %channel, %next_retry_at, %reason, "Deferred");
                EngineEvent::DeliveryDeferred {
                    unit_id,
                    next_retry_at: *next_retry_at,
                }
            }
            SendOutcome::Failed { error } => {
                warn!(%unit_id, %user_id, %channel, attempts, %error, "Delivery failed");
                EngineEvent::DeliveryFailed {
                    unit_id,
                    user_id,
                    attempts,
                    error: error.clone(),
                }
            }
            SendOutcome::Skipped { reason } => {
                info!(%unit_id, %user_id, %channel, %reason, "Delivery skipped");
                EngineEvent::DeliverySkipped {
                    unit_id,
                    user_id,
                    reason: reason.clone(),
                }
            }
        };
        self.events.try_emit(&event);
    }
}

fn skip(reason: &str) -> SendOutcome {
    SendOutcome::Skipped {
        reason: reason.to_string(),
    }
}

fn recipient_for(
    subscriber: &Subscriber,
    channel: Channel,
) -> std::result::Result<String, &'static str> {
    let settings = subscriber
        .channel(channel)
        .filter(|s| s.enabled)
        .ok_or(SKIP_CHANNEL_DISABLED)?;
    settings
        .recipient
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(ToString::to_string)
        .ok_or(SKIP_NO_RECIPIENT)
}

fn tally(stats: &mut StageStats, outcome: &SendOutcome) {
    match outcome {
        SendOutcome::Sent { .. } => stats.sent += 1,
        SendOutcome::RetryScheduled { .. } => stats.retried += 1,
        SendOutcome::Deferred { .. } => stats.deferred += 1,
        SendOutcome::Failed { .. } => stats.failed += 1,
        SendOutcome::Skipped { .. } => stats.skipped += 1,
    }
}
