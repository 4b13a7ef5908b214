//! Digest aggregation: group closed-window digest deliveries into digests.

use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::StageContext;
use crate::config::EngineConfig;
use crate::core::{Channel, StageStats};
use crate::errors::Result;
use crate::events::{EngineEvent, EventSink};
use crate::store::DeliveryStore;
use crate::utils::{TimeWindow, Timestamp};

type GroupKey = (String, Channel, TimeWindow);

/// Aggregation over windows that have closed at `now`.
pub struct AggregateStage<'a> {
    store: &'a dyn DeliveryStore,
    events: &'a dyn EventSink,
    config: &'a EngineConfig,
    ctx: &'a StageContext,
}

impl<'a> AggregateStage<'a> {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        store: &'a dyn DeliveryStore,
        events: &'a dyn EventSink,
        config: &'a EngineConfig,
        ctx: &'a StageContext,
    ) -> Self {
        Self {
            store,
            events,
            config,
            ctx,
        }
    }

    /// Runs the stage, filling `stats` as it goes.
    pub async fn run(&self, now: Timestamp, stats: &mut StageStats) -> Result<()> {
        loop {
            if self.ctx.should_stop() {
                stats.deadline_hit = true;
                break;
            }

            let pending = self
                .store
                .unbatched_digest_deliveries(now, self.config.aggregate_batch_size)
                .await?;
            if pending.is_empty() {
                break;
            }

            let mut groups: BTreeMap<GroupKey, Vec<Uuid>> = BTreeMap::new();
            for delivery in &pending {
                if let Some(window) = delivery.window {
                    groups
                        .entry((delivery.user_id.clone(), delivery.channel, window))
                        .or_default()
                        .push(delivery.id);
                }
            }

            let mut progressed = 0_usize;
            for ((user_id, channel, window), members) in groups {
                let outcome = self
                    .store
                    .attach_to_digest(&user_id, channel, window, &members, now)
                    .await?;
                progressed += outcome.attached.len() + outcome.late.len();
                stats.deliveries_attached += outcome.attached.len() as u64;
                stats.late_dispatched += outcome.late.len() as u64;

                if outcome.created {
                    stats.digests_created += 1;
                    info!(
                        digest_id = %outcome.digest.id,
                        %user_id,
                        %channel,
                        event_count = outcome.digest.event_count,
                        "Digest created"
                    );
                    self.events.try_emit(&EngineEvent::DigestCreated {
                        digest_id: outcome.digest.id,
                        user_id: user_id.clone(),
                        channel,
                        event_count: outcome.digest.event_count,
                    });
                }
                if !outcome.late.is_empty() {
                    debug!(
                        digest_id = %outcome.digest.id,
                        late = outcome.late.len(),
                        "Digest already closed; dispatching late members individually"
                    );
                }
            }

            // Rows claimed away by a concurrent runner make no progress here.
            if progressed == 0 {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AlertEvent, Delivery, DeliveryKind, Phase};
    use crate::events::CollectingEventSink;
    use crate::store::InMemoryStore;
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn at(minute: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn digest_delivery(user: &str, channel: Channel, minute: i64) -> Delivery {
        let event = AlertEvent::new("liquidity", "eu", 5).with_created_at(at(minute));
        Delivery::queued(user, &event, channel, 15, at(minute))
    }

    async fn run(store: &InMemoryStore, sink: &CollectingEventSink, now: Timestamp) -> StageStats {
        let config = EngineConfig::default();
        let ctx = StageContext::new(Uuid::nil(), Phase::Aggregate);
        let mut stats = StageStats::default();
        AggregateStage::new(store, sink, &config, &ctx)
            .run(now, &mut stats)
            .await
            .unwrap();
        stats
    }

    #[tokio::test]
    async fn test_groups_by_user_channel_and_window() {
        let store = InMemoryStore::new();
        let sink = CollectingEventSink::new();
        for (user, channel, minute) in [
            ("u1", Channel::Email, 1),
            ("u1", Channel::Email, 14),
            ("u1", Channel::Email, 16),
            ("u1", Channel::DirectMessage, 3),
            ("u2", Channel::Email, 5),
        ] {
            store.put_delivery(digest_delivery(user, channel, minute));
        }

        let stats = run(&store, &sink, at(31)).await;
        assert_eq!(stats.digests_created, 4);
        assert_eq!(stats.deliveries_attached, 5);
        assert_eq!(sink.events_of_type("digest.created").len(), 4);

        let counts: Vec<_> = store
            .digests()
            .iter()
            .map(|d| (d.user_id.clone(), d.channel, d.event_count))
            .collect();
        assert!(counts.contains(&("u1".to_string(), Channel::Email, 2)));
    }

    #[tokio::test]
    async fn test_open_window_is_left_alone() {
        let store = InMemoryStore::new();
        let sink = CollectingEventSink::new();
        store.put_delivery(digest_delivery("u1", Channel::Email, 1));
        store.put_delivery(digest_delivery("u1", Channel::Email, 16));

        let stats = run(&store, &sink, at(20)).await;
        assert_eq!(stats.digests_created, 1);
        assert_eq!(stats.deliveries_attached, 1);
        let open = store
            .deliveries()
            .into_iter()
            .find(|d| d.event_created_at == at(16))
            .unwrap();
        assert!(open.digest_id.is_none());
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let store = InMemoryStore::new();
        let sink = CollectingEventSink::new();
        store.put_delivery(digest_delivery("u1", Channel::Email, 1));

        run(&store, &sink, at(20)).await;
        let again = run(&store, &sink, at(20)).await;
        assert_eq!(again, StageStats::default());
        assert_eq!(store.digests().len(), 1);
    }

    #[tokio::test]
    async fn test_late_member_goes_instant() {
        let store = InMemoryStore::new();
        let sink = CollectingEventSink::new();
        store.put_delivery(digest_delivery("u1", Channel::Email, 1));
        run(&store, &sink, at(20)).await;

        // Send picks the digest up, then a straggler for the same window lands.
        store
            .claim_due_digests(at(20), &crate::store::ClaimFilter::default(), 10)
            .await
            .unwrap();
        let straggler = digest_delivery("u1", Channel::Email, 2);
        let straggler_id = straggler.id;
        store.put_delivery(straggler);

        let stats = run(&store, &sink, at(21)).await;
        assert_eq!(stats.late_dispatched, 1);
        assert_eq!(store.digests()[0].event_count, 1);
        let converted = store.get_delivery(straggler_id).await.unwrap().unwrap();
        assert_eq!(converted.delivery_kind, DeliveryKind::Instant);
    }
}
