//! Fanout: expand each new event into per-subscriber deliveries.

use tracing::{debug, warn};

use super::StageContext;
use crate::config::{EngineConfig, TierPolicy};
use crate::core::{AlertEvent, Delivery, StageStats, Subscriber};
use crate::directory::SubscriberDirectory;
use crate::errors::Result;
use crate::store::{DeliveryStore, InsertOutcome, QuotaReservation};
use crate::utils::Timestamp;

/// Fanout over the events past the watermark and created at or before `now`.
pub struct FanoutStage<'a> {
    store: &'a dyn DeliveryStore,
    directory: &'a dyn SubscriberDirectory,
    config: &'a EngineConfig,
    ctx: &'a StageContext,
}

impl<'a> FanoutStage<'a> {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        store: &'a dyn DeliveryStore,
        directory: &'a dyn SubscriberDirectory,
        config: &'a EngineConfig,
        ctx: &'a StageContext,
    ) -> Self {
        Self {
            store,
            directory,
            config,
            ctx,
        }
    }

    /// Runs the stage, filling `stats` as it goes.
    ///
    /// The watermark only moves past events whose deliveries were all written,
    /// so an interrupted pass resumes where it stopped and re-inserts nothing.
    pub async fn run(&self, now: Timestamp, stats: &mut StageStats) -> Result<()> {
        let audience = self.resolve_audience(stats).await?;
        let mut cursor = self.store.fanout_watermark().await?;

        'batches: loop {
            let events = self
                .store
                .events_after(cursor, now, self.config.fanout_batch_size)
                .await?;
            if events.is_empty() {
                break;
            }

            for event in &events {
                if self.ctx.should_stop() {
                    stats.deadline_hit = true;
                    break 'batches;
                }
                stats.events_scanned += 1;
                if let Err(reason) = event.validate() {
                    stats.events_malformed += 1;
                    warn!(event_id = %event.id, %reason, "Skipping malformed event");
                } else {
                    self.fan_out_event(event, &audience, now, stats).await?;
                }
                cursor = Some(event.cursor());
            }

            if let Some(c) = cursor {
                self.store.advance_fanout_watermark(c).await?;
            }
            if events.len() < self.config.fanout_batch_size {
                break;
            }
        }

        if let Some(c) = cursor {
            self.store.advance_fanout_watermark(c).await?;
        }
        Ok(())
    }

    async fn resolve_audience(
        &self,
        stats: &mut StageStats,
    ) -> Result<Vec<(Subscriber, TierPolicy)>> {
        let subscribers = self.directory.snapshot().await?;
        let mut audience = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            match self.config.tier(&subscriber.plan_tier) {
                Some(policy) => {
                    let policy = policy.clone();
                    audience.push((subscriber, policy));
                }
                None => {
                    stats.subscribers_invalid += 1;
                    warn!(
                        user_id = %subscriber.user_id,
                        plan_tier = %subscriber.plan_tier,
                        "Skipping subscriber with unknown plan tier"
                    );
                }
            }
        }
        Ok(audience)
    }

    async fn fan_out_event(
        &self,
        event: &AlertEvent,
        audience: &[(Subscriber, TierPolicy)],
        now: Timestamp,
        stats: &mut StageStats,
    ) -> Result<()> {
        for (subscriber, tier) in audience {
            if !tier.allows(event) || !subscriber.matches(event) {
                continue;
            }
            let day = self.config.quota_reset.quota_day(now, subscriber);
            for (channel, settings) in subscriber.enabled_channels() {
                let delivery = Delivery::queued(
                    subscriber.user_id.clone(),
                    event,
                    channel,
                    subscriber.digest_window_minutes,
                    now,
                );
                let quota = QuotaReservation {
                    day,
                    limit: settings.daily_quota,
                };
                match self.store.insert_delivery(delivery, quota).await? {
                    InsertOutcome::Inserted => stats.deliveries_created += 1,
                    InsertOutcome::Duplicate => stats.duplicates += 1,
                    InsertOutcome::QuotaExhausted => {
                        stats.quota_exhausted += 1;
                        debug!(
                            user_id = %subscriber.user_id,
                            %channel,
                            event_id = %event.id,
                            "Daily quota exhausted"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelSettings, Channel, DeliveryKind};
    use crate::directory::InMemorySubscriberDirectory;
    use crate::store::InMemoryStore;
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn ctx() -> StageContext {
        StageContext::new(Uuid::nil(), crate::core::Phase::Fanout)
    }

    fn subscriber(id: &str, tier: &str) -> Subscriber {
        Subscriber::new(id, tier).with_channel(Channel::DirectMessage, ChannelSettings::new(id, 10))
    }

    async fn run(
        store: &InMemoryStore,
        directory: &InMemorySubscriberDirectory,
        config: &EngineConfig,
    ) -> StageStats {
        let ctx = ctx();
        let mut stats = StageStats::default();
        FanoutStage::new(store, directory, config, &ctx)
            .run(now(), &mut stats)
            .await
            .unwrap();
        stats
    }

    #[tokio::test]
    async fn test_tier_and_filters_select_audience() {
        let store = InMemoryStore::new();
        store.append_event(AlertEvent::new("liquidity", "eu", 5).with_created_at(now()));
        let directory = InMemorySubscriberDirectory::with_subscribers([
            subscriber("pro-eu", "pro").with_regions(["eu"]),
            subscriber("pro-us", "pro").with_regions(["us"]),
            subscriber("free", "free"),
            subscriber("ghost", "platinum"),
        ]);

        let stats = run(&store, &directory, &EngineConfig::default()).await;
        assert_eq!(stats.events_scanned, 1);
        assert_eq!(stats.deliveries_created, 1);
        assert_eq!(stats.subscribers_invalid, 1);
        assert_eq!(store.deliveries()[0].user_id, "pro-eu");
    }

    #[tokio::test]
    async fn test_one_delivery_per_enabled_channel() {
        let store = InMemoryStore::new();
        store.append_event(AlertEvent::new("liquidity", "eu", 5).with_created_at(now()));
        let directory = InMemorySubscriberDirectory::with_subscribers([subscriber("u1", "pro")
            .with_channel(Channel::Email, ChannelSettings::new("u1@example.com", 10))
            .with_channel(Channel::ChannelMember, ChannelSettings::new("C1", 10).disabled())
            .with_digest_window(15)]);

        let stats = run(&store, &directory, &EngineConfig::default()).await;
        assert_eq!(stats.deliveries_created, 2);
        assert!(store
            .deliveries()
            .iter()
            .all(|d| d.delivery_kind == DeliveryKind::Digest));
    }

    #[tokio::test]
    async fn test_malformed_events_are_skipped_and_passed() {
        let store = InMemoryStore::new();
        store.append_event(
            AlertEvent::new("", "eu", 5).with_created_at(now() - Duration::minutes(2)),
        );
        store.append_event(
            AlertEvent::new("liquidity", "eu", 5).with_created_at(now() - Duration::minutes(1)),
        );
        let directory = InMemorySubscriberDirectory::with_subscribers([subscriber("u1", "pro")]);

        let stats = run(&store, &directory, &EngineConfig::default()).await;
        assert_eq!(stats.events_malformed, 1);
        assert_eq!(stats.deliveries_created, 1);

        let again = run(&store, &directory, &EngineConfig::default()).await;
        assert_eq!(again.events_scanned, 0);
    }

    #[tokio::test]
    async fn test_events_after_now_wait() {
        let store = InMemoryStore::new();
        store.append_event(
            AlertEvent::new("liquidity", "eu", 5).with_created_at(now() + Duration::minutes(1)),
        );
        let directory = InMemorySubscriberDirectory::with_subscribers([subscriber("u1", "pro")]);

        let stats = run(&store, &directory, &EngineConfig::default()).await;
        assert_eq!(stats.events_scanned, 0);
        assert!(store.fanout_watermark().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batches_cover_every_event() {
        let store = InMemoryStore::new();
        for i in 0..7 {
            store.append_event(
                AlertEvent::new("liquidity", "eu", 5).with_created_at(now() - Duration::seconds(i)),
            );
        }
        let directory = InMemorySubscriberDirectory::with_subscribers([subscriber("u1", "pro")]);
        let config = EngineConfig {
            fanout_batch_size: 3,
            ..EngineConfig::default()
        };

        let stats = run(&store, &directory, &config).await;
        assert_eq!(stats.events_scanned, 7);
        assert_eq!(stats.deliveries_created, 7);
    }

    #[tokio::test]
    async fn test_deadline_stops_before_first_event() {
        let store = InMemoryStore::new();
        store.append_event(AlertEvent::new("liquidity", "eu", 5).with_created_at(now()));
        let directory = InMemorySubscriberDirectory::with_subscribers([subscriber("u1", "pro")]);
        let config = EngineConfig::default();
        let ctx = ctx().with_budget(Some(std::time::Duration::ZERO));

        let mut stats = StageStats::default();
        FanoutStage::new(&store, &directory, &config, &ctx)
            .run(now(), &mut stats)
            .await
            .unwrap();
        assert!(stats.deadline_hit);
        assert_eq!(stats.events_scanned, 0);
        assert!(store.deliveries().is_empty());
    }
}
