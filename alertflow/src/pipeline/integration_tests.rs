//! End-to-end scenarios across fanout, aggregation and send.

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, RateLimitConfig, RetryConfig};
    use crate::core::{
        Channel, ChannelSettings, Delivery, DeliveryStatus, DigestStatus, Phase, RunStatus,
    };
    use crate::errors::{EngineError, StoreError, TransportError, TransportErrorKind};
    use crate::pipeline::{SKIP_NO_RECIPIENT, SKIP_SUBSCRIBER_MISSING};
    use crate::store::DeliveryStore;
    use crate::testing::{
        digest_subscriber, instant_subscriber, minutes_after_base, sample_event, EngineHarness,
        ScriptedTransport,
    };
    use crate::utils::Timestamp;
    use chrono::Duration;
    use futures::future::join_all;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use uuid::Uuid;

    const DM: Channel = Channel::DirectMessage;

    fn only_delivery(harness: &EngineHarness) -> Delivery {
        let deliveries = harness.store.deliveries();
        assert_eq!(deliveries.len(), 1, "expected exactly one delivery");
        deliveries.into_iter().next().unwrap()
    }

    fn retry_at(harness: &EngineHarness) -> Timestamp {
        only_delivery(harness).next_retry_at.unwrap()
    }

    #[tokio::test]
    async fn test_instant_delivery_end_to_end() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();

        let cycle = engine
            .run_cycle(&EngineConfig::default(), minutes_after_base(1))
            .await;
        assert!(cycle.is_clean());
        assert_eq!(cycle.report(Phase::Fanout).unwrap().stats.deliveries_created, 1);
        assert_eq!(cycle.report(Phase::Send).unwrap().stats.sent, 1);

        let delivery = only_delivery(&harness);
        assert_eq!(delivery.status, DeliveryStatus::Sent);
        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.provider_message_id.as_deref(), Some("msg-0"));
        assert_eq!(delivery.sent_at, Some(minutes_after_base(1)));

        let calls = harness.transport(DM).unwrap().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].recipient, format!("u1@{DM}"));
        assert!(calls[0].subject.contains("liquidity"));
        assert!(calls[0].body.contains("Pool depth"));

        let names = harness.sink.names();
        assert!(names.contains(&"delivery.sent"));
        assert_eq!(names.iter().filter(|n| **n == "stage.completed").count(), 3);
        assert_eq!(harness.store.runs().len(), 3);
    }

    #[tokio::test]
    async fn test_eligibility_filters() {
        let harness = EngineHarness::new([
            instant_subscriber("free-user", DM, 10).with_plan_tier("free"),
            instant_subscriber("eu-only", DM, 10).with_regions(["eu"]),
            instant_subscriber("us-only", DM, 10).with_regions(["us"]),
            instant_subscriber("ghost", DM, 10).with_plan_tier("platinum"),
        ]);
        harness.publish([sample_event(5, minutes_after_base(0))]);

        let report = harness
            .engine()
            .fanout(&EngineConfig::default(), minutes_after_base(1))
            .await
            .unwrap();
        assert_eq!(report.stats.deliveries_created, 1);
        assert_eq!(report.stats.subscribers_invalid, 1);
        assert_eq!(only_delivery(&harness).user_id, "eu-only");
    }

    #[tokio::test]
    async fn test_events_after_now_wait_for_a_later_pass() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]);
        harness.publish([sample_event(5, minutes_after_base(5))]);
        let engine = harness.engine();
        let config = EngineConfig::default();

        let early = engine.fanout(&config, minutes_after_base(1)).await.unwrap();
        assert_eq!(early.stats.events_scanned, 0);
        let later = engine.fanout(&config, minutes_after_base(6)).await.unwrap();
        assert_eq!(later.stats.deliveries_created, 1);
    }

    #[tokio::test]
    async fn test_concurrent_fanout_creates_each_delivery_once() {
        let harness = EngineHarness::new([
            instant_subscriber("u1", DM, 10),
            instant_subscriber("u2", DM, 10)
                .with_channel(Channel::Email, ChannelSettings::new("u2@example.com", 10)),
        ]);
        harness.publish((0..3).map(|m| sample_event(5, minutes_after_base(m))));
        let config = EngineConfig::default().with_serialized_stages(false);
        let engines: Vec<_> = (0..3).map(|_| harness.engine()).collect();

        let reports =
            join_all(engines.iter().map(|e| e.fanout(&config, minutes_after_base(5)))).await;
        let created: u64 = reports
            .iter()
            .map(|r| r.as_ref().unwrap().stats.deliveries_created)
            .sum();

        assert_eq!(created, 9);
        assert_eq!(harness.store.deliveries().len(), 9);
        let day = minutes_after_base(5).date_naive();
        assert_eq!(harness.store.quota_used("u1", DM, day), 3);
        assert_eq!(harness.store.quota_used("u2", Channel::Email, day), 3);
    }

    #[tokio::test]
    async fn test_daily_quota() {
        let harness = EngineHarness::new([
            instant_subscriber("u1", DM, 2),
            instant_subscriber("muted", DM, 0),
        ]);
        harness.publish((0..3).map(|m| sample_event(5, minutes_after_base(m))));

        let report = harness
            .engine()
            .fanout(&EngineConfig::default(), minutes_after_base(5))
            .await
            .unwrap();
        assert_eq!(report.stats.deliveries_created, 2);
        assert_eq!(report.stats.quota_exhausted, 4);
        assert!(harness.store.deliveries().iter().all(|d| d.user_id == "u1"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]).with_transport(
            DM,
            ScriptedTransport::new().then_fail(TransportError::invalid_recipient("no such user")),
        );
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();

        let cycle = engine
            .run_cycle(&EngineConfig::default(), minutes_after_base(1))
            .await;
        assert_eq!(cycle.report(Phase::Send).unwrap().stats.failed, 1);

        let delivery = only_delivery(&harness);
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.next_retry_at, None);
        assert!(delivery.last_error.unwrap().contains("no such user"));
        assert_eq!(harness.sink.events_of_type("delivery.failed").len(), 1);

        let again = engine
            .send(&EngineConfig::default(), minutes_after_base(600))
            .await
            .unwrap();
        assert_eq!(again.stats.claimed, 0);
        assert_eq!(harness.transport(DM).unwrap().call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]).with_transport(
            DM,
            ScriptedTransport::new().then_fail(
                TransportError::new(TransportErrorKind::ServerError, "502")
                    .with_retry_after(std::time::Duration::from_secs(120)),
            ),
        );
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default();
        let now = minutes_after_base(1);

        engine.run_cycle(&config, now).await;
        let delivery = only_delivery(&harness);
        assert_eq!(delivery.status, DeliveryStatus::Queued);
        assert_eq!(delivery.attempts, 1);
        let next = delivery.next_retry_at.unwrap();
        assert!(next >= now + Duration::seconds(120));

        let not_due = engine.send(&config, next - Duration::seconds(1)).await.unwrap();
        assert_eq!(not_due.stats.claimed, 0);

        let due = engine.send(&config, next).await.unwrap();
        assert_eq!(due.stats.sent, 1);
        let delivery = only_delivery(&harness);
        assert_eq!(delivery.status, DeliveryStatus::Sent);
        assert_eq!(delivery.attempts, 2);
    }

    #[tokio::test]
    async fn test_backoff_grows_until_retries_run_out() {
        let transport = (0..3).fold(ScriptedTransport::new(), |t, _| {
            t.then_fail(TransportError::timeout("upstream timeout"))
        });
        let harness =
            EngineHarness::new([instant_subscriber("u1", DM, 10)]).with_transport(DM, transport);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default().with_retry(
            RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay_ms(1_000)
                .with_max_delay_ms(60_000)
                .with_jitter_ratio(0.0),
        );

        let mut now = minutes_after_base(1);
        engine.run_cycle(&config, now).await;
        let mut delays = Vec::new();
        for _ in 0..2 {
            let next = retry_at(&harness);
            delays.push(next - now);
            now = next;
            engine.send(&config, now).await.unwrap();
        }

        assert_eq!(delays, vec![Duration::seconds(1), Duration::seconds(2)]);
        let delivery = only_delivery(&harness);
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.attempts, 3);
        assert!(delivery.last_error.unwrap().starts_with("retries exhausted after 3 attempts"));
    }

    #[tokio::test]
    async fn test_transport_timeout_counts_as_transient() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]).with_transport(
            DM,
            ScriptedTransport::new().with_delay(std::time::Duration::from_millis(200)),
        );
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let mut config = EngineConfig::default();
        config.transport_timeout_ms = 10;

        let cycle = harness.engine().run_cycle(&config, minutes_after_base(1)).await;
        assert_eq!(cycle.report(Phase::Send).unwrap().stats.retried, 1);
        let delivery = only_delivery(&harness);
        assert_eq!(delivery.status, DeliveryStatus::Queued);
        assert!(delivery.last_error.unwrap().starts_with("timeout"));
    }

    #[tokio::test]
    async fn test_concurrent_send_passes_deliver_exactly_once() {
        let subscribers: Vec<_> = (0..40)
            .map(|i| instant_subscriber(&format!("u{i}"), DM, 10))
            .collect();
        let harness = EngineHarness::new(subscribers);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let config = EngineConfig::default()
            .with_serialized_stages(false)
            .with_send_batch_size(7);
        harness
            .engine()
            .fanout(&config, minutes_after_base(1))
            .await
            .unwrap();

        let engines: Vec<_> = (0..4).map(|_| harness.engine()).collect();
        let reports =
            join_all(engines.iter().map(|e| e.send(&config, minutes_after_base(1)))).await;
        let sent: u64 = reports.iter().map(|r| r.as_ref().unwrap().stats.sent).sum();

        assert_eq!(sent, 40);
        assert_eq!(harness.transport(DM).unwrap().call_count(), 40);
        assert!(harness
            .store
            .deliveries()
            .iter()
            .all(|d| d.status == DeliveryStatus::Sent && d.attempts == 1));
        assert_eq!(harness.store.outstanding_claims(), 0);
    }

    #[tokio::test]
    async fn test_digest_sent_after_window_closes() {
        let harness = EngineHarness::new([digest_subscriber("u1", Channel::Email, 15)]);
        harness.publish([
            sample_event(5, minutes_after_base(1)),
            sample_event(6, minutes_after_base(5)),
        ]);
        let engine = harness.engine();
        let config = EngineConfig::default();

        let open = engine.run_cycle(&config, minutes_after_base(10)).await;
        assert_eq!(open.report(Phase::Fanout).unwrap().stats.deliveries_created, 2);
        assert_eq!(open.report(Phase::Aggregate).unwrap().stats.digests_created, 0);
        assert_eq!(open.report(Phase::Send).unwrap().stats.claimed, 0);

        let closed = engine.run_cycle(&config, minutes_after_base(16)).await;
        assert_eq!(closed.report(Phase::Aggregate).unwrap().stats.digests_created, 1);
        assert_eq!(closed.report(Phase::Send).unwrap().stats.sent, 1);

        let digest = &harness.store.digests()[0];
        assert_eq!(digest.status, DigestStatus::Sent);
        assert_eq!(digest.event_count, 2);
        assert!(harness
            .store
            .deliveries()
            .iter()
            .all(|d| d.status == DeliveryStatus::Sent && d.digest_id == Some(digest.id)));

        let calls = harness.transport(Channel::Email).unwrap().calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].subject.starts_with("2 alerts between"));
        assert_eq!(harness.sink.events_of_type("digest.sent").len(), 1);
    }

    #[tokio::test]
    async fn test_late_aggregation_keeps_one_digest_per_window() {
        let harness = EngineHarness::new([digest_subscriber("u1", Channel::Email, 15)]);
        harness.publish([
            sample_event(5, minutes_after_base(1)),
            sample_event(5, minutes_after_base(14)),
            sample_event(5, minutes_after_base(20)),
        ]);
        let engine = harness.engine();
        let config = EngineConfig::default();

        engine.fanout(&config, minutes_after_base(21)).await.unwrap();
        let report = engine
            .aggregate_digests(&config, minutes_after_base(120))
            .await
            .unwrap();
        assert_eq!(report.stats.digests_created, 2);

        let mut counts: Vec<_> = harness.store.digests().iter().map(|d| d.event_count).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2]);

        let rerun = engine
            .aggregate_digests(&config, minutes_after_base(121))
            .await
            .unwrap();
        assert_eq!(rerun.stats.digests_created, 0);
        assert_eq!(harness.store.digests().len(), 2);
    }

    #[tokio::test]
    async fn test_master_switch_disables_every_stage() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let config = EngineConfig::default().with_enabled(false);

        let cycle = harness.engine().run_cycle(&config, minutes_after_base(1)).await;
        assert_eq!(cycle.reports.len(), 3);
        assert!(cycle.reports.iter().all(|r| r.is_disabled()));
        assert!(harness.store.deliveries().is_empty());
        assert_eq!(harness.sink.events_of_type("stage.disabled").len(), 3);
        assert!(harness
            .store
            .runs()
            .iter()
            .all(|r| r.status == RunStatus::Disabled));
    }

    #[tokio::test]
    async fn test_channel_switch_and_allowlist_leave_units_queued() {
        let harness = EngineHarness::new([
            instant_subscriber("u1", DM, 10)
                .with_channel(Channel::Email, ChannelSettings::new("u1@example.com", 10)),
            instant_subscriber("u2", DM, 10),
        ]);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let config = EngineConfig::default()
            .with_channel_enabled(Channel::Email, false)
            .with_allowlist(["u1"]);

        let cycle = harness.engine().run_cycle(&config, minutes_after_base(1)).await;
        assert_eq!(cycle.report(Phase::Fanout).unwrap().stats.deliveries_created, 3);
        assert_eq!(cycle.report(Phase::Send).unwrap().stats.sent, 1);

        let queued: Vec<_> = harness
            .store
            .deliveries()
            .into_iter()
            .filter(|d| d.status == DeliveryStatus::Queued)
            .map(|d| (d.user_id, d.channel))
            .collect();
        assert_eq!(queued.len(), 2);
        assert!(queued.contains(&("u1".to_string(), Channel::Email)));
        assert!(queued.contains(&("u2".to_string(), DM)));
    }

    #[tokio::test]
    async fn test_stage_busy() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default();
        assert!(harness.store.try_lock_stage(Phase::Send, Uuid::new_v4()).await.unwrap());

        let err = engine.send(&config, minutes_after_base(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::StageBusy { phase: Phase::Send }));

        let cycle = engine.run_cycle(&config, minutes_after_base(1)).await;
        assert_eq!(cycle.reports.len(), 2);
        assert_eq!(cycle.errors.len(), 1);
        assert_eq!(cycle.errors[0].0, Phase::Send);
        assert_eq!(only_delivery(&harness).status, DeliveryStatus::Queued);
    }

    #[tokio::test]
    async fn test_circuit_breaker_ceiling() {
        let subscribers: Vec<_> = (0..5)
            .map(|i| instant_subscriber(&format!("u{i}"), DM, 10))
            .collect();
        let harness = EngineHarness::new(subscribers);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default().with_circuit_ceiling(3);

        let cycle = engine.run_cycle(&config, minutes_after_base(1)).await;
        let send = cycle.report(Phase::Send).unwrap();
        assert_eq!(send.stats.sent, 3);
        assert!(send.stats.circuit_tripped);
        assert_eq!(send.status, RunStatus::Partial);
        assert_eq!(harness.sink.events_of_type("circuit.tripped").len(), 1);

        let next = engine.send(&config, minutes_after_base(2)).await.unwrap();
        assert_eq!(next.stats.sent, 2);
        assert_eq!(next.status, RunStatus::Completed);
        assert_eq!(harness.transport(DM).unwrap().call_count(), 5);
    }

    #[tokio::test]
    async fn test_rate_limit_defers_without_counting_attempts() {
        let harness = EngineHarness::new([
            instant_subscriber("u1", DM, 10),
            instant_subscriber("u2", DM, 10),
        ]);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default().with_rate_limit(DM, RateLimitConfig::new(1, 60_000));
        let now = minutes_after_base(1);

        let cycle = engine.run_cycle(&config, now).await;
        let send = cycle.report(Phase::Send).unwrap();
        assert_eq!((send.stats.sent, send.stats.deferred), (1, 1));

        let deferred = harness
            .store
            .deliveries()
            .into_iter()
            .find(|d| d.status == DeliveryStatus::Queued)
            .unwrap();
        assert_eq!(deferred.attempts, 0);
        assert_eq!(deferred.next_retry_at, Some(now + Duration::seconds(60)));
        assert_eq!(deferred.last_error.as_deref(), Some("rate limited on direct_message"));
        assert_eq!(harness.sink.events_of_type("delivery.deferred").len(), 1);

        let later = engine.send(&config, now + Duration::seconds(60)).await.unwrap();
        assert_eq!(later.stats.sent, 1);
        let delivery = harness.store.get_delivery(deferred.id).await.unwrap().unwrap();
        assert_eq!(delivery.attempts, 1);
    }

    #[tokio::test]
    async fn test_skip_reasons() {
        let harness = EngineHarness::new([
            instant_subscriber("gone", DM, 10),
            instant_subscriber("blank", DM, 10),
        ]);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default();
        engine.fanout(&config, minutes_after_base(1)).await.unwrap();

        harness.directory.remove("gone");
        harness
            .directory
            .upsert(
                crate::core::Subscriber::new("blank", "pro")
                    .with_channel(DM, ChannelSettings::new("", 10)),
            );

        let report = engine.send(&config, minutes_after_base(2)).await.unwrap();
        assert_eq!(report.stats.skipped, 2);
        assert_eq!(harness.transport(DM).unwrap().call_count(), 0);

        for delivery in harness.store.deliveries() {
            assert_eq!(delivery.status, DeliveryStatus::Skipped);
            assert_eq!(delivery.attempts, 0);
            let expected = if delivery.user_id == "gone" {
                SKIP_SUBSCRIBER_MISSING
            } else {
                SKIP_NO_RECIPIENT
            };
            assert_eq!(delivery.last_error.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_missing_transport_leaves_units_queued() {
        let harness = EngineHarness::new([instant_subscriber("u1", Channel::Email, 10)])
            .without_transport(Channel::Email);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default();

        let cycle = engine.run_cycle(&config, minutes_after_base(1)).await;
        assert_eq!(cycle.report(Phase::Send).unwrap().stats.claimed, 0);
        assert_eq!(only_delivery(&harness).status, DeliveryStatus::Queued);

        let preflight = engine.preflight(&config).await;
        assert!(!preflight.is_ready());
        assert_eq!(preflight.channels_without_transport, vec![Channel::Email]);
    }

    #[tokio::test]
    async fn test_health_report() {
        let harness = EngineHarness::new([
            instant_subscriber("ok", DM, 10),
            instant_subscriber("bad", Channel::Email, 10),
        ])
        .with_transport(
            Channel::Email,
            ScriptedTransport::new().then_fail(TransportError::invalid_recipient("bounced")),
        );
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default();
        engine.run_cycle(&config, minutes_after_base(1)).await;

        let health = engine.health(&config, minutes_after_base(2)).await.unwrap();
        assert!(health.engine_enabled);
        assert_eq!(health.deliveries.get(DM, DeliveryStatus::Sent), 1);
        assert_eq!(health.deliveries.get(Channel::Email, DeliveryStatus::Failed), 1);
        assert_eq!(health.pending_digests, 0);
        assert_eq!(health.latest_runs.len(), 3);
        assert_eq!(health.failed.len(), 1);
        assert_eq!(health.failed[0].user_id, "bad");

        let later = engine.health(&config, minutes_after_base(3 * 24 * 60)).await.unwrap();
        assert_eq!(later.deliveries.total(DeliveryStatus::Sent), 0);
        assert!(later.failed.is_empty());
    }

    #[tokio::test]
    async fn test_health_window_beyond_calendar_range() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]);
        let mut config = EngineConfig::default();
        config.health_window_hours = u32::MAX;

        let health = harness.engine().health(&config, minutes_after_base(1)).await.unwrap();
        assert_eq!(health.deliveries.total(DeliveryStatus::Sent), 0);
    }

    #[tokio::test]
    async fn test_rate_windows_are_shared_across_engines() {
        let harness = EngineHarness::new([
            instant_subscriber("u1", DM, 10),
            instant_subscriber("u2", DM, 10),
        ])
        .with_transport(
            DM,
            ScriptedTransport::new().with_delay(std::time::Duration::from_millis(20)),
        );
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let config = EngineConfig::default()
            .with_rate_limit(DM, RateLimitConfig::new(1, 60_000))
            .with_send_batch_size(1)
            .with_serialized_stages(false);
        let now = minutes_after_base(1);
        let (first, second) = (harness.engine(), harness.engine());
        first.fanout(&config, now).await.unwrap();

        let (a, b) = tokio::join!(first.send(&config, now), second.send(&config, now));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(harness.transport(DM).unwrap().call_count(), 1);
        assert_eq!(a.stats.sent + b.stats.sent, 1);
        assert_eq!(a.stats.deferred + b.stats.deferred, 1);
    }

    #[tokio::test]
    async fn test_idle_rate_windows_expire_after_send() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default()
            .with_rate_limit(DM, RateLimitConfig::new(10, 60_000).with_per_recipient(1));

        engine.run_cycle(&config, minutes_after_base(1)).await;
        assert_eq!(harness.store.tracked_recipients(), 1);

        let idle = engine.send(&config, minutes_after_base(3)).await.unwrap();
        assert_eq!(idle.stats.claimed, 0);
        assert_eq!(harness.store.tracked_recipients(), 0);
    }

    #[tokio::test]
    async fn test_oversized_retry_after_hint_is_capped() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]).with_transport(
            DM,
            ScriptedTransport::new().then_fail(
                TransportError::new(TransportErrorKind::RateLimited, "slow down")
                    .with_retry_after(std::time::Duration::MAX),
            ),
        );
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let config = EngineConfig::default().with_retry(
            RetryConfig::new()
                .with_base_delay_ms(1_000)
                .with_max_delay_ms(60_000)
                .with_jitter_ratio(0.0),
        );
        let now = minutes_after_base(1);

        let cycle = harness.engine().run_cycle(&config, now).await;
        assert!(cycle.is_clean());
        let delivery = only_delivery(&harness);
        assert_eq!(delivery.status, DeliveryStatus::Queued);
        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.next_retry_at, Some(now + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn test_requeue_failed_delivery() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]).with_transport(
            DM,
            ScriptedTransport::new()
                .then_fail(TransportError::new(TransportErrorKind::ClientError, "400")),
        );
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let engine = harness.engine();
        let config = EngineConfig::default();
        engine.run_cycle(&config, minutes_after_base(1)).await;
        let failed = only_delivery(&harness);
        assert_eq!(failed.status, DeliveryStatus::Failed);

        let requeued = engine
            .requeue_failed(&config, failed.id, minutes_after_base(2))
            .await
            .unwrap();
        assert_eq!(requeued.status, DeliveryStatus::Queued);

        let report = engine.send(&config, minutes_after_base(2)).await.unwrap();
        assert_eq!(report.stats.sent, 1);
        assert_eq!(only_delivery(&harness).attempts, 2);

        let tight = config.clone().with_retry(RetryConfig::new().with_max_attempts(1));
        let sent = only_delivery(&harness);
        let err = engine
            .requeue_failed(&tight, sent.id, minutes_after_base(3))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_stage_deadline_cuts_pass_short() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        let config = EngineConfig::default().with_stage_deadline_ms(0);

        let report = harness
            .engine()
            .fanout(&config, minutes_after_base(1))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Partial);
        assert!(report.stats.deadline_hit);
        assert_eq!(report.reason.as_deref(), Some("stage deadline reached"));
        assert!(harness.store.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_engine_refuses_to_start() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]);
        let token = Arc::new(crate::cancellation::CancellationToken::new());
        let engine = harness.builder().with_cancellation(token.clone()).build();
        token.cancel("shutting down");

        let err = engine
            .fanout(&EngineConfig::default(), minutes_after_base(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(reason) if reason == "shutting down"));
    }

    #[tokio::test]
    async fn test_store_unavailable() {
        let harness = EngineHarness::new([instant_subscriber("u1", DM, 10)]);
        harness.publish([sample_event(5, minutes_after_base(0))]);
        harness.store.set_available(false);
        let engine = harness.engine();
        let config = EngineConfig::default();

        let err = engine.fanout(&config, minutes_after_base(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Unavailable(_))));

        let cycle = engine.run_cycle(&config, minutes_after_base(1)).await;
        assert_eq!(cycle.errors.len(), 3);
        assert!(engine.health(&config, minutes_after_base(1)).await.is_err());

        let preflight = engine.preflight(&config).await;
        assert!(!preflight.store_reachable);
        assert!(preflight.store_error.is_some());

        harness.store.set_available(true);
        let cycle = engine.run_cycle(&config, minutes_after_base(2)).await;
        assert!(cycle.is_clean());
        assert_eq!(only_delivery(&harness).status, DeliveryStatus::Sent);
    }
}
