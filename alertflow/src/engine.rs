//! Engine entry points.
//!
//! Every stage entry point follows the same shape: check the kill-switch,
//! take the stage's advisory lock, run, record an [`EngineRun`], emit events.
//! The configuration is a snapshot passed in on each call.

use std::sync::Arc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::core::{
    Channel, Delivery, EngineRun, Phase, RunStatus, StageReport, StageStats,
};
use crate::directory::SubscriberDirectory;
use crate::errors::{EngineError, Result};
use crate::events::{EngineEvent, EventSink, NoOpEventSink};
use crate::health::{FailedDelivery, HealthReport, PreflightReport};
use crate::observability::stage_span;
use crate::pipeline::{
    AggregateStage, FanoutStage, SendStage, StageContext, StageLockGuard, StopReason,
};
use crate::store::DeliveryStore;
use crate::transport::{MessageRenderer, PlainRenderer, Transport, TransportRegistry};
use crate::utils::{now_utc, saturating_sub, Timestamp};

/// Failed deliveries listed in a health report.
const HEALTH_FAILED_LIMIT: usize = 100;

/// Results of one fanout, aggregate and send sequence.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Reports from stages that ran, in order.
    pub reports: Vec<StageReport>,
    /// Stages that could not start.
    pub errors: Vec<(Phase, EngineError)>,
}

impl CycleReport {
    /// Returns the report for `phase`, if it ran.
    #[must_use]
    pub fn report(&self, phase: Phase) -> Option<&StageReport> {
        self.reports.iter().find(|r| r.phase == phase)
    }

    /// Returns true if every stage ran to completion.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.reports.iter().all(|r| r.status == RunStatus::Completed)
    }
}

/// Builder for [`AlertEngine`].
pub struct AlertEngineBuilder {
    store: Arc<dyn DeliveryStore>,
    directory: Arc<dyn SubscriberDirectory>,
    transports: TransportRegistry,
    renderer: Arc<dyn MessageRenderer>,
    events: Arc<dyn EventSink>,
    cancel: Option<Arc<CancellationToken>>,
}

impl AlertEngineBuilder {
    /// Registers a transport adapter.
    #[must_use]
    pub fn with_transport(mut self, channel: Channel, transport: Arc<dyn Transport>) -> Self {
        self.transports.register(channel, transport);
        self
    }

    /// Replaces the transport registry.
    #[must_use]
    pub fn with_transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = transports;
        self
    }

    /// Sets the message renderer.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn MessageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Attaches a cancellation token checked by every stage.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> AlertEngine {
        AlertEngine {
            store: self.store,
            directory: self.directory,
            transports: self.transports,
            renderer: self.renderer,
            events: self.events,
            cancel: self.cancel,
        }
    }
}

/// The alert delivery engine.
///
/// Stateless between invocations apart from the rate-limit windows; all other
/// state lives in the store.
pub struct AlertEngine {
    store: Arc<dyn DeliveryStore>,
    directory: Arc<dyn SubscriberDirectory>,
    transports: TransportRegistry,
    renderer: Arc<dyn MessageRenderer>,
    events: Arc<dyn EventSink>,
    cancel: Option<Arc<CancellationToken>>,
}

impl std::fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEngine")
            .field("transports", &self.transports)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl AlertEngine {
    /// Starts building an engine over a store and a subscriber directory.
    #[must_use]
    pub fn builder(
        store: Arc<dyn DeliveryStore>,
        directory: Arc<dyn SubscriberDirectory>,
    ) -> AlertEngineBuilder {
        AlertEngineBuilder {
            store,
            directory,
            transports: TransportRegistry::new(),
            renderer: Arc::new(PlainRenderer),
            events: Arc::new(NoOpEventSink),
            cancel: None,
        }
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    /// Expands new events into deliveries.
    pub async fn fanout(&self, config: &EngineConfig, now: Timestamp) -> Result<StageReport> {
        self.run_stage(Phase::Fanout, config, now).await
    }

    /// Groups closed-window digest deliveries into digests.
    pub async fn aggregate_digests(
        &self,
        config: &EngineConfig,
        now: Timestamp,
    ) -> Result<StageReport> {
        self.run_stage(Phase::Aggregate, config, now).await
    }

    /// Sends due deliveries and digests.
    pub async fn send(&self, config: &EngineConfig, now: Timestamp) -> Result<StageReport> {
        self.run_stage(Phase::Send, config, now).await
    }

    /// Runs fanout, aggregation and send in order.
    ///
    /// A stage that cannot start does not stop the others.
    pub async fn run_cycle(&self, config: &EngineConfig, now: Timestamp) -> CycleReport {
        let mut cycle = CycleReport::default();
        for phase in Phase::ALL {
            match self.run_stage(phase, config, now).await {
                Ok(report) => cycle.reports.push(report),
                Err(e) => {
                    warn!(%phase, error = %e, "Stage could not run");
                    cycle.errors.push((phase, e));
                }
            }
        }
        cycle
    }

    /// Reports delivery counts, outstanding digests, latest runs and failures
    /// over the configured trailing window ending at `now`.
    pub async fn health(&self, config: &EngineConfig, now: Timestamp) -> Result<HealthReport> {
        let window_start =
            saturating_sub(now, chrono::Duration::hours(i64::from(config.health_window_hours)));
        let deliveries = self.store.delivery_counts(window_start).await?;
        let pending_digests = self.store.pending_digest_count().await?;
        let latest_runs = self.store.latest_runs().await?;
        let failed = self
            .store
            .failed_deliveries(window_start, HEALTH_FAILED_LIMIT)
            .await?
            .iter()
            .map(FailedDelivery::from)
            .collect();

        Ok(HealthReport {
            generated_at: now,
            window_start,
            engine_enabled: config.kill_switches.enabled,
            disabled_channels: config.kill_switches.disabled_channels().into_iter().collect(),
            deliveries,
            pending_digests,
            latest_runs,
            failed,
        })
    }

    /// Checks configuration, adapters and store reachability.
    pub async fn preflight(&self, config: &EngineConfig) -> PreflightReport {
        let config_errors = config
            .validate()
            .err()
            .map(|e| vec![e.to_string()])
            .unwrap_or_default();
        let channels_without_transport = Channel::ALL
            .into_iter()
            .filter(|c| config.kill_switches.channel_enabled(*c) && !self.transports.contains(*c))
            .collect();
        let ping = self.store.ping().await;

        PreflightReport {
            engine_enabled: config.kill_switches.enabled,
            config_errors,
            channels_without_transport,
            store_reachable: ping.is_ok(),
            store_error: ping.err().map(|e| e.to_string()),
        }
    }

    /// Puts a failed delivery with attempts left back on the queue.
    pub async fn requeue_failed(
        &self,
        config: &EngineConfig,
        delivery_id: Uuid,
        now: Timestamp,
    ) -> Result<Delivery> {
        let delivery = self
            .store
            .requeue_failed(delivery_id, config.retry.max_attempts, now)
            .await?;
        info!(%delivery_id, attempts = delivery.attempts, "Failed delivery requeued");
        Ok(delivery)
    }

    async fn run_stage(
        &self,
        phase: Phase,
        config: &EngineConfig,
        now: Timestamp,
    ) -> Result<StageReport> {
        let run = EngineRun::start(phase, now_utc());

        if !config.kill_switches.enabled {
            return Ok(self.record_disabled(run, "engine disabled by kill-switch").await);
        }
        config.validate()?;
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled(token.reason().unwrap_or_default()));
            }
        }

        let _lock = if config.serialize_stages {
            Some(StageLockGuard::acquire(self.store.clone(), phase, run.id).await?)
        } else {
            None
        };

        let ctx = StageContext::new(run.id, phase)
            .with_budget(config.stage_deadline())
            .with_cancellation(self.cancel.clone());
        self.events.try_emit(&EngineEvent::StageStarted {
            run_id: run.id,
            phase,
        });

        let mut stats = StageStats::default();
        let result = self
            .execute(phase, config, now, &ctx, &mut stats)
            .instrument(stage_span(phase, run.id))
            .await;

        let (status, reason) = match &result {
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
            Ok(()) => match partial_reason(&stats, &ctx) {
                Some(reason) => (RunStatus::Partial, Some(reason)),
                None => (RunStatus::Completed, None),
            },
        };
        let mut run = run.finish(status, stats, now_utc());
        if let Err(e) = &result {
            run = run.with_error(e.to_string());
        }
        self.record(&run).await;

        info!(
            %phase,
            run_id = %run.id,
            %status,
            stats = ?run.stats,
            "Stage finished"
        );
        self.events.try_emit(&EngineEvent::StageCompleted {
            run_id: run.id,
            phase,
            status,
            stats: run.stats.clone(),
        });

        result.map(|()| StageReport::from_run(&run, reason))
    }

    async fn execute(
        &self,
        phase: Phase,
        config: &EngineConfig,
        now: Timestamp,
        ctx: &StageContext,
        stats: &mut StageStats,
    ) -> Result<()> {
        match phase {
            Phase::Fanout => {
                FanoutStage::new(self.store.as_ref(), self.directory.as_ref(), config, ctx)
                    .run(now, stats)
                    .await
            }
            Phase::Aggregate => {
                AggregateStage::new(self.store.as_ref(), self.events.as_ref(), config, ctx)
                    .run(now, stats)
                    .await
            }
            Phase::Send => {
                SendStage::new(
                    self.store.as_ref(),
                    self.directory.as_ref(),
                    &self.transports,
                    self.renderer.as_ref(),
                    self.events.as_ref(),
                    config,
                    ctx,
                )
                .run(now, stats)
                .await
            }
        }
    }

    async fn record_disabled(&self, run: EngineRun, reason: &str) -> StageReport {
        let phase = run.phase;
        let run = run.finish(RunStatus::Disabled, StageStats::default(), now_utc());
        info!(%phase, %reason, "Stage disabled");
        self.record(&run).await;
        self.events.try_emit(&EngineEvent::StageDisabled {
            run_id: run.id,
            phase,
            reason: reason.to_string(),
        });
        StageReport::from_run(&run, Some(reason.to_string()))
    }

    async fn record(&self, run: &EngineRun) {
        if let Err(e) = self.store.record_run(run).await {
            warn!(run_id = %run.id, phase = %run.phase, error = %e, "Failed to record engine run");
        }
    }
}

fn partial_reason(stats: &StageStats, ctx: &StageContext) -> Option<String> {
    if stats.circuit_tripped {
        return Some("circuit breaker ceiling reached".to_string());
    }
    if stats.deadline_hit {
        return Some(match ctx.stop_reason() {
            Some(StopReason::Cancelled(reason)) => format!("cancelled: {reason}"),
            _ => "stage deadline reached".to_string(),
        });
    }
    if stats.errors > 0 {
        return Some(format!("{} units released after store errors", stats.errors));
    }
    None
}
