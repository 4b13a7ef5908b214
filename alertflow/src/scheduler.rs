//! Periodic cycle driver.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::engine::AlertEngine;
use crate::utils::now_utc;

/// Runs [`AlertEngine::run_cycle`] on a fixed interval until cancelled.
pub struct Scheduler {
    engine: Arc<AlertEngine>,
    config: EngineConfig,
    period: Duration,
    shutdown: Arc<CancellationToken>,
}

impl Scheduler {
    /// Creates a scheduler ticking every `period`.
    #[must_use]
    pub fn new(engine: Arc<AlertEngine>, config: EngineConfig, period: Duration) -> Self {
        Self {
            engine,
            config,
            period,
            shutdown: Arc::new(CancellationToken::new()),
        }
    }

    /// Uses an externally owned shutdown token.
    #[must_use]
    pub fn with_shutdown(mut self, token: Arc<CancellationToken>) -> Self {
        self.shutdown = token;
        self
    }

    /// Returns the token that stops the loop.
    #[must_use]
    pub fn shutdown_token(&self) -> Arc<CancellationToken> {
        self.shutdown.clone()
    }

    /// Runs preflight, then cycles until shutdown. Returns the number of
    /// cycles run.
    pub async fn run(self) -> anyhow::Result<u64> {
        let preflight = self.engine.preflight(&self.config).await;
        if !preflight.config_errors.is_empty() {
            anyhow::bail!("invalid configuration: {}", preflight.config_errors.join("; "));
        }
        for problem in preflight.problems() {
            warn!(%problem, "Preflight problem");
        }

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = 0_u64;

        info!(period_ms = self.period.as_millis() as u64, "Scheduler started");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.engine.run_cycle(&self.config, now_utc()).await;
            cycles += 1;
            for (phase, e) in &report.errors {
                error!(%phase, error = %e, "Stage failed to run");
            }
        }
        info!(cycles, reason = ?self.shutdown.reason(), "Scheduler stopped");
        Ok(cycles)
    }
}
