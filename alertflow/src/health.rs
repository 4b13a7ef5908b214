//! Health and preflight reports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::{Channel, Delivery, EngineRun, Phase};
use crate::store::DeliveryCounts;
use crate::utils::Timestamp;

/// A terminally failed delivery, surfaced for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDelivery {
    /// Delivery id.
    pub id: Uuid,
    /// Subscriber.
    pub user_id: String,
    /// Channel.
    pub channel: Channel,
    /// Transport calls made.
    pub attempts: u32,
    /// Last provider error.
    pub last_error: Option<String>,
    /// When it failed.
    pub failed_at: Timestamp,
}

impl From<&Delivery> for FailedDelivery {
    fn from(d: &Delivery) -> Self {
        Self {
            id: d.id,
            user_id: d.user_id.clone(),
            channel: d.channel,
            attempts: d.attempts,
            last_error: d.last_error.clone(),
            failed_at: d.updated_at,
        }
    }
}

/// Snapshot of engine health over a trailing window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Time the report describes.
    pub generated_at: Timestamp,
    /// Start of the trailing window.
    pub window_start: Timestamp,
    /// Master switch state.
    pub engine_enabled: bool,
    /// Channels switched off.
    pub disabled_channels: Vec<Channel>,
    /// Deliveries touched in the window, by channel and status.
    pub deliveries: DeliveryCounts,
    /// Digests not yet sent or failed.
    pub pending_digests: u64,
    /// Most recent run per stage.
    pub latest_runs: BTreeMap<Phase, EngineRun>,
    /// Terminal failures in the window, newest first.
    pub failed: Vec<FailedDelivery>,
}

/// Readiness check run before the scheduler starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    /// Master switch state.
    pub engine_enabled: bool,
    /// Configuration problems.
    pub config_errors: Vec<String>,
    /// Enabled channels with no transport adapter.
    pub channels_without_transport: Vec<Channel>,
    /// Whether the store answered a ping.
    pub store_reachable: bool,
    /// Store error, if the ping failed.
    pub store_error: Option<String>,
}

impl PreflightReport {
    /// Returns true if nothing blocks the engine from running.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.config_errors.is_empty()
            && self.channels_without_transport.is_empty()
            && self.store_reachable
    }

    /// Lists every problem as a sentence.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = self.config_errors.clone();
        problems.extend(
            self.channels_without_transport
                .iter()
                .map(|c| format!("channel {c} is enabled but has no transport")),
        );
        if !self.store_reachable {
            problems.push(format!(
                "store unreachable: {}",
                self.store_error.as_deref().unwrap_or("unknown error")
            ));
        }
        problems
    }
}
