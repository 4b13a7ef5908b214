//! Engine configuration and kill-switches.
//!
//! A configuration is a plain snapshot. Entry points take it by reference on
//! every call, so operators can flip a kill-switch between passes and tests can
//! inject any combination deterministically.

use chrono::{Duration, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::core::{AlertEvent, Channel, Subscriber};
use crate::errors::ConfigError;
use crate::utils::Timestamp;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "ALERTFLOW_CONFIG";
/// Environment override for the master switch.
pub const ENABLED_ENV: &str = "ALERTFLOW_ENABLED";
/// Environment override for the circuit-breaker ceiling.
pub const CIRCUIT_CEILING_ENV: &str = "ALERTFLOW_CIRCUIT_CEILING";

/// External kill-switches checked at the start of every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitches {
    /// Master switch for the whole engine.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-channel switches. Channels not listed are enabled.
    #[serde(default)]
    pub channels: BTreeMap<Channel, bool>,
    /// Maximum transport calls per send pass.
    #[serde(default = "default_circuit_ceiling")]
    pub circuit_breaker_ceiling: u32,
    /// When set, only these subscribers receive sends.
    #[serde(default)]
    pub allowlist: Option<BTreeSet<String>>,
}

fn default_true() -> bool {
    true
}

fn default_circuit_ceiling() -> u32 {
    500
}

impl Default for KillSwitches {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: BTreeMap::new(),
            circuit_breaker_ceiling: default_circuit_ceiling(),
            allowlist: None,
        }
    }
}

impl KillSwitches {
    /// Returns true if `channel` may send.
    #[must_use]
    pub fn channel_enabled(&self, channel: Channel) -> bool {
        self.channels.get(&channel).copied().unwrap_or(true)
    }

    /// Returns the channels switched off.
    #[must_use]
    pub fn disabled_channels(&self) -> BTreeSet<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| !self.channel_enabled(*c))
            .collect()
    }
}

/// Retry and backoff settings for transient transport failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Transport calls allowed before a delivery fails terminally.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failure, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on the un-jittered delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter upper bound as a fraction of the delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    30_000
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter ratio.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }
}

/// Sliding-window limit for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed per window across the whole channel.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Calls allowed per window for a single recipient.
    #[serde(default)]
    pub per_recipient: Option<u32>,
}

impl RateLimitConfig {
    /// Creates a channel-wide limit.
    #[must_use]
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            per_recipient: None,
        }
    }

    /// Adds a per-recipient limit.
    #[must_use]
    pub fn with_per_recipient(mut self, limit: u32) -> Self {
        self.per_recipient = Some(limit);
        self
    }

    /// Returns the window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.window_ms).unwrap_or(i64::MAX))
    }
}

/// Eligibility rules for one plan tier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Categories the tier may receive. Empty means all.
    #[serde(default)]
    pub allowed_categories: Vec<String>,
    /// Lowest severity the tier receives.
    #[serde(default)]
    pub min_severity: u8,
}

impl TierPolicy {
    /// Creates a policy admitting every category at or above `min_severity`.
    #[must_use]
    pub fn new(min_severity: u8) -> Self {
        Self {
            allowed_categories: Vec::new(),
            min_severity,
        }
    }

    /// Restricts the tier to the given categories.
    #[must_use]
    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if the tier is entitled to `event`.
    #[must_use]
    pub fn allows(&self, event: &AlertEvent) -> bool {
        event.severity >= self.min_severity
            && (self.allowed_categories.is_empty()
                || self.allowed_categories.iter().any(|c| c == &event.category))
    }
}

/// Where the daily quota counter rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QuotaResetPolicy {
    /// Midnight UTC for everyone.
    #[default]
    UtcMidnight,
    /// Midnight at a fixed offset from UTC for everyone.
    FixedOffset {
        /// Offset from UTC in minutes.
        offset_minutes: i32,
    },
    /// Midnight in each subscriber's own offset, falling back to UTC.
    SubscriberLocal,
}

impl QuotaResetPolicy {
    /// Returns the quota day `now` falls in for `subscriber`.
    #[must_use]
    pub fn quota_day(&self, now: Timestamp, subscriber: &Subscriber) -> NaiveDate {
        let offset_minutes = match self {
            Self::UtcMidnight => 0,
            Self::FixedOffset { offset_minutes } => *offset_minutes,
            Self::SubscriberLocal => subscriber.utc_offset_minutes.unwrap_or(0),
        };
        FixedOffset::east_opt(offset_minutes.saturating_mul(60))
            .map_or_else(|| now.date_naive(), |tz| now.with_timezone(&tz).date_naive())
    }
}

/// Complete configuration snapshot for one engine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Kill-switches.
    #[serde(default)]
    pub kill_switches: KillSwitches,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-channel rate limits. Channels not listed are unlimited.
    #[serde(default)]
    pub rate_limits: BTreeMap<Channel, RateLimitConfig>,
    /// Eligibility per plan tier.
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, TierPolicy>,
    /// Quota day boundary.
    #[serde(default)]
    pub quota_reset: QuotaResetPolicy,
    /// Events read per fanout batch.
    #[serde(default = "default_fanout_batch_size")]
    pub fanout_batch_size: usize,
    /// Deliveries read per aggregation batch.
    #[serde(default = "default_aggregate_batch_size")]
    pub aggregate_batch_size: usize,
    /// Units claimed per send batch.
    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: usize,
    /// Transport calls in flight at once within a send pass.
    #[serde(default = "default_send_concurrency")]
    pub send_concurrency: usize,
    /// Transport call timeout in milliseconds.
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
    /// Wall-clock budget per stage invocation in milliseconds.
    #[serde(default)]
    pub stage_deadline_ms: Option<u64>,
    /// Hold an advisory lock per stage so the same stage never overlaps.
    #[serde(default = "default_true")]
    pub serialize_stages: bool,
    /// Trailing window for health counts, in hours.
    #[serde(default = "default_health_window_hours")]
    pub health_window_hours: u32,
}

fn default_tiers() -> BTreeMap<String, TierPolicy> {
    BTreeMap::from([
        ("free".to_string(), TierPolicy::new(7)),
        ("pro".to_string(), TierPolicy::new(1)),
        ("enterprise".to_string(), TierPolicy::new(1)),
    ])
}

fn default_fanout_batch_size() -> usize {
    500
}

fn default_aggregate_batch_size() -> usize {
    1000
}

fn default_send_batch_size() -> usize {
    100
}

fn default_send_concurrency() -> usize {
    8
}

fn default_transport_timeout_ms() -> u64 {
    10_000
}

fn default_health_window_hours() -> u32 {
    24
}

/// Longest retry delay or provider hint honoured: 30 days.
pub const MAX_RETRY_DELAY_MS: u64 = 30 * 24 * 60 * 60 * 1_000;
/// Longest rate-limit window: 30 days.
pub const MAX_RATE_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1_000;
/// Longest health reporting window: one year.
pub const MAX_HEALTH_WINDOW_HOURS: u32 = 366 * 24;
/// Longest stage deadline: one day.
pub const MAX_STAGE_DEADLINE_MS: u64 = 24 * 60 * 60 * 1_000;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kill_switches: KillSwitches::default(),
            retry: RetryConfig::default(),
            rate_limits: BTreeMap::new(),
            tiers: default_tiers(),
            quota_reset: QuotaResetPolicy::default(),
            fanout_batch_size: default_fanout_batch_size(),
            aggregate_batch_size: default_aggregate_batch_size(),
            send_batch_size: default_send_batch_size(),
            send_concurrency: default_send_concurrency(),
            transport_timeout_ms: default_transport_timeout_ms(),
            stage_deadline_ms: None,
            serialize_stages: true,
            health_window_hours: default_health_window_hours(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// Reads the file named by [`CONFIG_PATH_ENV`] if set, then applies the
    /// [`ENABLED_ENV`] and [`CIRCUIT_CEILING_ENV`] overrides.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(raw) = lookup(ENABLED_ENV) {
            config.kill_switches.enabled = parse_bool(ENABLED_ENV, &raw)?;
        }
        if let Some(raw) = lookup(CIRCUIT_CEILING_ENV) {
            config.kill_switches.circuit_breaker_ceiling = raw
                .trim()
                .parse()
                .map_err(|_| {
                    ConfigError::invalid(CIRCUIT_CEILING_ENV, format!("not a number: {raw}"))
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.retry.max_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                format!("must not exceed {MAX_RETRY_DELAY_MS}"),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(ConfigError::invalid("retry.jitter_ratio", "must be within [0, 1]"));
        }
        for (field, value) in [
            ("fanout_batch_size", self.fanout_batch_size),
            ("aggregate_batch_size", self.aggregate_batch_size),
            ("send_batch_size", self.send_batch_size),
            ("send_concurrency", self.send_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        for (channel, limit) in &self.rate_limits {
            if limit.window_ms == 0 || limit.window_ms > MAX_RATE_WINDOW_MS {
                return Err(ConfigError::invalid(
                    format!("rate_limits.{channel}.window_ms"),
                    format!("must be within [1, {MAX_RATE_WINDOW_MS}]"),
                ));
            }
        }
        if self.health_window_hours > MAX_HEALTH_WINDOW_HOURS {
            return Err(ConfigError::invalid(
                "health_window_hours",
                format!("must not exceed {MAX_HEALTH_WINDOW_HOURS}"),
            ));
        }
        if self.stage_deadline_ms.is_some_and(|ms| ms > MAX_STAGE_DEADLINE_MS) {
            return Err(ConfigError::invalid(
                "stage_deadline_ms",
                format!("must not exceed {MAX_STAGE_DEADLINE_MS}"),
            ));
        }
        Ok(())
    }

    /// Returns the tier policy for `tier`.
    #[must_use]
    pub fn tier(&self, tier: &str) -> Option<&TierPolicy> {
        self.tiers.get(tier)
    }

    /// Returns the stage deadline, if any.
    #[must_use]
    pub fn stage_deadline(&self) -> Option<std::time::Duration> {
        self.stage_deadline_ms.map(std::time::Duration::from_millis)
    }

    /// Returns the transport call timeout.
    #[must_use]
    pub fn transport_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.transport_timeout_ms)
    }

    /// Sets the master switch.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.kill_switches.enabled = enabled;
        self
    }

    /// Sets a channel switch.
    #[must_use]
    pub fn with_channel_enabled(mut self, channel: Channel, enabled: bool) -> Self {
        self.kill_switches.channels.insert(channel, enabled);
        self
    }

    /// Sets the circuit-breaker ceiling.
    #[must_use]
    pub fn with_circuit_ceiling(mut self, ceiling: u32) -> Self {
        self.kill_switches.circuit_breaker_ceiling = ceiling;
        self
    }

    /// Restricts sends to the given subscribers.
    #[must_use]
    pub fn with_allowlist<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kill_switches.allowlist = Some(users.into_iter().map(Into::into).collect());
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets a channel rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, channel: Channel, limit: RateLimitConfig) -> Self {
        self.rate_limits.insert(channel, limit);
        self
    }

    /// Sets a tier policy.
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>, policy: TierPolicy) -> Self {
        self.tiers.insert(tier.into(), policy);
        self
    }

    /// Sets the quota reset policy.
    #[must_use]
    pub fn with_quota_reset(mut self, policy: QuotaResetPolicy) -> Self {
        self.quota_reset = policy;
        self
    }

    /// Turns the per-stage advisory lock on or off.
    #[must_use]
    pub fn with_serialized_stages(mut self, serialize: bool) -> Self {
        self.serialize_stages = serialize;
        self
    }

    /// Sets the send batch size.
    #[must_use]
    pub fn with_send_batch_size(mut self, size: usize) -> Self {
        self.send_batch_size = size;
        self
    }

    /// Sets the stage deadline.
    #[must_use]
    pub fn with_stage_deadline_ms(mut self, deadline: u64) -> Self {
        self.stage_deadline_ms = Some(deadline);
        self
    }
}

fn parse_bool(field: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(field, format!("not a boolean: {other}"))),
    }
}
