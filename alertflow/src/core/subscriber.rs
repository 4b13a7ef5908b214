//! Subscriber delivery configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{AlertEvent, Channel};

/// Per-channel settings for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Whether the subscriber wants alerts on this channel.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum deliveries per quota day.
    pub daily_quota: u32,
    /// Provider address (user handle, channel id, email).
    #[serde(default)]
    pub recipient: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ChannelSettings {
    /// Creates enabled settings with a recipient and quota.
    #[must_use]
    pub fn new(recipient: impl Into<String>, daily_quota: u32) -> Self {
        Self {
            enabled: true,
            daily_quota,
            recipient: Some(recipient.into()),
        }
    }

    /// Disables the channel.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A user's delivery configuration, supplied by the account collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Account identifier.
    pub user_id: String,
    /// Plan tier name, resolved against [`TierPolicy`](crate::config::TierPolicy).
    pub plan_tier: String,
    /// Channel settings keyed by channel.
    #[serde(default)]
    pub channels: BTreeMap<Channel, ChannelSettings>,
    /// Regions of interest. Empty means all regions.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Assets of interest. Empty means all assets.
    #[serde(default)]
    pub asset_tags: Vec<String>,
    /// Personal severity floor, applied on top of the tier's.
    #[serde(default)]
    pub min_severity: Option<u8>,
    /// Digest window length in minutes; 0 means instant delivery.
    #[serde(default)]
    pub digest_window_minutes: u32,
    /// Offset from UTC used for subscriber-local quota days.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

impl Subscriber {
    /// Creates a subscriber with no channels and no filters.
    #[must_use]
    pub fn new(user_id: impl Into<String>, plan_tier: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            plan_tier: plan_tier.into(),
            channels: BTreeMap::new(),
            regions: Vec::new(),
            asset_tags: Vec::new(),
            min_severity: None,
            digest_window_minutes: 0,
            utc_offset_minutes: None,
        }
    }

    /// Adds or replaces a channel.
    #[must_use]
    pub fn with_channel(mut self, channel: Channel, settings: ChannelSettings) -> Self {
        self.channels.insert(channel, settings);
        self
    }

    /// Moves the subscriber to another plan tier.
    #[must_use]
    pub fn with_plan_tier(mut self, tier: impl Into<String>) -> Self {
        self.plan_tier = tier.into();
        self
    }

    /// Restricts the subscriber to the given regions.
    #[must_use]
    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the subscriber to the given assets.
    #[must_use]
    pub fn with_asset_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.asset_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the personal severity floor.
    #[must_use]
    pub fn with_min_severity(mut self, severity: u8) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// Sets the digest window length.
    #[must_use]
    pub fn with_digest_window(mut self, minutes: u32) -> Self {
        self.digest_window_minutes = minutes;
        self
    }

    /// Sets the UTC offset used for local quota days.
    #[must_use]
    pub fn with_utc_offset(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = Some(minutes);
        self
    }

    /// Returns the settings for `channel`, if configured.
    #[must_use]
    pub fn channel(&self, channel: Channel) -> Option<&ChannelSettings> {
        self.channels.get(&channel)
    }

    /// Iterates over the channels the subscriber has enabled.
    pub fn enabled_channels(&self) -> impl Iterator<Item = (Channel, &ChannelSettings)> {
        self.channels
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(channel, settings)| (*channel, settings))
    }

    /// Applies the personal region, asset and severity filters.
    #[must_use]
    pub fn matches(&self, event: &AlertEvent) -> bool {
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        if !self.regions.is_empty() && !self.regions.iter().any(|r| r == &event.region) {
            return false;
        }
        if !self.asset_tags.is_empty()
            && !event
                .asset_tags
                .iter()
                .any(|tag| self.asset_tags.contains(tag))
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> AlertEvent {
        AlertEvent::new("liquidity", "eu", 5).with_asset_tags(["BTC", "ETH"])
    }

    #[test]
    fn test_no_filters_matches_everything() {
        let sub = Subscriber::new("u1", "pro");
        assert!(sub.matches(&event()));
    }

    #[test]
    fn test_region_filter() {
        assert!(Subscriber::new("u1", "pro").with_regions(["eu", "us"]).matches(&event()));
        assert!(!Subscriber::new("u1", "pro").with_regions(["apac"]).matches(&event()));
    }

    #[test]
    fn test_asset_filter_needs_overlap() {
        assert!(Subscriber::new("u1", "pro").with_asset_tags(["ETH"]).matches(&event()));
        assert!(!Subscriber::new("u1", "pro").with_asset_tags(["SOL"]).matches(&event()));
    }

    #[test]
    fn test_severity_floor() {
        assert!(Subscriber::new("u1", "pro").with_min_severity(5).matches(&event()));
        assert!(!Subscriber::new("u1", "pro").with_min_severity(6).matches(&event()));
    }

    #[test]
    fn test_enabled_channels() {
        let sub = Subscriber::new("u1", "pro")
            .with_channel(Channel::DirectMessage, ChannelSettings::new("@u1", 10))
            .with_channel(Channel::Email, ChannelSettings::new("u1@example.com", 10).disabled());
        let enabled: Vec<_> = sub.enabled_channels().map(|(c, _)| c).collect();
        assert_eq!(enabled, vec![Channel::DirectMessage]);
    }
}
