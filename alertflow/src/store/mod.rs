//! Durable store contract.
//!
//! The pipeline never hands data between stages in memory. Every stage reads
//! the previous stage's output through [`DeliveryStore`], and every mutation
//! that must be atomic (unique insert with quota, claim with skip, outcome
//! with claim release) is a single trait call so a backend can map it onto a
//! single transaction.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::core::{
    AlertEvent, Channel, Delivery, DeliveryStatus, Digest, EngineRun, EventCursor, Phase,
    SendOutcome,
};
use crate::errors::StoreError;
use crate::pipeline::RateLimitResult;
use crate::utils::{TimeWindow, Timestamp};

/// Quota a delivery insert must fit into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaReservation {
    /// Quota day the insert is charged to.
    pub day: NaiveDate,
    /// Deliveries allowed for the subscriber and channel on that day.
    pub limit: u32,
}

/// Result of a delivery insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Row inserted and quota charged.
    Inserted,
    /// A delivery with the same key already exists. Quota untouched.
    Duplicate,
    /// The quota day is full. Nothing inserted.
    QuotaExhausted,
}

/// Result of attaching deliveries to a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    /// The digest after the attach.
    pub digest: Digest,
    /// True if this call created the digest.
    pub created: bool,
    /// Deliveries now members of the digest.
    pub attached: Vec<Uuid>,
    /// Deliveries converted to instant because the digest had already left
    /// `pending` or was claimed by a send pass.
    pub late: Vec<Uuid>,
}

/// Units a send pass must not claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Channels switched off by the operator.
    pub disabled_channels: BTreeSet<Channel>,
    /// If set, only these subscribers are claimable.
    pub allowlist: Option<BTreeSet<String>>,
}

impl ClaimFilter {
    /// Returns true if a unit for `user_id` on `channel` may be claimed.
    #[must_use]
    pub fn admits(&self, user_id: &str, channel: Channel) -> bool {
        !self.disabled_channels.contains(&channel)
            && self
                .allowlist
                .as_ref()
                .map_or(true, |list| list.contains(user_id))
    }
}

/// A claimed digest together with its member deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedDigest {
    /// The digest.
    pub digest: Digest,
    /// Member deliveries, oldest event first.
    pub members: Vec<Delivery>,
}

/// Delivery counts keyed by channel and status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounts {
    /// Count per channel and status.
    pub by_channel: BTreeMap<Channel, BTreeMap<DeliveryStatus, u64>>,
}

impl DeliveryCounts {
    /// Adds one delivery to the tally.
    pub fn record(&mut self, channel: Channel, status: DeliveryStatus) {
        *self
            .by_channel
            .entry(channel)
            .or_default()
            .entry(status)
            .or_default() += 1;
    }

    /// Returns the count for one channel and status.
    #[must_use]
    pub fn get(&self, channel: Channel, status: DeliveryStatus) -> u64 {
        self.by_channel
            .get(&channel)
            .and_then(|m| m.get(&status))
            .copied()
            .unwrap_or(0)
    }

    /// Returns the count for a status across all channels.
    #[must_use]
    pub fn total(&self, status: DeliveryStatus) -> u64 {
        self.by_channel
            .values()
            .filter_map(|m| m.get(&status))
            .sum()
    }
}

/// The durable store behind every stage.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Reads events strictly after `cursor` and created at or before `until`,
    /// ordered by cursor.
    async fn events_after(
        &self,
        cursor: Option<EventCursor>,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<AlertEvent>, StoreError>;

    /// Looks up events by id. Missing ids are absent from the map.
    async fn events_by_id(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, AlertEvent>, StoreError>;

    /// Returns the fanout low-watermark.
    async fn fanout_watermark(&self) -> Result<Option<EventCursor>, StoreError>;

    /// Moves the fanout watermark forward. Never moves it backwards.
    async fn advance_fanout_watermark(&self, cursor: EventCursor) -> Result<(), StoreError>;

    /// Inserts a delivery under its uniqueness key, charging quota in the same
    /// step.
    async fn insert_delivery(
        &self,
        delivery: Delivery,
        quota: QuotaReservation,
    ) -> Result<InsertOutcome, StoreError>;

    /// Returns queued digest-kind deliveries without a digest whose window has
    /// closed at `now`, oldest window first.
    async fn unbatched_digest_deliveries(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError>;

    /// Creates or fetches the digest for `(user_id, channel, window.start)` and
    /// attaches `member_ids`.
    async fn attach_to_digest(
        &self,
        user_id: &str,
        channel: Channel,
        window: TimeWindow,
        member_ids: &[Uuid],
        now: Timestamp,
    ) -> Result<AttachOutcome, StoreError>;

    /// Claims due instant deliveries, skipping rows already claimed.
    async fn claim_due_deliveries(
        &self,
        now: Timestamp,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError>;

    /// Claims due digests with their members, skipping rows already claimed.
    async fn claim_due_digests(
        &self,
        now: Timestamp,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<ClaimedDigest>, StoreError>;

    /// Applies an outcome to a claimed delivery and releases the claim.
    async fn complete_delivery(
        &self,
        id: Uuid,
        outcome: &SendOutcome,
        now: Timestamp,
    ) -> Result<Delivery, StoreError>;

    /// Applies an outcome to a claimed digest and its members and releases the
    /// claim.
    async fn complete_digest(
        &self,
        id: Uuid,
        outcome: &SendOutcome,
        now: Timestamp,
    ) -> Result<Digest, StoreError>;

    /// Releases a delivery claim without changing the row.
    fn release_delivery(&self, id: Uuid);

    /// Releases a digest claim without changing the row.
    fn release_digest(&self, id: Uuid);

    /// Takes the advisory lock for `phase` without waiting.
    async fn try_lock_stage(&self, phase: Phase, holder: Uuid) -> Result<bool, StoreError>;

    /// Releases the advisory lock for `phase` if `holder` owns it.
    fn unlock_stage(&self, phase: Phase, holder: Uuid);

    /// Appends a run record.
    async fn record_run(&self, run: &EngineRun) -> Result<(), StoreError>;

    /// Returns the most recent run per phase.
    async fn latest_runs(&self) -> Result<BTreeMap<Phase, EngineRun>, StoreError>;

    /// Counts deliveries updated at or after `since`.
    async fn delivery_counts(&self, since: Timestamp) -> Result<DeliveryCounts, StoreError>;

    /// Counts digests still pending.
    async fn pending_digest_count(&self) -> Result<u64, StoreError>;

    /// Returns failed deliveries updated at or after `since`, newest first.
    async fn failed_deliveries(
        &self,
        since: Timestamp,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError>;

    /// Fetches one delivery.
    async fn get_delivery(&self, id: Uuid) -> Result<Option<Delivery>, StoreError>;

    /// Fetches one digest.
    async fn get_digest(&self, id: Uuid) -> Result<Option<Digest>, StoreError>;

    /// Moves a failed delivery with attempts left back to the queue.
    async fn requeue_failed(
        &self,
        id: Uuid,
        max_attempts: u32,
        now: Timestamp,
    ) -> Result<Delivery, StoreError>;

    /// Checks the channel and recipient windows for one transport call and,
    /// if both have room, charges them in the same step.
    ///
    /// Every engine sharing the store sees the same windows. A denied call
    /// charges nothing.
    async fn reserve_send_slot(
        &self,
        channel: Channel,
        recipient: &str,
        limits: &RateLimitConfig,
        now: Timestamp,
    ) -> Result<RateLimitResult, StoreError>;

    /// Drops expired window entries and windows for unconfigured channels.
    /// Returns the number of recipient windows dropped.
    async fn expire_rate_windows(
        &self,
        limits: &BTreeMap<Channel, RateLimitConfig>,
        now: Timestamp,
    ) -> Result<usize, StoreError>;
}
