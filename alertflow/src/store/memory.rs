//! In-memory store.
//!
//! All state sits behind one mutex, so every trait call is atomic the way a
//! single database transaction would be. Row claims and advisory stage locks
//! are emulated with claim sets and a holder map. Rate windows live in a
//! [`RateLimiter`] beside the state and are charged atomically per entry.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{
    AttachOutcome, ClaimFilter, ClaimedDigest, DeliveryCounts, DeliveryStore, InsertOutcome,
    QuotaReservation,
};
use crate::config::RateLimitConfig;
use crate::core::{
    digest_key, AlertEvent, Channel, Delivery, DeliveryKey, DeliveryKind, DeliveryStatus, Digest,
    DigestStatus, EngineRun, EventCursor, Phase, SendOutcome,
};
use crate::errors::StoreError;
use crate::pipeline::{RateLimitResult, RateLimiter};
use crate::utils::{TimeWindow, Timestamp};

type QuotaKey = (String, Channel, NaiveDate);

#[derive(Debug, Default)]
struct State {
    events: BTreeMap<EventCursor, AlertEvent>,
    event_index: HashMap<Uuid, EventCursor>,
    watermark: Option<EventCursor>,
    deliveries: HashMap<Uuid, Delivery>,
    delivery_keys: HashMap<DeliveryKey, Uuid>,
    quota_used: HashMap<QuotaKey, u32>,
    digests: HashMap<Uuid, Digest>,
    digest_keys: HashMap<String, Uuid>,
    claimed_deliveries: HashSet<Uuid>,
    claimed_digests: HashSet<Uuid>,
    stage_locks: HashMap<Phase, Uuid>,
    runs: Vec<EngineRun>,
}

/// Reference [`DeliveryStore`] kept entirely in memory.
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<State>,
    rate_windows: RateLimiter,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            rate_windows: RateLimiter::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event to the intake log.
    pub fn append_event(&self, event: AlertEvent) {
        let mut state = self.state.lock();
        let cursor = event.cursor();
        state.event_index.insert(event.id, cursor);
        state.events.insert(cursor, event);
    }

    /// Writes a delivery directly, bypassing fanout.
    pub fn put_delivery(&self, delivery: Delivery) {
        let mut state = self.state.lock();
        state.delivery_keys.insert(delivery.key(), delivery.id);
        state.deliveries.insert(delivery.id, delivery);
    }

    /// Makes every async call fail with [`StoreError::Unavailable`] while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns all deliveries, oldest first.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        let mut all: Vec<_> = self.state.lock().deliveries.values().cloned().collect();
        all.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        all
    }

    /// Returns all digests, oldest window first.
    #[must_use]
    pub fn digests(&self) -> Vec<Digest> {
        let mut all: Vec<_> = self.state.lock().digests.values().cloned().collect();
        all.sort_by(|a, b| (a.window_start, a.id).cmp(&(b.window_start, b.id)));
        all
    }

    /// Returns every recorded run in insertion order.
    #[must_use]
    pub fn runs(&self) -> Vec<EngineRun> {
        self.state.lock().runs.clone()
    }

    /// Returns the quota charged for a subscriber, channel and day.
    #[must_use]
    pub fn quota_used(&self, user_id: &str, channel: Channel, day: NaiveDate) -> u32 {
        self.state
            .lock()
            .quota_used
            .get(&(user_id.to_string(), channel, day))
            .copied()
            .unwrap_or(0)
    }

    /// Returns the number of recipients with a live rate window.
    #[must_use]
    pub fn tracked_recipients(&self) -> usize {
        self.rate_windows.tracked_recipients()
    }

    /// Returns the number of outstanding delivery and digest claims.
    #[must_use]
    pub fn outstanding_claims(&self) -> usize {
        let state = self.state.lock();
        state.claimed_deliveries.len() + state.claimed_digests.len()
    }

    /// Returns the holder of a stage lock.
    #[must_use]
    pub fn stage_holder(&self, phase: Phase) -> Option<Uuid> {
        self.state.lock().stage_locks.get(&phase).copied()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }
}

impl State {
    fn digest_accepts_members(&self, digest: &Digest) -> bool {
        digest.status == DigestStatus::Pending
            && digest.attempts == 0
            && !self.claimed_digests.contains(&digest.id)
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn events_after(
        &self,
        cursor: Option<EventCursor>,
        until: Timestamp,
        limit: usize,
    ) -> Result<Vec<AlertEvent>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let events = state
            .events
            .iter()
            .filter(|(c, _)| cursor.map_or(true, |after| **c > after))
            .map(|(_, e)| e)
            .take_while(|e| e.created_at <= until)
            .take(limit)
            .cloned()
            .collect();
        Ok(events)
    }

    async fn events_by_id(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, AlertEvent>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.event_index.get(id))
            .filter_map(|cursor| state.events.get(cursor))
            .map(|e| (e.id, e.clone()))
            .collect())
    }

    async fn fanout_watermark(&self) -> Result<Option<EventCursor>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().watermark)
    }

    async fn advance_fanout_watermark(&self, cursor: EventCursor) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.watermark.map_or(true, |current| cursor > current) {
            state.watermark = Some(cursor);
        }
        Ok(())
    }

    async fn insert_delivery(
        &self,
        delivery: Delivery,
        quota: QuotaReservation,
    ) -> Result<InsertOutcome, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();

        let key = delivery.key();
        if state.delivery_keys.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }

        let quota_key = (delivery.user_id.clone(), delivery.channel, quota.day);
        let used = state.quota_used.get(&quota_key).copied().unwrap_or(0);
        if used >= quota.limit {
            return Ok(InsertOutcome::QuotaExhausted);
        }

        state.quota_used.insert(quota_key, used + 1);
        state.delivery_keys.insert(key, delivery.id);
        state.deliveries.insert(delivery.id, delivery);
        Ok(InsertOutcome::Inserted)
    }

    async fn unbatched_digest_deliveries(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let mut pending: Vec<_> = state
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Queued
                    && d.delivery_kind == DeliveryKind::Digest
                    && d.digest_id.is_none()
                    && d.window.is_some_and(|w| w.is_closed(now))
                    && !state.claimed_deliveries.contains(&d.id)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|d| (d.window, d.event_created_at, d.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn attach_to_digest(
        &self,
        user_id: &str,
        channel: Channel,
        window: TimeWindow,
        member_ids: &[Uuid],
        now: Timestamp,
    ) -> Result<AttachOutcome, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();

        let key = digest_key(user_id, channel, window.start);
        let (digest_id, created) = match state.digest_keys.get(&key) {
            Some(id) => (*id, false),
            None => {
                let digest = Digest::new(user_id, channel, window, now);
                let id = digest.id;
                state.digest_keys.insert(key, id);
                state.digests.insert(id, digest);
                (id, true)
            }
        };

        let digest = state
            .digests
            .get(&digest_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "digest",
                id: digest_id,
            })?;
        let accepts = state.digest_accepts_members(&digest);

        let mut attached = Vec::new();
        let mut late = Vec::new();
        for id in member_ids {
            let eligible = !state.claimed_deliveries.contains(id)
                && state.deliveries.get(id).is_some_and(|d| {
                    d.status == DeliveryStatus::Queued
                        && d.delivery_kind == DeliveryKind::Digest
                        && d.digest_id.is_none()
                        && d.user_id == user_id
                        && d.channel == channel
                        && d.window == Some(window)
                });
            if !eligible {
                continue;
            }
            let Some(delivery) = state.deliveries.get_mut(id) else {
                continue;
            };
            if accepts {
                delivery.digest_id = Some(digest_id);
                attached.push(*id);
            } else {
                delivery.delivery_kind = DeliveryKind::Instant;
                late.push(*id);
            }
            delivery.updated_at = now;
        }

        let digest = match state.digests.get_mut(&digest_id) {
            Some(digest) => {
                digest.member_ids.extend(attached.iter().copied());
                digest.event_count = u32::try_from(digest.member_ids.len()).unwrap_or(u32::MAX);
                digest.clone()
            }
            None => digest,
        };

        Ok(AttachOutcome {
            digest,
            created,
            attached,
            late,
        })
    }

    async fn claim_due_deliveries(
        &self,
        now: Timestamp,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let mut due: Vec<_> = state
            .deliveries
            .values()
            .filter(|d| {
                d.delivery_kind == DeliveryKind::Instant
                    && d.is_due(now)
                    && !state.claimed_deliveries.contains(&d.id)
                    && filter.admits(&d.user_id, d.channel)
            })
            .cloned()
            .collect();
        due.sort_by_key(|d| (d.next_retry_at.unwrap_or(d.created_at), d.created_at, d.id));
        due.truncate(limit);
        for d in &due {
            state.claimed_deliveries.insert(d.id);
        }
        Ok(due)
    }

    async fn claim_due_digests(
        &self,
        now: Timestamp,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<ClaimedDigest>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let mut due: Vec<_> = state
            .digests
            .values()
            .filter(|d| {
                d.is_due(now)
                    && !state.claimed_digests.contains(&d.id)
                    && filter.admits(&d.user_id, d.channel)
            })
            .cloned()
            .collect();
        due.sort_by_key(|d| (d.window_end, d.id));
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for digest in due {
            state.claimed_digests.insert(digest.id);
            let mut members: Vec<_> = digest
                .member_ids
                .iter()
                .filter_map(|id| state.deliveries.get(id))
                .filter(|d| d.status == DeliveryStatus::Queued)
                .cloned()
                .collect();
            members.sort_by_key(|d| (d.event_created_at, d.id));
            claimed.push(ClaimedDigest { digest, members });
        }
        Ok(claimed)
    }

    async fn complete_delivery(
        &self,
        id: Uuid,
        outcome: &SendOutcome,
        now: Timestamp,
    ) -> Result<Delivery, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.claimed_deliveries.remove(&id) {
            return Err(StoreError::ClaimNotHeld { id });
        }
        let delivery = state.deliveries.get_mut(&id).ok_or(StoreError::NotFound {
            kind: "delivery",
            id,
        })?;
        let mut updated = delivery.clone();
        updated.apply(outcome, now)?;
        *delivery = updated.clone();
        Ok(updated)
    }

    async fn complete_digest(
        &self,
        id: Uuid,
        outcome: &SendOutcome,
        now: Timestamp,
    ) -> Result<Digest, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.claimed_digests.remove(&id) {
            return Err(StoreError::ClaimNotHeld { id });
        }

        let mut digest = state
            .digests
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "digest", id })?;
        digest.apply(outcome, now)?;

        let mut members = Vec::with_capacity(digest.member_ids.len());
        for member_id in &digest.member_ids {
            if let Some(member) = state.deliveries.get(member_id) {
                if member.status != DeliveryStatus::Queued {
                    continue;
                }
                let mut member = member.clone();
                member.apply(outcome, now)?;
                members.push(member);
            }
        }

        for member in members {
            state.deliveries.insert(member.id, member);
        }
        state.digests.insert(id, digest.clone());
        Ok(digest)
    }

    fn release_delivery(&self, id: Uuid) {
        self.state.lock().claimed_deliveries.remove(&id);
    }

    fn release_digest(&self, id: Uuid) {
        self.state.lock().claimed_digests.remove(&id);
    }

    async fn try_lock_stage(&self, phase: Phase, holder: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state.stage_locks.get(&phase) {
            Some(current) => Ok(*current == holder),
            None => {
                state.stage_locks.insert(phase, holder);
                Ok(true)
            }
        }
    }

    fn unlock_stage(&self, phase: Phase, holder: Uuid) {
        let mut state = self.state.lock();
        if state.stage_locks.get(&phase) == Some(&holder) {
            state.stage_locks.remove(&phase);
        }
    }

    async fn record_run(&self, run: &EngineRun) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.lock().runs.push(run.clone());
        Ok(())
    }

    async fn latest_runs(&self) -> Result<BTreeMap<Phase, EngineRun>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let mut latest: BTreeMap<Phase, EngineRun> = BTreeMap::new();
        for run in &state.runs {
            let newer = latest
                .get(&run.phase)
                .map_or(true, |seen| run.started_at >= seen.started_at);
            if newer {
                latest.insert(run.phase, run.clone());
            }
        }
        Ok(latest)
    }

    async fn delivery_counts(&self, since: Timestamp) -> Result<DeliveryCounts, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let mut counts = DeliveryCounts::default();
        for d in state.deliveries.values().filter(|d| d.updated_at >= since) {
            counts.record(d.channel, d.status);
        }
        Ok(counts)
    }

    async fn pending_digest_count(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .digests
            .values()
            .filter(|d| d.status == DigestStatus::Pending)
            .count() as u64)
    }

    async fn failed_deliveries(
        &self,
        since: Timestamp,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let mut failed: Vec<_> = state
            .deliveries
            .values()
            .filter(|d| d.status == DeliveryStatus::Failed && d.updated_at >= since)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<Delivery>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().deliveries.get(&id).cloned())
    }

    async fn get_digest(&self, id: Uuid) -> Result<Option<Digest>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().digests.get(&id).cloned())
    }

    async fn requeue_failed(
        &self,
        id: Uuid,
        max_attempts: u32,
        now: Timestamp,
    ) -> Result<Delivery, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let delivery = state.deliveries.get_mut(&id).ok_or(StoreError::NotFound {
            kind: "delivery",
            id,
        })?;
        if delivery.attempts >= max_attempts {
            return Err(StoreError::InvalidTransition {
                id,
                from: format!("{} after {} attempts", delivery.status, delivery.attempts),
                to: DeliveryStatus::Queued.to_string(),
            });
        }
        delivery.requeue(now)?;
        Ok(delivery.clone())
    }

    async fn reserve_send_slot(
        &self,
        channel: Channel,
        recipient: &str,
        limits: &RateLimitConfig,
        now: Timestamp,
    ) -> Result<RateLimitResult, StoreError> {
        self.check_available()?;
        Ok(self.rate_windows.check(channel, recipient, limits, now))
    }

    async fn expire_rate_windows(
        &self,
        limits: &BTreeMap<Channel, RateLimitConfig>,
        now: Timestamp,
    ) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self.rate_windows.expire(limits, now))
    }
}
