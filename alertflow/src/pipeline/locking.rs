//! Guards for advisory stage locks and unit claims.
//!
//! Both release on drop, so an early return or a panic inside a stage never
//! leaves a stage locked or a unit claimed.

use std::sync::Arc;
use uuid::Uuid;

use crate::core::Phase;
use crate::errors::{EngineError, Result};
use crate::store::DeliveryStore;

/// Holds the advisory lock for one stage.
pub struct StageLockGuard {
    store: Arc<dyn DeliveryStore>,
    phase: Phase,
    holder: Uuid,
}

impl StageLockGuard {
    /// Takes the lock for `phase` or fails with [`EngineError::StageBusy`].
    pub async fn acquire(
        store: Arc<dyn DeliveryStore>,
        phase: Phase,
        holder: Uuid,
    ) -> Result<Self> {
        if store.try_lock_stage(phase, holder).await? {
            Ok(Self {
                store,
                phase,
                holder,
            })
        } else {
            Err(EngineError::StageBusy { phase })
        }
    }
}

impl Drop for StageLockGuard {
    fn drop(&mut self) {
        self.store.unlock_stage(self.phase, self.holder);
    }
}

impl std::fmt::Debug for StageLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLockGuard")
            .field("phase", &self.phase)
            .field("holder", &self.holder)
            .finish()
    }
}

/// Kind of claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// An instant delivery.
    Delivery,
    /// A digest.
    Digest,
}

/// A claimed unit. Dropping it without [`disarm`](Self::disarm) releases the
/// claim unchanged.
pub struct ClaimGuard<'a> {
    store: &'a dyn DeliveryStore,
    kind: ClaimKind,
    id: Uuid,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    /// Wraps a claim the store has already granted.
    #[must_use]
    pub fn new(store: &'a dyn DeliveryStore, kind: ClaimKind, id: Uuid) -> Self {
        Self {
            store,
            kind,
            id,
            armed: true,
        }
    }

    /// Returns the claimed row id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Marks the claim as released by the store itself.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.kind {
            ClaimKind::Delivery => self.store.release_delivery(self.id),
            ClaimKind::Digest => self.store.release_digest(self.id),
        }
    }
}
