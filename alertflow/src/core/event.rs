//! Upstream alert events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::{generate_id, now_utc, Timestamp};

/// Highest severity an event may carry.
pub const MAX_SEVERITY: u8 = 10;

/// An immutable risk alert produced by the upstream scoring pipeline.
///
/// The engine only looks at the routing attributes; `payload` is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Event identifier.
    pub id: Uuid,
    /// When the event was produced.
    pub created_at: Timestamp,
    /// Severity from 1 (informational) to [`MAX_SEVERITY`].
    pub severity: u8,
    /// Event category (e.g. "liquidity", "sanctions").
    pub category: String,
    /// Region code the event applies to.
    pub region: String,
    /// Assets the event mentions.
    #[serde(default)]
    pub asset_tags: Vec<String>,
    /// Reference to the upstream risk score record.
    #[serde(default)]
    pub risk_score_ref: Option<String>,
    /// Opaque upstream content.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AlertEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(category: impl Into<String>, region: impl Into<String>, severity: u8) -> Self {
        Self {
            id: generate_id(),
            created_at: now_utc(),
            severity,
            category: category.into(),
            region: region.into(),
            asset_tags: Vec::new(),
            risk_score_ref: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Sets the creation time.
    #[must_use]
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sets the asset tags.
    #[must_use]
    pub fn with_asset_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.asset_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the risk score reference.
    #[must_use]
    pub fn with_risk_score_ref(mut self, reference: impl Into<String>) -> Self {
        self.risk_score_ref = Some(reference.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Returns the position of this event in intake order.
    #[must_use]
    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }

    /// Checks the routing attributes Fanout depends on.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed attribute.
    pub fn validate(&self) -> Result<(), String> {
        if self.category.trim().is_empty() {
            return Err("empty category".to_string());
        }
        if self.region.trim().is_empty() {
            return Err("empty region".to_string());
        }
        if self.severity == 0 || self.severity > MAX_SEVERITY {
            return Err(format!(
                "severity {} outside 1..={MAX_SEVERITY}",
                self.severity
            ));
        }
        Ok(())
    }
}

/// Low-watermark position in the event log.
///
/// Ordered by creation time, then id, so ties on `created_at` are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventCursor {
    /// Creation time of the last processed event.
    pub created_at: Timestamp,
    /// Identifier of the last processed event.
    pub id: Uuid,
}
