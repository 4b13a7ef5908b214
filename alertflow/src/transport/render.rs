//! Message rendering.

use std::fmt::Write as _;

use crate::core::{AlertEvent, Channel, Digest};

/// Subject and body handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
}

/// Turns events into message text.
pub trait MessageRenderer: Send + Sync {
    /// Renders a single event.
    fn render_instant(&self, event: &AlertEvent, channel: Channel) -> RenderedMessage;

    /// Renders a digest of member events, oldest first.
    fn render_digest(&self, digest: &Digest, events: &[AlertEvent]) -> RenderedMessage;
}

/// Plain-text renderer with no templating.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainRenderer;

impl PlainRenderer {
    fn headline(event: &AlertEvent) -> String {
        format!(
            "[severity {}] {} alert in {}",
            event.severity, event.category, event.region
        )
    }

    fn summary(event: &AlertEvent) -> String {
        ["summary", "message"]
            .iter()
            .find_map(|field| event.payload.get(field).and_then(|v| v.as_str()))
            .map_or_else(|| event.payload.to_string(), ToString::to_string)
    }
}

impl MessageRenderer for PlainRenderer {
    fn render_instant(&self, event: &AlertEvent, _channel: Channel) -> RenderedMessage {
        let mut body = Self::summary(event);
        if !event.asset_tags.is_empty() {
            let _ = write!(body, "\nAssets: {}", event.asset_tags.join(", "));
        }
        if let Some(reference) = &event.risk_score_ref {
            let _ = write!(body, "\nRisk score: {reference}");
        }
        RenderedMessage {
            subject: Self::headline(event),
            body,
        }
    }

    fn render_digest(&self, digest: &Digest, events: &[AlertEvent]) -> RenderedMessage {
        let subject = format!(
            "{} alerts between {} and {}",
            events.len(),
            digest.window_start.format("%Y-%m-%d %H:%M"),
            digest.window_end.format("%H:%M UTC")
        );
        let mut body = String::new();
        for event in events {
            let _ = writeln!(body, "- {}: {}", Self::headline(event), Self::summary(event));
        }
        RenderedMessage {
            subject,
            body: body.trim_end().to_string(),
        }
    }
}
