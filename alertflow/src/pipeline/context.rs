//! Per-invocation stage context.

use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::core::Phase;

/// Why a stage stopped claiming work early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The wall-clock budget ran out.
    Deadline,
    /// The cancellation token fired.
    Cancelled(String),
}

/// Run identity plus the cooperative stop conditions for one invocation.
#[derive(Debug, Clone)]
pub struct StageContext {
    run_id: Uuid,
    phase: Phase,
    deadline: Option<Instant>,
    cancel: Option<Arc<CancellationToken>>,
}

impl StageContext {
    /// Creates a context with no deadline.
    #[must_use]
    pub const fn new(run_id: Uuid, phase: Phase) -> Self {
        Self {
            run_id,
            phase,
            deadline: None,
            cancel: None,
        }
    }

    /// Sets a deadline relative to now. A budget past the clock's range means
    /// no deadline.
    #[must_use]
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.deadline = budget.and_then(|b| Instant::now().checked_add(b));
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Option<Arc<CancellationToken>>) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the stage.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns why the stage should stop claiming, if it should.
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Some(StopReason::Cancelled(token.reason().unwrap_or_default()));
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::Deadline),
            _ => None,
        }
    }

    /// Returns true if the stage should stop claiming new work.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop_reason().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_limits_never_stops() {
        let ctx = StageContext::new(Uuid::nil(), Phase::Send);
        assert!(!ctx.should_stop());
    }

    #[test]
    fn test_zero_budget_stops_immediately() {
        let ctx = StageContext::new(Uuid::nil(), Phase::Send).with_budget(Some(Duration::ZERO));
        assert_eq!(ctx.stop_reason(), Some(StopReason::Deadline));
    }

    #[test]
    fn test_unrepresentable_budget_means_no_deadline() {
        let ctx = StageContext::new(Uuid::nil(), Phase::Send).with_budget(Some(Duration::MAX));
        assert!(!ctx.should_stop());
    }

    #[test]
    fn test_cancellation_wins() {
        let token = Arc::new(CancellationToken::new());
        let ctx = StageContext::new(Uuid::nil(), Phase::Fanout)
            .with_budget(Some(Duration::from_secs(60)))
            .with_cancellation(Some(token.clone()));
        assert!(!ctx.should_stop());
        token.cancel("shutdown");
        assert_eq!(ctx.stop_reason(), Some(StopReason::Cancelled("shutdown".into())));
    }
}
