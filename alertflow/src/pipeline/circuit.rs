//! Per-pass circuit breaker.
//!
//! Counts transport calls made by one send pass. Once the ceiling is reached
//! the pass stops claiming; whatever is still queued waits for the next pass.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Send ceiling for a single pass.
#[derive(Debug)]
pub struct PassBreaker {
    ceiling: u32,
    attempted: AtomicU32,
    tripped: AtomicBool,
}

impl PassBreaker {
    /// Creates a breaker allowing `ceiling` transport calls.
    #[must_use]
    pub const fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            attempted: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    /// Returns the configured ceiling.
    #[must_use]
    pub const fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Returns transport calls made so far.
    #[must_use]
    pub fn attempted(&self) -> u32 {
        self.attempted.load(Ordering::SeqCst)
    }

    /// Returns calls left before the ceiling.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.ceiling.saturating_sub(self.attempted())
    }

    /// Reserves one transport call. Returns false at the ceiling.
    pub fn try_acquire(&self) -> bool {
        let acquired = self
            .attempted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.ceiling).then_some(n + 1)
            })
            .is_ok();
        if !acquired {
            self.trip();
        }
        acquired
    }

    /// Marks the breaker as tripped.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
    }

    /// Returns true once the ceiling stopped the pass.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ceiling() {
        let breaker = PassBreaker::new(2);
        assert!(breaker.try_acquire());
        assert!(breaker.try_acquire());
        assert!(!breaker.is_tripped());
        assert!(!breaker.try_acquire());
        assert!(breaker.is_tripped());
        assert_eq!(breaker.attempted(), 2);
        assert_eq!(breaker.remaining(), 0);
    }

    #[test]
    fn test_zero_ceiling_blocks_everything() {
        let breaker = PassBreaker::new(0);
        assert_eq!(breaker.remaining(), 0);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_concurrent_acquire_never_overshoots() {
        let breaker = Arc::new(PassBreaker::new(50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || (0..20).filter(|_| breaker.try_acquire()).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(breaker.attempted(), 50);
    }
}
