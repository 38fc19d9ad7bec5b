use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::RenewalError;

/// Cooperative cancellation flag shared between a renewal task and the
/// orchestrator. Checked before and after every suspension point.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn ensure_active(&self) -> Result<(), RenewalError> {
        if self.is_cancelled() {
            Err(RenewalError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps in short slices so a cancel request is observed promptly.
    pub fn sleep(&self, duration: std::time::Duration) -> Result<(), RenewalError> {
        let slice = std::time::Duration::from_millis(250);
        let deadline = std::time::Instant::now() + duration;
        while std::time::Instant::now() < deadline {
            self.ensure_active()?;
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            std::thread::sleep(remaining.min(slice));
        }
        self.ensure_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn token_starts_active() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.ensure_active().is_ok());
    }

    #[test]
    fn cancel_is_idempotent_and_visible_to_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.ensure_active(), Err(RenewalError::Cancelled)));
    }

    #[test]
    fn sleep_aborts_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let started = std::time::Instant::now();
        assert!(token.sleep(Duration::from_secs(5)).is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
