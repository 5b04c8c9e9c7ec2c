//! Single-slot deferred task used to coalesce bursts of triggers.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// A cancellable deadline with at most one pending firing.
///
/// Scheduling replaces any pending deadline; firing consumes the slot.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Start or restart the window from now.
    pub fn schedule(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    /// Drop the pending deadline. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the pending deadline passes; never resolves when idle.
    ///
    /// Cancel-safe: dropping the future leaves the slot untouched.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let mut debouncer = Debouncer::new(Duration::from_millis(300));
        debouncer.schedule();
        let start = Instant::now();
        debouncer.fired().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_pushes_deadline() {
        let mut debouncer = Debouncer::new(Duration::from_millis(300));
        let start = Instant::now();
        debouncer.schedule();
        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.schedule();
        debouncer.fired().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(510));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_never_fires() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        debouncer.schedule();
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());

        let timed_out = tokio::time::timeout(Duration::from_secs(5), debouncer.fired()).await;
        assert!(timed_out.is_err());
    }
}
