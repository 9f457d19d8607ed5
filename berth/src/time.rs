//! Time provider abstraction for real and simulated time.
//!
//! The driver never blocks: whenever it must wait for the network stack it
//! yields for a fixed interval through a [`TimeProvider`]. The tokio
//! implementation yields real wall-clock time; the sim implementation
//! advances a virtual clock so tests can assert exact deadlines.

use async_trait::async_trait;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Provider trait for the two time operations the driver needs: a
/// cooperative "yield for this long" and a monotonic reading for deadline
/// arithmetic.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration, yielding to other tasks.
    async fn sleep(&self, duration: Duration);

    /// Monotonic time elapsed since the provider was created.
    fn now(&self) -> Duration;
}

/// Real time provider using tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    /// Start time for calculating elapsed duration
    start_time: std::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new tokio time provider starting at zero.
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Deterministic virtual-clock provider for tests.
///
/// `sleep` advances the clock by exactly the requested duration and yields
/// once to the scheduler so sibling tasks can make progress; no wall-clock
/// time passes. Clones share the same clock.
#[derive(Debug, Clone, Default)]
pub struct SimTimeProvider {
    now: Rc<RefCell<Duration>>,
}

impl SimTimeProvider {
    /// Create a provider with its clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock without yielding.
    pub fn advance(&self, duration: Duration) {
        *self.now.borrow_mut() += duration;
    }
}

#[async_trait(?Send)]
impl TimeProvider for SimTimeProvider {
    async fn sleep(&self, duration: Duration) {
        *self.now.borrow_mut() += duration;
        tokio::task::yield_now().await;
    }

    fn now(&self) -> Duration {
        *self.now.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_clock_starts_at_zero() {
        let time = SimTimeProvider::new();
        assert_eq!(time.now(), Duration::ZERO);
    }

    #[test]
    fn test_sim_advance_moves_all_clones() {
        let time = SimTimeProvider::new();
        let other = time.clone();
        time.advance(Duration::from_millis(250));
        assert_eq!(other.now(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_sim_sleep_advances_exactly() {
        let time = SimTimeProvider::new();
        time.sleep(Duration::from_millis(20)).await;
        time.sleep(Duration::from_millis(100)).await;
        assert_eq!(time.now(), Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_tokio_now_is_monotonic() {
        let time = TokioTimeProvider::new();
        let before = time.now();
        time.sleep(Duration::from_millis(5)).await;
        assert!(time.now() > before);
    }
}
