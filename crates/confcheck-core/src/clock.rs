//! Time abstraction for scenario waits and verifier polling
//!
//! Scenario code never sleeps on the wall clock directly. Real runs use
//! [`SystemClock`]; tests use [`VirtualClock`], whose sleeps complete
//! immediately and advance virtual time, so a 65 second channel-expiry wait
//! costs nothing.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Source of time for the harness
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created
    fn now(&self) -> Duration;

    /// Suspend the current scenario for `duration`
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

/// Real-time implementation using tokio::time
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(async move {
            sleep(duration).await;
        })
    }
}

// ============================================================================
// Virtual Clock - Deterministic time control for testing
// ============================================================================

/// Virtual clock whose sleeps advance time instead of waiting
///
/// Cloning shares the underlying time, so a test can hand one clone to the
/// code under test and inspect elapsed virtual time through another.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    nanos: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manually advance virtual time by the given duration
    pub fn advance(&self, duration: Duration) {
        self.nanos.fetch_add(saturating_nanos(duration), Ordering::SeqCst);
    }

    /// Total virtual time that has passed
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        self.advance(duration);
        Box::pin(async {
            // Let other tasks observe the new time before continuing
            tokio::task::yield_now().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_clock_sleep() {
        let clock = SystemClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(20)).await;

        assert!(clock.now() - start >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_virtual_clock_sleep_advances_time() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        let real_start = std::time::Instant::now();
        clock.sleep(Duration::from_secs(65)).await;

        assert_eq!(clock.now(), Duration::from_secs(65));
        assert!(real_start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_virtual_clock_clones_share_time() {
        let clock = VirtualClock::new();
        let handle = clock.clone();

        clock.advance(Duration::from_secs(10));
        handle.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(15));
    }
}
