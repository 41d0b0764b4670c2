//! Time source used by the rate-limit algorithms and the adaptive TTL policy.
//!
//! Timestamps are durations since the Unix epoch so fixed windows can be
//! aligned to wall-clock boundaries and shared across instances through Redis.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of "now"
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time as a duration since the Unix epoch
    fn now(&self) -> Duration;

    /// Current time in fractional seconds
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Manually advanced clock with millisecond resolution.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: Duration) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis() as u64)),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, to: Duration) {
        self.millis.store(to.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Default shared wall clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
