//! Fail-fast gate in front of lazily connected backends.
//!
//! Only one caller at a time may attempt a connection. Callers arriving
//! while an attempt is in flight, or within the backoff interval after a
//! failed attempt, are turned away at once instead of queueing behind the
//! connect timeout.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Pause after a failed connection attempt before the next one is allowed
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ConnectGate {
    backoff: Duration,
    connecting: AtomicBool,
    retry_at: Mutex<Option<Instant>>,
}

impl Default for ConnectGate {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_BACKOFF)
    }
}

impl ConnectGate {
    pub fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            connecting: AtomicBool::new(false),
            retry_at: Mutex::new(None),
        }
    }

    /// Claim the single connection attempt, or `None` if another caller
    /// holds it or the backoff has not elapsed
    pub fn try_begin(&self) -> Option<ConnectAttempt<'_>> {
        if let Some(retry_at) = *self.retry_at.lock() {
            if Instant::now() < retry_at {
                return None;
            }
        }
        if self.connecting.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(ConnectAttempt { gate: self })
    }

    /// Time left before the next attempt is allowed
    pub fn remaining_backoff(&self) -> Duration {
        self.retry_at
            .lock()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Exclusive right to connect; released on drop, including when the
/// connecting future is cancelled
#[derive(Debug)]
pub struct ConnectAttempt<'a> {
    gate: &'a ConnectGate,
}

impl ConnectAttempt<'_> {
    pub fn succeeded(self) {
        *self.gate.retry_at.lock() = None;
    }

    pub fn failed(self) {
        *self.gate.retry_at.lock() = Some(Instant::now() + self.gate.backoff);
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        self.gate.connecting.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_attempt_at_a_time() {
        let gate = ConnectGate::new(Duration::from_secs(60));
        let attempt = gate.try_begin().expect("first caller connects");
        assert!(gate.try_begin().is_none());

        attempt.succeeded();
        assert!(gate.try_begin().is_some());
    }

    #[test]
    fn test_failure_starts_backoff() {
        let gate = ConnectGate::new(Duration::from_millis(50));
        gate.try_begin().unwrap().failed();

        assert!(gate.try_begin().is_none());
        assert!(gate.remaining_backoff() > Duration::ZERO);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(gate.remaining_backoff(), Duration::ZERO);
        assert!(gate.try_begin().is_some());
    }

    #[test]
    fn test_dropped_attempt_releases_gate() {
        let gate = ConnectGate::new(Duration::from_secs(60));
        drop(gate.try_begin().unwrap());
        assert!(gate.try_begin().is_some());
    }
}
