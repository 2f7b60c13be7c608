//! Per-role circuit breakers gating agent invocation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Decides whether a role may be invoked, and learns from the outcome.
pub trait CircuitBreakerGate: Send + Sync {
    fn can_execute(&self, role: &str) -> bool;
    fn record_success(&self, role: &str);
    fn record_failure(&self, role: &str);
    fn state(&self, role: &str) -> BreakerState;
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Default)]
struct RoleBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Milliseconds since the registry epoch when the breaker last opened.
    opened_at_ms: AtomicU64,
    /// Whether the single half-open probe has been handed out.
    probing: AtomicU8,
}

/// Counting breakers: closed until `failure_threshold` consecutive failures,
/// then open for `recovery_timeout`, then half-open for a single probe whose
/// outcome closes or re-opens the breaker.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<RoleBreaker>>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    epoch: Instant,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            epoch: Instant::now(),
        }
    }

    fn breaker(&self, role: &str) -> Arc<RoleBreaker> {
        if let Some(breaker) = self.breakers.read().get(role) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(role.to_string())
            .or_default()
            .clone()
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn consecutive_failures(&self, role: &str) -> u32 {
        self.breaker(role).consecutive_failures.load(Ordering::Acquire)
    }

    /// Force a role's breaker back to closed.
    pub fn reset(&self, role: &str) {
        let breaker = self.breaker(role);
        breaker.consecutive_failures.store(0, Ordering::Release);
        breaker.probing.store(0, Ordering::Release);
        breaker.state.store(CLOSED, Ordering::Release);
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

impl CircuitBreakerGate for CircuitBreakerRegistry {
    fn can_execute(&self, role: &str) -> bool {
        let breaker = self.breaker(role);
        match breaker.state.load(Ordering::Acquire) {
            CLOSED => true,
            OPEN => {
                let opened = breaker.opened_at_ms.load(Ordering::Acquire);
                let elapsed = self.now_ms().saturating_sub(opened);
                if elapsed < u64::try_from(self.recovery_timeout.as_millis()).unwrap_or(u64::MAX) {
                    return false;
                }
                if breaker
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    info!(role, "Circuit breaker half-open");
                }
                breaker
                    .probing
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            }
            _ => breaker
                .probing
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }

    fn record_success(&self, role: &str) {
        let breaker = self.breaker(role);
        breaker.consecutive_failures.store(0, Ordering::Release);
        breaker.probing.store(0, Ordering::Release);
        if breaker.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            info!(role, "Circuit breaker closed");
        }
    }

    fn record_failure(&self, role: &str) {
        let breaker = self.breaker(role);
        let failures = breaker.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let state = breaker.state.load(Ordering::Acquire);
        if state == HALF_OPEN || (state == CLOSED && failures >= self.failure_threshold) {
            breaker.opened_at_ms.store(self.now_ms(), Ordering::Release);
            breaker.probing.store(0, Ordering::Release);
            breaker.state.store(OPEN, Ordering::Release);
            warn!(role, failures, "Circuit breaker opened");
        }
    }

    fn state(&self, role: &str) -> BreakerState {
        match self.breaker(role).state.load(Ordering::Acquire) {
            CLOSED => BreakerState::Closed,
            OPEN => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let gate = CircuitBreakerRegistry::new(3, Duration::from_secs(60));
        assert!(gate.can_execute("diagnosis"));
        gate.record_failure("diagnosis");
        gate.record_failure("diagnosis");
        assert_eq!(gate.state("diagnosis"), BreakerState::Closed);
        gate.record_failure("diagnosis");
        assert_eq!(gate.state("diagnosis"), BreakerState::Open);
        assert!(!gate.can_execute("diagnosis"));
        // Other roles are unaffected.
        assert!(gate.can_execute("prediction"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let gate = CircuitBreakerRegistry::new(2, Duration::from_secs(60));
        gate.record_failure("detection");
        gate.record_success("detection");
        gate.record_failure("detection");
        assert_eq!(gate.state("detection"), BreakerState::Closed);
        assert_eq!(gate.consecutive_failures("detection"), 1);
    }

    #[test]
    fn test_half_open_allows_single_probe() {
        let gate = CircuitBreakerRegistry::new(1, Duration::ZERO);
        gate.record_failure("diagnosis");
        assert_eq!(gate.state("diagnosis"), BreakerState::Open);

        assert!(gate.can_execute("diagnosis"));
        assert_eq!(gate.state("diagnosis"), BreakerState::HalfOpen);
        assert!(!gate.can_execute("diagnosis"));

        gate.record_success("diagnosis");
        assert_eq!(gate.state("diagnosis"), BreakerState::Closed);
        assert!(gate.can_execute("diagnosis"));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let gate = CircuitBreakerRegistry::new(1, Duration::ZERO);
        gate.record_failure("diagnosis");
        assert!(gate.can_execute("diagnosis"));
        gate.record_failure("diagnosis");
        assert_eq!(gate.state("diagnosis"), BreakerState::Open);
    }

    #[test]
    fn test_reset() {
        let gate = CircuitBreakerRegistry::new(1, Duration::from_secs(60));
        gate.record_failure("detection");
        gate.reset("detection");
        assert!(gate.can_execute("detection"));
        assert_eq!(gate.consecutive_failures("detection"), 0);
    }

    #[test]
    fn test_concurrent_failures_are_counted() {
        let gate = Arc::new(CircuitBreakerRegistry::new(1000, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        gate.record_failure("detection");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gate.consecutive_failures("detection"), 800);
        assert_eq!(gate.state("detection"), BreakerState::Closed);
    }
}
