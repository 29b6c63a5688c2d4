use std::{sync::Mutex, time::Duration};

use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure circuit breaker guarding the counter store.
///
/// Opens after `failure_threshold` failures in a row. Once the cooldown has
/// passed a single trial call is let through; its outcome closes the
/// breaker or re-opens it for another cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self { failure_threshold: failure_threshold.max(1), cooldown, state: Mutex::default() }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.open_until {
            None => true,
            Some(until) if now < until => false,
            Some(_) if state.trial_in_flight => false,
            Some(_) => {
                state.trial_in_flight = true;
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = BreakerState::default();
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.trial_in_flight || state.consecutive_failures >= self.failure_threshold {
            state.open_until = Some(now + self.cooldown);
            state.trial_in_flight = false;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().expect("breaker lock poisoned").open_until.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        let now = Instant::now();

        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        assert!(breaker.allow_at(now));
        breaker.record_failure_at(now);
        assert!(!breaker.allow_at(now));
        assert!(!breaker.allow_at(now + Duration::from_secs(29)));
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        let now = Instant::now();

        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        breaker.record_success();
        breaker.record_failure_at(now);
        assert!(breaker.allow_at(now));
        assert!(!breaker.is_open());
    }

    #[test]
    fn single_trial_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let now = Instant::now();
        breaker.record_failure_at(now);

        let later = now + Duration::from_secs(30);
        assert!(breaker.allow_at(later));
        assert!(!breaker.allow_at(later), "only one trial while it is in flight");

        breaker.record_failure_at(later);
        assert!(!breaker.allow_at(later + Duration::from_secs(1)));

        let much_later = later + Duration::from_secs(30);
        assert!(breaker.allow_at(much_later));
        breaker.record_success();
        assert!(breaker.allow_at(much_later));
        assert!(breaker.allow_at(much_later));
    }
}
