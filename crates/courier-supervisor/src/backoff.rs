//! Restart policy: exponential backoff with jitter, then a circuit breaker.
//!
//! - [`RestartPolicy`]: tuning knobs
//! - [`RestartState`]: the counters carried across restarts
//! - [`RestartDecision`]: what to do about one failure

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use courier_settings::SupervisorSettings;

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

pub const BASE_DELAY: Duration = Duration::from_millis(5_000);
pub const MAX_JITTER: Duration = Duration::from_millis(1_000);
pub const MAX_RESTARTS_PER_WINDOW: u32 = 5;
pub const RESTART_WINDOW: Duration = Duration::from_secs(3_600);
pub const CIRCUIT_BASE_DELAY: Duration = Duration::from_millis(300_000);
pub const CIRCUIT_MAX_DELAY: Duration = Duration::from_secs(3_600);

/// Restart tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before the first restart; doubles per consecutive restart.
    pub base_delay: Duration,
    /// Upper bound (exclusive) of the random jitter added to plain delays.
    pub max_jitter: Duration,
    /// Restarts allowed inside one window before the circuit opens.
    pub max_restarts: u32,
    /// Quiet period after which the restart count starts over.
    pub window: Duration,
    /// First circuit cooldown; doubles per restart past the threshold.
    pub circuit_base_delay: Duration,
    pub circuit_max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay: BASE_DELAY,
            max_jitter: MAX_JITTER,
            max_restarts: MAX_RESTARTS_PER_WINDOW,
            window: RESTART_WINDOW,
            circuit_base_delay: CIRCUIT_BASE_DELAY,
            circuit_max_delay: CIRCUIT_MAX_DELAY,
        }
    }
}

impl From<&SupervisorSettings> for RestartPolicy {
    fn from(s: &SupervisorSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_jitter: Duration::from_millis(s.max_jitter_ms),
            max_restarts: s.max_restarts_per_window,
            window: Duration::from_secs(s.restart_window_secs),
            circuit_base_delay: Duration::from_millis(s.circuit_base_delay_ms),
            circuit_max_delay: Duration::from_secs(s.circuit_max_delay_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State & decisions
// ─────────────────────────────────────────────────────────────────────────────

/// Counters that survive restarts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestartState {
    pub restart_count: u32,
    pub last_restart: Option<Instant>,
}

impl RestartState {
    /// A restarted stream stayed healthy: forgive one restart.
    pub fn record_recovery(&mut self) {
        self.restart_count = self.restart_count.saturating_sub(1);
    }

    /// A circuit cooldown ran to completion.
    pub fn reset_after_cooldown(&mut self) {
        self.restart_count = 0;
    }
}

/// Outcome of [`RestartPolicy::on_failure`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartDecision {
    /// Plain backoff restart.
    Retry { attempt: u32, delay: Duration },
    /// Too many restarts in the window; wait out the cooldown.
    CircuitOpen { attempt: u32, delay: Duration },
}

impl RestartDecision {
    pub fn delay(&self) -> Duration {
        match self {
            Self::Retry { delay, .. } | Self::CircuitOpen { delay, .. } => *delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            Self::Retry { attempt, .. } | Self::CircuitOpen { attempt, .. } => *attempt,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Calculation
// ─────────────────────────────────────────────────────────────────────────────

impl RestartPolicy {
    /// Record a failure at `now` and decide how long to wait.
    pub fn on_failure(&self, state: &mut RestartState, now: Instant) -> RestartDecision {
        let jitter = self.sample_jitter();
        self.on_failure_with_jitter(state, now, jitter)
    }

    /// [`Self::on_failure`] with a caller-supplied jitter.
    pub fn on_failure_with_jitter(
        &self,
        state: &mut RestartState,
        now: Instant,
        jitter: Duration,
    ) -> RestartDecision {
        if let Some(last) = state.last_restart {
            if now.saturating_duration_since(last) > self.window {
                state.restart_count = 0;
            }
        }
        state.restart_count = state.restart_count.saturating_add(1);
        state.last_restart = Some(now);

        let attempt = state.restart_count;
        if attempt <= self.max_restarts {
            RestartDecision::Retry {
                attempt,
                delay: self.plain_delay(attempt).saturating_add(jitter),
            }
        } else {
            RestartDecision::CircuitOpen {
                attempt,
                delay: self.circuit_delay(attempt),
            }
        }
    }

    /// `base_delay * 2^(attempt-1)`, without jitter.
    pub fn plain_delay(&self, attempt: u32) -> Duration {
        scale(self.base_delay, attempt.saturating_sub(1))
    }

    /// `min(circuit_max_delay, circuit_base_delay * 2^(attempt-max_restarts))`.
    pub fn circuit_delay(&self, attempt: u32) -> Duration {
        scale(
            self.circuit_base_delay,
            attempt.saturating_sub(self.max_restarts),
        )
        .min(self.circuit_max_delay)
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

fn scale(base: Duration, exponent: u32) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn plain_delays_double() {
        let policy = RestartPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.plain_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80]);
    }

    #[test]
    fn delays_strictly_increase_below_threshold() {
        let policy = RestartPolicy::default();
        let mut state = RestartState::default();
        let now = Instant::now();

        let mut previous = Duration::ZERO;
        for n in 1..=MAX_RESTARTS_PER_WINDOW {
            let decision = policy.on_failure(&mut state, now);
            assert!(!decision.is_circuit_open());
            assert_eq!(decision.attempt(), n);

            let delay = decision.delay();
            let plain = policy.plain_delay(n);
            assert!(delay >= plain && delay < plain + MAX_JITTER, "attempt {n}: {delay:?}");
            assert!(delay > previous);
            previous = delay;
        }
    }

    #[test]
    fn circuit_opens_past_threshold() {
        let policy = RestartPolicy::default();
        let mut state = RestartState {
            restart_count: MAX_RESTARTS_PER_WINDOW,
            last_restart: Some(Instant::now()),
        };
        let last_plain = policy.plain_delay(MAX_RESTARTS_PER_WINDOW) + MAX_JITTER;

        let decision = policy.on_failure(&mut state, Instant::now());
        assert!(decision.is_circuit_open());
        assert_eq!(decision.attempt(), MAX_RESTARTS_PER_WINDOW + 1);
        // 300s * 2^1
        assert_eq!(decision.delay(), secs(600));
        assert!(decision.delay() > last_plain);
    }

    #[test]
    fn circuit_delay_is_capped() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.circuit_delay(6), secs(600));
        assert_eq!(policy.circuit_delay(7), secs(1_200));
        assert_eq!(policy.circuit_delay(8), secs(2_400));
        assert_eq!(policy.circuit_delay(9), secs(3_600));
        assert_eq!(policy.circuit_delay(200), secs(3_600));
    }

    #[tokio::test(start_paused = true)]
    async fn count_resets_after_quiet_window() {
        let policy = RestartPolicy::default();
        let mut state = RestartState::default();
        for _ in 0..4 {
            policy.on_failure(&mut state, Instant::now());
        }
        assert_eq!(state.restart_count, 4);

        tokio::time::advance(RESTART_WINDOW + secs(1)).await;
        let decision = policy.on_failure_with_jitter(&mut state, Instant::now(), Duration::ZERO);
        assert_eq!(decision, RestartDecision::Retry { attempt: 1, delay: BASE_DELAY });
    }

    #[tokio::test(start_paused = true)]
    async fn window_reset_applies_while_circuit_open() {
        let policy = RestartPolicy::default();
        let mut state = RestartState {
            restart_count: 9,
            last_restart: Some(Instant::now()),
        };
        tokio::time::advance(RESTART_WINDOW + secs(1)).await;
        let decision = policy.on_failure(&mut state, Instant::now());
        assert!(!decision.is_circuit_open());
        assert_eq!(state.restart_count, 1);
    }

    #[test]
    fn failure_inside_window_keeps_counting() {
        let policy = RestartPolicy::default();
        let now = Instant::now();
        let mut state = RestartState {
            restart_count: 2,
            last_restart: Some(now),
        };
        let decision = policy.on_failure_with_jitter(&mut state, now, Duration::from_millis(250));
        assert_eq!(
            decision,
            RestartDecision::Retry {
                attempt: 3,
                delay: Duration::from_millis(20_250)
            }
        );
        assert_eq!(state.last_restart, Some(now));
    }

    #[test]
    fn recovery_and_cooldown_adjust_count() {
        let mut state = RestartState {
            restart_count: 2,
            last_restart: None,
        };
        state.record_recovery();
        assert_eq!(state.restart_count, 1);
        state.record_recovery();
        state.record_recovery();
        assert_eq!(state.restart_count, 0);

        state.restart_count = 7;
        state.reset_after_cooldown();
        assert_eq!(state.restart_count, 0);
    }

    #[test]
    fn zero_jitter_policy() {
        let policy = RestartPolicy {
            max_jitter: Duration::ZERO,
            ..RestartPolicy::default()
        };
        let mut state = RestartState::default();
        let decision = policy.on_failure(&mut state, Instant::now());
        assert_eq!(decision.delay(), BASE_DELAY);
    }

    #[test]
    fn from_settings() {
        let settings = SupervisorSettings {
            base_delay_ms: 100,
            max_restarts_per_window: 2,
            ..SupervisorSettings::default()
        };
        let policy = RestartPolicy::from(&settings);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_restarts, 2);
        assert_eq!(policy.circuit_base_delay, CIRCUIT_BASE_DELAY);
    }
}
