//! Login lockout policy.
//!
//! Pure decision functions over `LockState`; persistence and event
//! publication stay with the caller. Lock expiry is advisory-lazy: the
//! state is evaluated at read time, no background sweep ever runs.

use crate::account::LockState;

const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_BASE_LOCK_SECONDS: i64 = 5 * 60;
const DEFAULT_MAX_LOCK_SECONDS: i64 = 24 * 60 * 60;

// Doubling past this shift cannot matter once the cap applies.
const MAX_BACKOFF_SHIFT: u32 = 32;

#[derive(Clone, Copy, Debug)]
pub struct LockoutConfig {
    threshold: u32,
    base_lock_seconds: i64,
    max_lock_seconds: i64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            base_lock_seconds: DEFAULT_BASE_LOCK_SECONDS,
            max_lock_seconds: DEFAULT_MAX_LOCK_SECONDS,
        }
    }
}

impl LockoutConfig {
    #[must_use]
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_base_lock_seconds(mut self, seconds: i64) -> Self {
        self.base_lock_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_lock_seconds(mut self, seconds: i64) -> Self {
        self.max_lock_seconds = seconds;
        self
    }
}

/// Point-in-time view of the lock state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutEvaluation {
    pub is_locked: bool,
    pub remaining_seconds: i64,
}

/// Evaluate whether the account is currently locked.
#[must_use]
pub fn evaluate(state: &LockState, now_unix: i64) -> LockoutEvaluation {
    match state.locked_until_unix {
        Some(until) if until > now_unix => LockoutEvaluation {
            is_locked: true,
            remaining_seconds: until - now_unix,
        },
        _ => LockoutEvaluation {
            is_locked: false,
            remaining_seconds: 0,
        },
    }
}

/// Apply one login failure.
///
/// Reaching the threshold engages a lock whose duration doubles with every
/// lock cycle up to the cap, then restarts the failure window.
#[must_use]
pub fn on_failure(state: &LockState, now_unix: i64, config: &LockoutConfig) -> LockState {
    let mut next = state.clone();
    // A lock that already elapsed is cleared lazily here.
    if next.locked_until_unix.is_some_and(|until| until <= now_unix) {
        next.locked_until_unix = None;
    }
    next.consecutive_failures = next.consecutive_failures.saturating_add(1);
    if next.consecutive_failures >= config.threshold {
        let shift = next.lock_cycle.min(MAX_BACKOFF_SHIFT);
        let duration = config
            .base_lock_seconds
            .saturating_mul(1i64 << shift)
            .min(config.max_lock_seconds);
        next.locked_until_unix = Some(now_unix + duration);
        next.lock_cycle = next.lock_cycle.saturating_add(1);
        next.consecutive_failures = 0;
    }
    next
}

/// Apply a successful login: failures and the backoff cycle reset.
#[must_use]
pub fn on_success(_state: &LockState) -> LockState {
    LockState::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn fresh_state_is_unlocked() {
        let eval = evaluate(&LockState::default(), NOW);
        assert!(!eval.is_locked);
        assert_eq!(eval.remaining_seconds, 0);
    }

    #[test]
    fn threshold_failures_engage_the_lock() {
        let config = LockoutConfig::default();
        let mut state = LockState::default();
        for _ in 0..4 {
            state = on_failure(&state, NOW, &config);
            assert!(!evaluate(&state, NOW).is_locked);
        }
        state = on_failure(&state, NOW, &config);
        let eval = evaluate(&state, NOW);
        assert!(eval.is_locked);
        assert_eq!(eval.remaining_seconds, DEFAULT_BASE_LOCK_SECONDS);
        assert_eq!(state.lock_cycle, 1);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn lock_expires_lazily() {
        let config = LockoutConfig::default();
        let mut state = LockState::default();
        for _ in 0..5 {
            state = on_failure(&state, NOW, &config);
        }
        assert!(evaluate(&state, NOW + DEFAULT_BASE_LOCK_SECONDS - 1).is_locked);
        assert!(!evaluate(&state, NOW + DEFAULT_BASE_LOCK_SECONDS).is_locked);
    }

    #[test]
    fn backoff_doubles_per_cycle_up_to_cap() {
        let config = LockoutConfig::default();
        let mut state = LockState::default();
        let mut now = NOW;
        let mut expected = DEFAULT_BASE_LOCK_SECONDS;
        for _ in 0..12 {
            for _ in 0..5 {
                state = on_failure(&state, now, &config);
            }
            let eval = evaluate(&state, now);
            assert!(eval.is_locked);
            assert_eq!(eval.remaining_seconds, expected.min(DEFAULT_MAX_LOCK_SECONDS));
            now += eval.remaining_seconds;
            expected *= 2;
        }
    }

    #[test]
    fn success_resets_failures_and_cycle() {
        let config = LockoutConfig::default();
        let mut state = LockState::default();
        for _ in 0..7 {
            state = on_failure(&state, NOW, &config);
        }
        let reset = on_success(&state);
        assert_eq!(reset, LockState::default());
    }

    #[test]
    fn custom_threshold_applies() {
        let config = LockoutConfig::default().with_threshold(2);
        let state = on_failure(&LockState::default(), NOW, &config);
        assert!(!evaluate(&state, NOW).is_locked);
        let state = on_failure(&state, NOW, &config);
        assert!(evaluate(&state, NOW).is_locked);
    }
}
