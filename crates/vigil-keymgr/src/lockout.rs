//! Lockout escalation: a pure state machine over failure counts and time
//!
//! The durable state is the minimal triple (failure count, last-failure
//! time, lock-until); everything else is recomputed by [`LockoutPolicy`]
//! decision functions that take an explicit `now`. The policy is monotone:
//! more failures never produce a shorter lock, and `lock_until` never
//! moves backward.

use serde::{Deserialize, Serialize};
use vigil_core::config::LockoutConfig;

/// Persisted lockout counters (`lockstate.json`).
///
/// A malformed or absent file deserializes to the zero state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutState {
    /// Consecutive failed validation attempts
    pub fails: u32,
    /// Unix seconds of the most recent failure
    pub last_fail: Option<u64>,
    /// Unix seconds until which validation is refused
    pub lock_until: Option<u64>,
    /// Destructive reset has fired; the wrapped key is gone
    pub reset: bool,
}

/// Where the state machine currently stands, given `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// Validation attempts are allowed
    Open,
    /// Rate-limited; retry after the remaining duration
    Locked { remaining_secs: u64 },
    /// Destructive reset has fired; only the recovery path remains
    Destroyed,
}

/// Outcome of registering one genuine invalid-secret failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Locked for `lock_secs` from now
    Locked { total: u32, lock_secs: u64 },
    /// The destructive threshold was reached
    DestructiveReset { total: u32 },
}

/// Escalation schedule and destructive threshold, from `[lockout]` config.
#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    schedule_secs: Vec<u64>,
    max_total_attempts: u32,
}

impl LockoutPolicy {
    pub fn from_config(cfg: &LockoutConfig) -> Self {
        let defaults = LockoutConfig::default();
        // An empty schedule or zero threshold would disable the policy
        // entirely; fall back to defaults instead.
        let schedule_secs = if cfg.schedule_secs.is_empty() {
            defaults.schedule_secs
        } else {
            cfg.schedule_secs.clone()
        };
        let max_total_attempts = if cfg.max_total_attempts == 0 {
            defaults.max_total_attempts
        } else {
            cfg.max_total_attempts
        };
        Self {
            schedule_secs,
            max_total_attempts,
        }
    }

    /// Current standing. Idempotent: repeated calls with the same inputs
    /// return the same answer and never mutate anything.
    pub fn status(&self, state: &LockoutState, now: u64) -> LockStatus {
        if state.reset {
            return LockStatus::Destroyed;
        }
        match state.lock_until {
            Some(until) if until > now => LockStatus::Locked {
                remaining_secs: until - now,
            },
            _ => LockStatus::Open,
        }
    }

    /// Advance the escalation schedule by one genuine failure.
    ///
    /// Returns the successor state and what happened. The caller persists
    /// the state and, on a destructive outcome, wipes the key material.
    pub fn register_failure(&self, state: &LockoutState, now: u64) -> (LockoutState, FailureOutcome) {
        let total = state.fails.saturating_add(1);

        if total >= self.max_total_attempts {
            let next = LockoutState {
                fails: total,
                last_fail: Some(now),
                lock_until: None,
                reset: true,
            };
            return (next, FailureOutcome::DestructiveReset { total });
        }

        let stage = ((total - 1) as usize).min(self.schedule_secs.len() - 1);
        let lock_secs = self.schedule_secs[stage];
        // Never shorten an existing lock.
        let lock_until = state
            .lock_until
            .unwrap_or(0)
            .max(now.saturating_add(lock_secs));

        let next = LockoutState {
            fails: total,
            last_fail: Some(now),
            lock_until: Some(lock_until),
            reset: false,
        };
        (next, FailureOutcome::Locked { total, lock_secs })
    }

    /// State after a successful validation: counters cleared.
    pub fn cleared(&self) -> LockoutState {
        LockoutState::default()
    }

    pub fn max_total_attempts(&self) -> u32 {
        self.max_total_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> LockoutPolicy {
        LockoutPolicy::from_config(&LockoutConfig {
            schedule_secs: vec![300, 3600, 86_400],
            max_total_attempts: 12,
        })
    }

    #[test]
    fn test_fresh_state_is_open() {
        let p = policy();
        assert_eq!(p.status(&LockoutState::default(), 1000), LockStatus::Open);
    }

    #[test]
    fn test_first_failure_locks_first_stage() {
        let p = policy();
        let (next, outcome) = p.register_failure(&LockoutState::default(), 1000);
        assert_eq!(next.fails, 1);
        assert_eq!(next.lock_until, Some(1300));
        assert_eq!(
            outcome,
            FailureOutcome::Locked {
                total: 1,
                lock_secs: 300
            }
        );
    }

    #[test]
    fn test_schedule_escalates_and_saturates() {
        let p = policy();
        let mut state = LockoutState::default();
        let mut expected = Vec::new();
        for i in 0..11 {
            let (next, outcome) = p.register_failure(&state, 1000 + i);
            if let FailureOutcome::Locked { lock_secs, .. } = outcome {
                expected.push(lock_secs);
            }
            state = next;
        }
        // stage 1, 2, then 3 repeating
        assert_eq!(expected[0], 300);
        assert_eq!(expected[1], 3600);
        assert!(expected[2..].iter().all(|&s| s == 86_400));
    }

    #[test]
    fn test_destructive_threshold() {
        let p = policy();
        let mut state = LockoutState::default();
        let mut destructive = None;
        for i in 0..12 {
            let (next, outcome) = p.register_failure(&state, 1000 + i);
            state = next;
            if let FailureOutcome::DestructiveReset { total } = outcome {
                destructive = Some(total);
            }
        }
        assert_eq!(destructive, Some(12));
        assert!(state.reset);
        assert_eq!(p.status(&state, 10_000), LockStatus::Destroyed);
    }

    #[test]
    fn test_locked_status_counts_down() {
        let p = policy();
        let (state, _) = p.register_failure(&LockoutState::default(), 1000);
        assert_eq!(
            p.status(&state, 1100),
            LockStatus::Locked { remaining_secs: 200 }
        );
        assert_eq!(p.status(&state, 1300), LockStatus::Open);
        assert_eq!(p.status(&state, 5000), LockStatus::Open);
    }

    #[test]
    fn test_lock_until_never_reduced() {
        let p = policy();
        // Second failure at a much earlier clock reading (clock skew) must
        // not pull lock_until backward.
        let (s1, _) = p.register_failure(&LockoutState::default(), 100_000);
        let (s2, _) = p.register_failure(&s1, 10);
        assert!(s2.lock_until.unwrap() >= s1.lock_until.unwrap());
    }

    #[test]
    fn test_cleared_resets_everything() {
        let p = policy();
        let (state, _) = p.register_failure(&LockoutState::default(), 1000);
        assert_ne!(state, LockoutState::default());
        assert_eq!(p.cleared(), LockoutState::default());
    }

    #[test]
    fn test_degenerate_config_falls_back() {
        let p = LockoutPolicy::from_config(&LockoutConfig {
            schedule_secs: vec![],
            max_total_attempts: 0,
        });
        assert_eq!(p.max_total_attempts(), 12);
        let (state, _) = p.register_failure(&LockoutState::default(), 0);
        assert!(state.lock_until.is_some());
    }

    proptest! {
        /// More failures never yield a shorter lock duration, and the
        /// failure counter is strictly monotone until the destructive tier.
        #[test]
        fn prop_lockout_monotone(times in proptest::collection::vec(0u64..1_000_000, 1..30)) {
            let p = policy();
            let mut state = LockoutState::default();
            let mut last_lock_secs = 0u64;
            let mut last_until = 0u64;
            for now in times {
                let prev_fails = state.fails;
                let (next, outcome) = p.register_failure(&state, now);
                prop_assert_eq!(next.fails, prev_fails + 1);
                match outcome {
                    FailureOutcome::Locked { lock_secs, .. } => {
                        prop_assert!(lock_secs >= last_lock_secs);
                        last_lock_secs = lock_secs;
                        let until = next.lock_until.unwrap();
                        prop_assert!(until >= last_until);
                        last_until = until;
                    }
                    FailureOutcome::DestructiveReset { .. } => {
                        prop_assert!(next.reset);
                        break;
                    }
                }
                state = next;
            }
        }
    }
}
