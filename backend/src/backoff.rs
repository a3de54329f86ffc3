use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

use crate::config::RetryPolicy;

/// Where a retried operation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: u32 },
    BackingOff { attempt: u32, delay: Duration },
    /// The attempt budget is spent; retries continue at the capped delay.
    Degraded { attempt: u32, delay: Duration },
}

/// Exponential backoff as an explicit state machine.
///
/// A fresh machine starts in `Attempting { attempt: 1 }`. Each failure moves it
/// to `BackingOff` with the next delay from the exponential schedule, or to
/// `Degraded` once the schedule is exhausted after `max_attempts` failures;
/// `resume` starts the next attempt and `on_success` resets it.
pub struct Backoff {
    builder: ExponentialBuilder,
    delays: ExponentialBackoff,
    cap: Duration,
    state: RetryState,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        // the failure that finds the schedule empty is the one that degrades
        let builder = ExponentialBuilder::default()
            .with_min_delay(policy.base)
            .with_max_delay(policy.cap)
            .with_max_times(policy.max_attempts.saturating_sub(1) as usize);

        Self {
            delays: builder.build(),
            builder,
            cap: policy.cap,
            state: RetryState::Attempting { attempt: 1 },
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        match self.state {
            RetryState::Attempting { attempt }
            | RetryState::BackingOff { attempt, .. }
            | RetryState::Degraded { attempt, .. } => attempt,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.state, RetryState::Degraded { .. })
    }

    /// Records a failed attempt and returns the state to wait in.
    pub fn on_failure(&mut self) -> RetryState {
        let attempt = self.attempt();

        let next = if self.is_degraded() { None } else { self.delays.next() };
        self.state = match next {
            Some(delay) => RetryState::BackingOff { attempt, delay },
            None => RetryState::Degraded { attempt, delay: self.cap },
        };
        self.state
    }

    /// Leaves the waiting state for the next attempt.
    pub fn resume(&mut self) {
        self.state = match self.state {
            RetryState::BackingOff { attempt, .. } => RetryState::Attempting { attempt: attempt + 1 },
            // stays degraded until an attempt succeeds
            RetryState::Degraded { attempt, delay } => RetryState::Degraded { attempt: attempt + 1, delay },
            attempting => attempting,
        };
    }

    /// Resets the machine. Returns `true` when it was degraded.
    pub fn on_success(&mut self) -> bool {
        let was_degraded = self.is_degraded();
        self.delays = self.builder.build();
        self.state = RetryState::Attempting { attempt: 1 };
        was_degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(1_000),
            max_attempts,
        }
    }

    fn delay_ms(state: RetryState) -> u64 {
        match state {
            RetryState::BackingOff { delay, .. } | RetryState::Degraded { delay, .. } => delay.as_millis() as u64,
            RetryState::Attempting { .. } => 0,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let mut backoff = Backoff::new(policy(10));
        let delays: Vec<u64> = (0..6)
            .map(|_| {
                let delay = delay_ms(backoff.on_failure());
                backoff.resume();
                delay
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert!(!backoff.is_degraded());
    }

    #[test]
    fn test_degraded_waits_at_cap() {
        let mut backoff = Backoff::new(policy(2));
        backoff.on_failure();
        backoff.resume();
        for _ in 0..5 {
            assert_eq!(delay_ms(backoff.on_failure()), 1_000);
            backoff.resume();
        }
        assert!(backoff.is_degraded());
    }

    #[test]
    fn test_transitions_to_degraded_after_budget() {
        let mut backoff = Backoff::new(policy(3));
        assert_eq!(backoff.state(), RetryState::Attempting { attempt: 1 });

        assert_eq!(
            backoff.on_failure(),
            RetryState::BackingOff { attempt: 1, delay: Duration::from_millis(100) }
        );
        backoff.resume();
        assert_eq!(backoff.state(), RetryState::Attempting { attempt: 2 });

        assert_eq!(
            backoff.on_failure(),
            RetryState::BackingOff { attempt: 2, delay: Duration::from_millis(200) }
        );
        backoff.resume();

        assert_eq!(
            backoff.on_failure(),
            RetryState::Degraded { attempt: 3, delay: Duration::from_millis(1_000) }
        );
        backoff.resume();
        assert!(backoff.is_degraded());
        assert_eq!(backoff.attempt(), 4);

        assert!(matches!(backoff.on_failure(), RetryState::Degraded { attempt: 4, .. }));
    }

    #[test]
    fn test_success_resets() {
        let mut backoff = Backoff::new(policy(1));
        backoff.on_failure();
        assert!(backoff.is_degraded());
        assert!(backoff.on_success());
        assert_eq!(backoff.state(), RetryState::Attempting { attempt: 1 });

        backoff.on_failure();
        backoff.resume();
        assert!(backoff.on_success());
        assert!(!backoff.on_success());

        // the delay schedule starts over after a success
        let mut backoff = Backoff::new(policy(10));
        backoff.on_failure();
        backoff.resume();
        assert_eq!(delay_ms(backoff.on_failure()), 200);
        backoff.on_success();
        assert_eq!(delay_ms(backoff.on_failure()), 100);
    }
}
