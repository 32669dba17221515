//! Waiting on a condition while driving a side-effecting progress action.
//!
//! Every wait in the exchange has the same shape: test a condition, and if it does not hold yet,
//! run one progress step (usually a zero-entry CQ read) and test again. [`Waiter`] owns that loop
//! so the deadline and the clock can be swapped out in tests.

use crate::error::{Error, Result};
use minstant::Instant;
use std::time::Duration;

/// Source of monotonic time.
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Duration {
        (**self).now()
    }
}

/// Wall clock backed by the TSC where available.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// How long a wait may spin and how politely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollPolicy {
    /// Upper bound for a single wait. `None` spins until the condition holds.
    pub timeout: Option<Duration>,
    /// Idle iterations after which the loop yields the processor once. Zero never yields.
    pub spin_limit: u32,
}

impl PollPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_spin_limit(mut self, spin_limit: u32) -> Self {
        self.spin_limit = spin_limit;
        self
    }
}

pub struct Waiter<C = MonotonicClock> {
    clock: C,
    policy: PollPolicy,
}

impl Waiter<MonotonicClock> {
    pub fn new(policy: PollPolicy) -> Self {
        Waiter::with_clock(MonotonicClock::default(), policy)
    }
}

impl<C: Clock> Waiter<C> {
    pub fn with_clock(clock: C, policy: PollPolicy) -> Self {
        Waiter { clock, policy }
    }

    #[inline]
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Runs `check` until it yields a value, calling `progress` between failed checks.
    ///
    /// Both closures get `state`, which is how a check and a progress step can share one
    /// endpoint. `check` always runs first, so a condition that already holds costs no progress
    /// step. An error from either closure ends the wait immediately. Once the policy's timeout has
    /// elapsed the wait fails with [`Error::Timeout`] naming `op`.
    pub fn poll_until<S: ?Sized, T>(
        &self,
        op: &'static str,
        state: &mut S,
        mut check: impl FnMut(&mut S) -> Result<Option<T>>,
        mut progress: impl FnMut(&mut S) -> Result<()>,
    ) -> Result<T> {
        let start = self.clock.now();
        let mut rounds: u64 = 0;
        let mut idle: u32 = 0;
        loop {
            if let Some(value) = check(state)? {
                tracing::trace!(op, rounds, "wait satisfied");
                return Ok(value);
            }
            if let Some(limit) = self.policy.timeout {
                let elapsed = self.clock.now().saturating_sub(start);
                if elapsed >= limit {
                    tracing::warn!(op, rounds, ?elapsed, "wait timed out");
                    return Err(Error::Timeout { op, elapsed });
                }
            }
            progress(state)?;
            rounds += 1;
            if self.policy.spin_limit > 0 {
                idle += 1;
                if idle >= self.policy.spin_limit {
                    idle = 0;
                    std::thread::yield_now();
                }
            }
        }
    }
}
