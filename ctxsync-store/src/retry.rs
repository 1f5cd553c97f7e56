//! Bounded retry with linearly growing delay.
//!
//! The controller is a plain synchronous loop. Sleeping and stop detection
//! come from a [`RetryContext`], so the same loop runs on a dedicated thread,
//! on a blocking pool, or under a test clock.
//!
//! Stop requests are observed only between attempts: an attempt that has
//! started always runs to completion.

use std::time::Duration;

use ctxsync_core::RetrySettings;

use crate::error::{RetryError, StoreError};

/// Sleep and stop detection for [`RetryPolicy::run`].
pub trait RetryContext {
    /// `true` once no new attempt may start.
    fn is_cancelled(&self) -> bool;

    /// Block for `delay` before the next attempt.
    fn sleep(&mut self, delay: Duration);
}

/// Plain `thread::sleep`, never cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl RetryContext for ThreadSleep {
    fn is_cancelled(&self) -> bool {
        false
    }

    fn sleep(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Successful result of a retry sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Delay slept before each retry, in order.
    pub delays: Vec<Duration>,
}

impl<T> Retried<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(settings.max_attempts, settings.base_delay())
    }

    /// Wait after failed attempt number `attempt` (1-based): `base × attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `op` until it succeeds, the attempt budget is spent, or `ctx`
    /// reports cancellation at a retry boundary. `op` receives the 1-based
    /// attempt number.
    pub fn run<T, C, F>(&self, ctx: &mut C, mut op: F) -> Result<Retried<T>, RetryError>
    where
        C: RetryContext + ?Sized,
        F: FnMut(u32) -> Result<T, StoreError>,
    {
        let mut delays = Vec::new();
        let mut attempt = 1;

        loop {
            let err = match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("succeeded on attempt {attempt}/{}", self.max_attempts);
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                        delays,
                    });
                }
                Err(err) => err,
            };

            if attempt >= self.max_attempts {
                tracing::error!("attempt {attempt}/{} failed, giving up: {err}", self.max_attempts);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    delays,
                    last: err,
                });
            }
            if ctx.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    delays,
                    last: err,
                });
            }

            let delay = self.delay_after(attempt);
            tracing::warn!(
                "attempt {attempt}/{} failed: {err}; retrying in {}ms",
                self.max_attempts,
                delay.as_millis()
            );
            ctx.sleep(delay);
            delays.push(delay);

            if ctx.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    delays,
                    last: err,
                });
            }
            attempt += 1;
        }
    }
}
