//! Bounded retry combinator shared by transports, codecs and the log reader.
//!
//! Operations receive the zero-based attempt number so they can run their
//! family's reset handshake before every attempt after the first.

use std::time::Duration;

use log::debug;

use crate::errors::{DriverError, Result};
use crate::host_clock::{sleep_cancellable, CancelToken, HostClock};

/// How many times an operation is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// A single attempt, no waiting.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with an error that is not
    /// [`retryable`](DriverError::is_retryable), or the attempt budget is spent.
    pub fn run<T, F>(&self, clock: &dyn HostClock, cancel: &CancelToken, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        self.run_filtered(clock, cancel, DriverError::is_retryable, op)
    }

    /// Like [`run`](Self::run) with a caller-chosen notion of which errors are worth retrying.
    pub fn run_filtered<T, F, P>(
        &self,
        clock: &dyn HostClock,
        cancel: &CancelToken,
        retry_if: P,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
        P: Fn(&DriverError) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            cancel.check()?;
            if attempt > 0 && !self.backoff.is_zero() {
                sleep_cancellable(clock, self.backoff, cancel)?;
            }

            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
                Err(e) if retry_if(&e) && attempt + 1 < attempts => {
                    debug!(
                        "attempt failed, retrying: attempt={}/{}, error={}",
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| DriverError::Timeout("retries exhausted".into())))
    }
}
