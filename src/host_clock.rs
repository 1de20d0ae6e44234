//! Host wall-clock access and cooperative cancellation.
//!
//! Everything that waits (retry backoff, avoidance delays, poll periods) goes
//! through [`HostClock`] so that timing can be driven deterministically by a
//! [`ManualClock`] in tests and simulations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta};

use crate::errors::{DriverError, Result};

/// Longest uninterrupted sleep; cancellation is noticed at least this often.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Source of "now" (station local time) and of blocking waits.
pub trait HostClock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
    fn sleep(&self, duration: Duration);
}

/// The real clock: local wall time and `thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl HostClock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A clock that only moves when slept on or advanced explicitly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, duration: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += TimeDelta::from_std(duration).unwrap_or(TimeDelta::zero());
        }
    }

    pub fn set(&self, instant: NaiveDateTime) {
        if let Ok(mut now) = self.now.lock() {
            *now = instant;
        }
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Shared running flag. Cloned into every component that blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the token has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DriverError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Sleep for `duration`, waking early with `Err(Cancelled)` if the token trips.
pub fn sleep_cancellable(
    clock: &dyn HostClock,
    duration: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let mut remaining = duration;
    while !remaining.is_zero() {
        cancel.check()?;
        let slice = remaining.min(SLEEP_SLICE);
        clock.sleep(slice);
        remaining -= slice;
    }
    cancel.check()
}
