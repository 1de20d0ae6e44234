//! Session-owned transport handle and its health record.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use log::{error, info};

use crate::errors::{ConnectionError, DriverError, Result};
use crate::host_clock::{CancelToken, HostClock};
use crate::transport::{ShutdownHandle, Transport};

// ============================================================================
// Link Health
// ============================================================================

#[derive(Debug, Default)]
struct HealthTimes {
    last_good: Option<NaiveDateTime>,
    stopped_since: Option<NaiveDateTime>,
}

/// Failure bookkeeping shared read-only with whoever raises alarms.
#[derive(Debug, Default)]
pub struct LinkHealth {
    consecutive_failures: AtomicU32,
    data_stopped: AtomicBool,
    times: Mutex<HealthTimes>,
}

impl LinkHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A read succeeded: clear the failure count and the "data stopped" condition.
    pub fn record_success(&self, now: NaiveDateTime) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let was_stopped = self.data_stopped.swap(false, Ordering::SeqCst);
        let mut times = self.lock_times();
        times.last_good = Some(now);
        if was_stopped {
            info!("data flowing again: at={}", now);
            times.stopped_since = None;
        }
    }

    /// A read failed. Returns `true` when this failure crossed `threshold`
    /// and the link just entered the "data stopped" condition.
    pub fn record_failure(&self, now: NaiveDateTime, threshold: u32) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < threshold || self.data_stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        error!("data stopped: consecutive_failures={}, at={}", failures, now);
        self.lock_times().stopped_since = Some(now);
        true
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_data_stopped(&self) -> bool {
        self.data_stopped.load(Ordering::SeqCst)
    }

    pub fn stopped_since(&self) -> Option<NaiveDateTime> {
        self.lock_times().stopped_since
    }

    pub fn last_good(&self) -> Option<NaiveDateTime> {
        self.lock_times().last_good
    }

    fn lock_times(&self) -> std::sync::MutexGuard<'_, HealthTimes> {
        match self.times.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Link
// ============================================================================

/// The one transport a session owns, with the timing and cancellation every
/// exchange on it must honour.
pub struct Link {
    transport: Option<Box<dyn Transport>>,
    io_timeout: Duration,
    clock: Arc<dyn HostClock>,
    cancel: CancelToken,
    health: Arc<LinkHealth>,
}

impl Link {
    pub fn new(
        transport: Box<dyn Transport>,
        io_timeout: Duration,
        clock: Arc<dyn HostClock>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transport: Some(transport),
            io_timeout,
            clock,
            cancel,
            health: LinkHealth::new(),
        }
    }

    /// A link without a transport yet; every I/O call fails until [`replace`](Self::replace).
    pub fn detached(io_timeout: Duration, clock: Arc<dyn HostClock>, cancel: CancelToken) -> Self {
        Self {
            transport: None,
            io_timeout,
            clock,
            cancel,
            health: LinkHealth::new(),
        }
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.cancel.check()?;
        self.transport
            .as_mut()
            .ok_or(DriverError::Connection(ConnectionError::Closed))
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let timeout = self.io_timeout;
        self.transport()?.send(bytes, timeout)
    }

    pub fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let timeout = self.io_timeout;
        self.receive_timeout(max_bytes, timeout)
    }

    pub fn receive_timeout(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.transport()?.receive(max_bytes, timeout)
    }

    pub fn receive_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let timeout = self.io_timeout;
        self.transport()?.receive_exact(len, timeout)
    }

    pub fn discard_input(&mut self) -> Result<()> {
        self.transport()?.discard_input()
    }

    /// Swap in a freshly opened transport, closing the old one.
    pub fn replace(&mut self, transport: Box<dyn Transport>) {
        self.close();
        info!("link attached: {}", transport.describe());
        self.transport = Some(transport);
    }

    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn describe(&self) -> String {
        self.transport
            .as_ref()
            .map(|t| t.describe())
            .unwrap_or_else(|| "detached".into())
    }

    pub fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.transport.as_ref()?.shutdown_handle()
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn clock(&self) -> &dyn HostClock {
        self.clock.as_ref()
    }

    pub fn clock_handle(&self) -> Arc<dyn HostClock> {
        Arc::clone(&self.clock)
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn health(&self) -> &Arc<LinkHealth> {
        &self.health
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{clock_at, MockTransport};

    #[test]
    fn test_health_threshold_and_recovery() {
        let health = LinkHealth::default();
        let now = clock_at(2024, 1, 1, 12, 0).now();

        for _ in 0..4 {
            assert!(!health.record_failure(now, 5));
        }
        assert!(!health.is_data_stopped());
        assert!(health.record_failure(now, 5));
        assert!(health.is_data_stopped());
        assert_eq!(Some(now), health.stopped_since());
        // Further failures do not re-announce.
        assert!(!health.record_failure(now, 5));
        assert_eq!(6, health.consecutive_failures());

        health.record_success(now);
        assert!(!health.is_data_stopped());
        assert_eq!(0, health.consecutive_failures());
        assert_eq!(None, health.stopped_since());
        assert_eq!(Some(now), health.last_good());
    }

    #[test]
    fn test_cancelled_link_refuses_io() {
        let cancel = CancelToken::new();
        let mut link = Link::new(
            Box::new(MockTransport::echo()),
            Duration::from_millis(10),
            Arc::new(clock_at(2024, 1, 1, 0, 0)),
            cancel.clone(),
        );
        link.send(&[1, 2]).unwrap();
        assert_eq!(vec![1, 2], link.receive_exact(2).unwrap());

        cancel.cancel();
        assert!(matches!(link.send(&[1]), Err(DriverError::Cancelled)));
    }

    #[test]
    fn test_detached_link_reports_closed() {
        let mut link = Link::detached(
            Duration::from_millis(10),
            Arc::new(clock_at(2024, 1, 1, 0, 0)),
            CancelToken::new(),
        );
        assert!(!link.is_open());
        assert!(matches!(
            link.receive(4),
            Err(DriverError::Connection(ConnectionError::Closed))
        ));
        link.replace(Box::new(MockTransport::echo()));
        assert!(link.is_open());
        assert_eq!("mock", link.describe());
    }
}
