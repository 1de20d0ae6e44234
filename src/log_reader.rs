//! Backward traversal of a console's circular history memory.

use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use log::{debug, info, warn};

use crate::clock_sync::AvoidancePlan;
use crate::errors::{DriverError, Result};
use crate::host_clock::{sleep_cancellable, HostClock};
use crate::link::Link;
use crate::retry::RetryPolicy;
use crate::sample::Sample;

/// Interval byte value marking a never-written slot.
pub const SENTINEL_INTERVAL: u16 = 0xFF;

/// Shape of a circular log in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogGeometry {
    pub base_address: u16,
    /// Address of the highest entry slot.
    pub max_address: u16,
    pub entry_size: u16,
}

impl LogGeometry {
    /// The slot before `addr`, wrapping from the lowest slot to the highest.
    pub fn previous(&self, addr: u16) -> u16 {
        match addr.checked_sub(self.entry_size) {
            Some(prev) if prev >= self.base_address => prev,
            _ => self.max_address,
        }
    }

    pub fn capacity(&self) -> usize {
        if self.entry_size == 0 || self.max_address < self.base_address {
            return 0;
        }
        usize::from((self.max_address - self.base_address) / self.entry_size) + 1
    }

    /// Whether `addr` is the start of an entry slot.
    pub fn contains(&self, addr: u16) -> bool {
        self.entry_size != 0
            && addr >= self.base_address
            && addr <= self.max_address
            && (addr - self.base_address) % self.entry_size == 0
    }
}

/// Contents of a console's history status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStatus {
    /// Slot of the newest entry.
    pub write_pointer: u16,
    pub entry_count: usize,
    /// Timestamp of the newest entry, when the console keeps one.
    pub device_time: Option<NaiveDateTime>,
    pub logging_interval: Option<u16>,
}

/// One decoded slot before a timestamp is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    /// Minutes since the previous entry; [`SENTINEL_INTERVAL`] for an empty slot.
    pub interval_minutes: u16,
    pub sample: Sample,
}

/// A history record ready for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub address: u16,
    pub interval_minutes: u16,
    pub timestamp: NaiveDateTime,
    pub sample: Sample,
}

/// A device family with on-board history.
pub trait HistoryLog {
    fn geometry(&self) -> LogGeometry;
    fn read_status(&mut self, link: &mut Link) -> Result<LogStatus>;
    fn read_entry(&mut self, link: &mut Link, address: u16) -> Result<RawEntry>;
}

/// Inputs of one traversal.
#[derive(Debug, Clone)]
pub struct ReadParams {
    /// Newest record already handed downstream.
    pub last_update: Option<NaiveDateTime>,
    pub logging_interval_minutes: u16,
    pub ignore_device_clock: bool,
    /// Re-reads of one step after the write pointer moved.
    pub drift_retries: u32,
    pub drift_pause: Duration,
}

/// Round `t` to the nearest multiple of `minutes` since midnight.
pub fn snap_to_interval(t: NaiveDateTime, minutes: u16) -> NaiveDateTime {
    let step = i64::from(minutes.max(1)) * 60;
    let midnight = t.date().and_time(chrono::NaiveTime::MIN);
    let secs = i64::from(t.num_seconds_from_midnight());
    let snapped = (secs + step / 2) / step * step;
    midnight + TimeDelta::seconds(snapped)
}

/// Hold off while the console is about to write.
fn wait_until_safe(link: &Link, plan: Option<&AvoidancePlan>) -> Result<()> {
    let Some(plan) = plan else {
        return Ok(());
    };
    let delay = plan.delay_needed(link.clock().now());
    if !delay.is_zero() {
        debug!("inside avoidance window, waiting {:?}", delay);
        sleep_cancellable(link.clock(), delay, link.cancel())?;
    }
    Ok(())
}

/// Walk the log from the write pointer backward and return the entries
/// newer than `params.last_update`, newest first.
///
/// Nothing is returned unless the walk completes: a write pointer that keeps
/// moving aborts the whole read with [`DriverError::AddressPointerDrift`].
pub fn read_back(
    log: &mut dyn HistoryLog,
    link: &mut Link,
    plan: Option<&AvoidancePlan>,
    params: &ReadParams,
) -> Result<Vec<LogEntry>> {
    let geometry = log.geometry();

    wait_until_safe(link, plan)?;
    let status = log.read_status(link)?;
    if !geometry.contains(status.write_pointer) {
        return Err(DriverError::Protocol(format!(
            "write pointer {:#06X} outside history log",
            status.write_pointer
        )));
    }

    let interval = status
        .logging_interval
        .filter(|i| *i > 0)
        .unwrap_or(params.logging_interval_minutes);
    let seed = match status.device_time {
        Some(t) if !params.ignore_device_clock => t,
        _ => link.clock().now(),
    };
    let limit = status.entry_count.min(geometry.capacity());
    info!(
        "reading history: pointer={:#06X}, entries={}, since={:?}",
        status.write_pointer, limit, params.last_update
    );

    let clock = link.clock_handle();
    let cancel = link.cancel().clone();
    let policy = RetryPolicy::new(params.drift_retries.saturating_add(1), params.drift_pause);

    let mut running = snap_to_interval(seed, interval);
    let mut pointer = status.write_pointer;
    let mut addr = status.write_pointer;
    let mut entries = Vec::new();

    while entries.len() < limit {
        cancel.check()?;
        if params.last_update.map_or(false, |last| running <= last) {
            debug!("reached last update at {}", running);
            break;
        }

        let raw = policy.run_filtered(
            clock.as_ref(),
            &cancel,
            |e| matches!(e, DriverError::AddressPointerDrift { .. }),
            |_| {
                wait_until_safe(link, plan)?;
                let current = log.read_status(link)?.write_pointer;
                if current != pointer {
                    let drift = DriverError::AddressPointerDrift {
                        previous: pointer,
                        current,
                    };
                    warn!("{drift}, pausing before re-reading {:#06X}", addr);
                    pointer = current;
                    return Err(drift);
                }
                log.read_entry(link, addr)
            },
        )?;

        if raw.interval_minutes == SENTINEL_INTERVAL {
            debug!("empty slot at {:#06X}", addr);
            break;
        }

        let mut sample = raw.sample;
        sample.timestamp = running;
        sample.interval_seconds = u32::from(raw.interval_minutes) * 60;
        entries.push(LogEntry {
            address: addr,
            interval_minutes: raw.interval_minutes,
            timestamp: running,
            sample,
        });

        running -= TimeDelta::minutes(i64::from(raw.interval_minutes));
        addr = geometry.previous(addr);
    }

    info!("history read: entries={}", entries.len());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;

    use super::*;
    use crate::host_clock::{HostClock, ManualClock};
    use crate::test_utils::{clock_at, mock_link, MockTransport};

    const GEOMETRY: LogGeometry = LogGeometry {
        base_address: 0x100,
        max_address: 0xFFF0,
        entry_size: 0x10,
    };

    /// In-memory log: `slots[i]` holds `(interval, temperature)` of entry `i`
    /// counted backward from the write pointer.
    struct FakeLog {
        pointer: u16,
        slots: Vec<(u16, f64)>,
        device_time: Option<NaiveDateTime>,
        /// Write-pointer values reported by successive status reads.
        pointer_script: Vec<u16>,
        status_reads: usize,
    }

    impl FakeLog {
        fn new(slots: Vec<(u16, f64)>) -> Self {
            Self {
                pointer: 0x120,
                slots,
                device_time: None,
                pointer_script: Vec::new(),
                status_reads: 0,
            }
        }
    }

    impl HistoryLog for FakeLog {
        fn geometry(&self) -> LogGeometry {
            GEOMETRY
        }

        fn read_status(&mut self, _link: &mut Link) -> Result<LogStatus> {
            if let Some(p) = self.pointer_script.get(self.status_reads) {
                self.pointer = *p;
            }
            self.status_reads += 1;
            Ok(LogStatus {
                write_pointer: self.pointer,
                entry_count: self.slots.len(),
                device_time: self.device_time,
                logging_interval: Some(5),
            })
        }

        fn read_entry(&mut self, _link: &mut Link, address: u16) -> Result<RawEntry> {
            let mut back = 0;
            let mut a = 0x120;
            while a != address {
                a = GEOMETRY.previous(a);
                back += 1;
            }
            let (interval, temp) = self.slots.get(back).copied().unwrap_or((0xFF, 0.0));
            let mut sample = Sample::default();
            sample.outdoor_temperature = Some(temp);
            Ok(RawEntry {
                interval_minutes: interval,
                sample,
            })
        }
    }

    fn params(last_update: Option<NaiveDateTime>) -> ReadParams {
        ReadParams {
            last_update,
            logging_interval_minutes: 5,
            ignore_device_clock: false,
            drift_retries: 2,
            drift_pause: Duration::from_secs(1),
        }
    }

    fn link_at(h: u32, m: u32) -> (Arc<ManualClock>, Link) {
        let clock = Arc::new(clock_at(2024, 3, 10, h, m));
        let link = mock_link(MockTransport::echo(), Arc::clone(&clock));
        (clock, link)
    }

    #[test]
    fn test_previous_wraps_to_max_address() {
        assert_eq!(0xFFF0, GEOMETRY.previous(0x100));
        assert_eq!(0x100, GEOMETRY.previous(0x110));
        assert_eq!(0xFFE0, GEOMETRY.previous(0xFFF0));
        assert_eq!(4080, GEOMETRY.capacity());
        assert!(GEOMETRY.contains(0xFFF0));
        assert!(!GEOMETRY.contains(0x0F0));
        assert!(!GEOMETRY.contains(0x108));

        let small = LogGeometry {
            base_address: 0x04,
            max_address: 0x34,
            entry_size: 0x10,
        };
        assert_eq!(0x34, small.previous(0x04));
    }

    #[test]
    fn test_snap_to_interval() {
        let t = |h, m, s| {
            NaiveDate::from_ymd_opt(2024, 3, 10)
                .unwrap()
                .and_hms_opt(h, m, s)
                .unwrap()
        };
        assert_eq!(t(12, 5, 0), snap_to_interval(t(12, 6, 29), 5));
        assert_eq!(t(12, 10, 0), snap_to_interval(t(12, 7, 30), 5));
        assert_eq!(t(12, 0, 0), snap_to_interval(t(12, 0, 0), 5));
        assert_eq!(
            NaiveDate::from_ymd_opt(2024, 3, 11)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            snap_to_interval(t(23, 58, 0), 5)
        );
    }

    #[test]
    fn test_walks_back_and_stops_at_last_update() {
        let (clock, mut link) = link_at(12, 1);
        let mut log = FakeLog::new(vec![(5, 1.0), (5, 2.0), (10, 3.0), (5, 4.0), (5, 5.0)]);
        let last = clock.now() - TimeDelta::minutes(16);

        let entries = read_back(&mut log, &mut link, None, &params(Some(last))).unwrap();

        let times: Vec<_> = entries.iter().map(|e| e.timestamp.time().to_string()).collect();
        assert_eq!(vec!["12:00:00", "11:55:00", "11:50:00"], times);
        let addresses: Vec<_> = entries.iter().map(|e| e.address).collect();
        assert_eq!(vec![0x120, 0x110, 0x100], addresses);
        assert_eq!(Some(3.0), entries[2].sample.outdoor_temperature);
        assert_eq!(600, entries[2].sample.interval_seconds);
    }

    #[test]
    fn test_stops_at_sentinel_and_count() {
        let (_clock, mut link) = link_at(12, 0);
        let mut log = FakeLog::new(vec![(5, 1.0), (0xFF, 0.0), (5, 3.0)]);
        let entries = read_back(&mut log, &mut link, None, &params(None)).unwrap();
        assert_eq!(1, entries.len());

        let mut log = FakeLog::new(vec![(5, 1.0), (5, 2.0)]);
        let entries = read_back(&mut log, &mut link, None, &params(None)).unwrap();
        assert_eq!(2, entries.len());
        assert_eq!(0x110, entries[1].address);
    }

    #[test]
    fn test_device_time_seeds_clock_unless_ignored() {
        let (_clock, mut link) = link_at(12, 0);
        let device = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let mut log = FakeLog::new(vec![(5, 1.0)]);
        log.device_time = Some(device);

        let entries = read_back(&mut log, &mut link, None, &params(None)).unwrap();
        assert_eq!(device, entries[0].timestamp);

        let mut ignoring = params(None);
        ignoring.ignore_device_clock = true;
        let entries = read_back(&mut log, &mut link, None, &ignoring).unwrap();
        assert_eq!("12:00:00", entries[0].timestamp.time().to_string());
    }

    #[test]
    fn test_pointer_drift_pauses_and_retries() {
        let (clock, mut link) = link_at(12, 0);
        let start = clock.now();
        let mut log = FakeLog::new(vec![(5, 1.0), (5, 2.0)]);
        // Initial status, first step moves, then stable.
        log.pointer_script = vec![0x120, 0x130, 0x130, 0x130, 0x130];

        let entries = read_back(&mut log, &mut link, None, &params(None)).unwrap();
        assert_eq!(2, entries.len());
        assert_eq!(start + TimeDelta::seconds(1), clock.now());
    }

    #[test]
    fn test_persistent_drift_aborts_read() {
        let (_clock, mut link) = link_at(12, 0);
        let mut log = FakeLog::new(vec![(5, 1.0), (5, 2.0)]);
        log.pointer_script = vec![0x120, 0x130, 0x140, 0x150, 0x160];

        let result = read_back(&mut log, &mut link, None, &params(None));
        assert!(matches!(
            result,
            Err(DriverError::AddressPointerDrift {
                previous: 0x140,
                current: 0x150
            })
        ));
    }

    #[test]
    fn test_avoidance_window_delays_reads() {
        let (clock, mut link) = link_at(12, 0);
        let start = clock.now();
        let plan = AvoidancePlan::new(vec![(start + TimeDelta::seconds(1), 60)], -2, 3);
        let mut log = FakeLog::new(vec![(5, 1.0)]);

        read_back(&mut log, &mut link, Some(&plan), &params(None)).unwrap();
        assert_eq!(start + TimeDelta::seconds(5), clock.now());
    }
}
