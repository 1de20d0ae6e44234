//! One station session: bring-up, clock synchronisation, backfill, then
//! live polling until cancelled.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::NaiveDateTime;
use log::{error, info, warn};
use once_cell::sync::Lazy;

use crate::backfill::{BackfillReport, Sequencer};
use crate::clock_sync::{ClockSynchronizer, SyncState};
use crate::config::StationConfig;
use crate::errors::{DriverError, Result};
use crate::host_clock::{CancelToken, HostClock};
use crate::link::{Link, LinkHealth};
use crate::live::{LivePoller, TickOutcome, Ticker};
use crate::log_reader::{read_back, ReadParams};
use crate::pipeline::{RecordSink, SampleProcessor, SessionState};
use crate::stations::{self, Station};
use crate::transport::{self, ShutdownHandle, Transport};

/// Only one station reads its history at a time.
static BACKFILL_GATE: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Pause before re-reading a log entry after the write pointer moved.
const DRIFT_PAUSE: Duration = Duration::from_secs(2);

/// Opens a fresh transport when the current one is lost.
pub type Connector = Box<dyn FnMut() -> Result<Box<dyn Transport>> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Session {
    config: StationConfig,
    station: Box<dyn Station>,
    link: Link,
    processor: SampleProcessor,
    sync: ClockSynchronizer,
    poller: LivePoller,
    sink: Box<dyn RecordSink>,
    connector: Connector,
    shutdown: Arc<Mutex<Option<ShutdownHandle>>>,
}

impl Session {
    /// Validate `config` and open its transport.
    pub fn open(
        config: StationConfig,
        sink: Box<dyn RecordSink>,
        state: Option<SessionState>,
        clock: Arc<dyn HostClock>,
        cancel: CancelToken,
    ) -> Result<Self> {
        config.validate()?;
        let transport_config = config.transport();
        let io_timeout = config.io_timeout();
        let mut connector: Connector =
            Box::new(move || transport::open(&transport_config, io_timeout));
        let transport = connector()?;
        let mut session = Self::with_transport(config, transport, sink, state, clock, cancel);
        session.connector = connector;
        Ok(session)
    }

    /// A session over an already open transport. Reconnecting reopens the
    /// configured transport unless [`with_connector`](Self::with_connector) says otherwise.
    pub fn with_transport(
        config: StationConfig,
        transport: Box<dyn Transport>,
        sink: Box<dyn RecordSink>,
        state: Option<SessionState>,
        clock: Arc<dyn HostClock>,
        cancel: CancelToken,
    ) -> Self {
        let station = stations::build(&config);
        Self::with_station(config, station, transport, sink, state, clock, cancel)
    }

    pub fn with_station(
        config: StationConfig,
        station: Box<dyn Station>,
        transport: Box<dyn Transport>,
        sink: Box<dyn RecordSink>,
        state: Option<SessionState>,
        clock: Arc<dyn HostClock>,
        cancel: CancelToken,
    ) -> Self {
        let link = Link::new(transport, config.io_timeout(), clock, cancel);
        let shutdown = Arc::new(Mutex::new(link.shutdown_handle()));
        let transport_config = config.transport();
        let io_timeout = config.io_timeout();
        Self {
            processor: SampleProcessor::new(&config, state),
            sync: ClockSynchronizer::new(config.clock.clone()),
            poller: LivePoller::from_config(&config),
            connector: Box::new(move || transport::open(&transport_config, io_timeout)),
            config,
            station,
            link,
            sink,
            shutdown,
        }
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn health(&self) -> &Arc<LinkHealth> {
        self.link.health()
    }

    /// Snapshot to persist for the next session.
    pub fn state(&self) -> &SessionState {
        self.processor.state()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn start(&mut self) -> Result<()> {
        self.station.start(&mut self.link)?;
        info!(
            "session started: family={}, link={}",
            self.config.family.name(),
            self.link.describe()
        );
        Ok(())
    }

    /// Locate the device's write ticks. `None` for families without observable clocks.
    pub fn synchronize_clock(&mut self) -> Option<SyncState> {
        let probe = self.station.clock_probe()?;
        Some(self.sync.synchronize(probe, &mut self.link))
    }

    /// Replay the history accumulated since the last record handed downstream.
    pub fn backfill(&mut self) -> Result<BackfillReport> {
        let Some(log) = self.station.history() else {
            info!("no on-board history: family={}", self.config.family.name());
            return Ok(BackfillReport::default());
        };

        let _gate = lock(&BACKFILL_GATE);
        let params = ReadParams {
            last_update: self.processor.last_update(),
            logging_interval_minutes: self.config.logging_interval_minutes,
            ignore_device_clock: self.config.ignore_device_clock,
            drift_retries: self.config.retry.drift_retries,
            drift_pause: DRIFT_PAUSE,
        };
        let plan = self.sync.plan();
        let entries = read_back(log, &mut self.link, plan.as_ref(), &params)?;
        Sequencer::new(&mut self.processor).replay(entries, self.sink.as_mut())
    }

    /// One live tick, recalibrating the device clocks first when they are due.
    pub fn poll_once(&mut self) -> TickOutcome {
        let now = self.link.clock().now();
        if self.sync.needs_calibration(now) && self.station.clock_probe().is_some() {
            info!("recalibrating device clocks");
            self.synchronize_clock();
        }
        let plan = self.sync.plan();
        self.poller.tick(
            self.station.as_mut(),
            &mut self.link,
            &mut self.processor,
            self.sink.as_mut(),
            plan.as_ref(),
        )
    }

    /// Poll at the configured period until `until` (or forever), reconnecting
    /// when the link faults or the data stops.
    pub fn run_live(&mut self, until: Option<NaiveDateTime>) -> Result<()> {
        let clock = self.link.clock_handle();
        let cancel = self.link.cancel().clone();
        let mut ticker = Ticker::new(self.poller.period());
        loop {
            ticker.wait(clock.as_ref(), &cancel)?;
            if until.map_or(false, |end| clock.now() >= end) {
                info!("live polling finished at {}", clock.now());
                return Ok(());
            }
            if let TickOutcome::Failed(e) = self.poll_once() {
                if matches!(e, DriverError::Cancelled) {
                    return Err(e);
                }
                if e.is_link_fault() || self.link.health().is_data_stopped() {
                    match self.reconnect() {
                        Ok(()) => {}
                        Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
                        Err(e) => error!("reconnect failed: {}", e),
                    }
                }
            }
        }
    }

    /// Start, synchronise, backfill, then poll live. A failed backfill is
    /// logged and live polling goes ahead.
    pub fn run(&mut self, until: Option<NaiveDateTime>) -> Result<()> {
        self.start()?;
        if let Some(state) = self.synchronize_clock() {
            info!("device clocks: {:?}", state);
        }
        match self.backfill() {
            Ok(_) => {}
            Err(DriverError::Cancelled) => return Err(DriverError::Cancelled),
            Err(e) => error!("backfill failed, continuing with live data: {}", e),
        }
        self.run_live(until)
    }

    fn reconnect(&mut self) -> Result<()> {
        let clock = self.link.clock_handle();
        let cancel = self.link.cancel().clone();
        warn!("reconnecting: link={}", self.link.describe());
        self.link.close();

        let connector = &mut self.connector;
        let transport = self.config.reconnect_policy().run_filtered(
            clock.as_ref(),
            &cancel,
            |e| !matches!(e, DriverError::Cancelled | DriverError::Config(_)),
            |attempt| {
                info!("reconnect attempt {}", attempt + 1);
                connector()
            },
        )?;
        self.link.replace(transport);
        *lock(&self.shutdown) = self.link.shutdown_handle();
        self.station.start(&mut self.link)
    }

    /// Leave the console idle, close the transport and hand back the state to persist.
    pub fn stop(mut self) -> SessionState {
        self.station.stop(&mut self.link);
        self.link.close();
        info!("session stopped: family={}", self.config.family.name());
        self.processor.state().clone()
    }

    /// Run the session on its own worker thread.
    pub fn spawn(mut self, until: Option<NaiveDateTime>) -> Result<SessionHandle> {
        let cancel = self.link.cancel().clone();
        let health = Arc::clone(self.link.health());
        let shutdown = Arc::clone(&self.shutdown);
        let worker = thread::Builder::new()
            .name(format!("wx-{}", self.config.family.name()))
            .spawn(move || {
                match self.run(until) {
                    Ok(()) | Err(DriverError::Cancelled) => {}
                    Err(e) => error!("session ended: {}", e),
                }
                self.stop()
            })?;
        Ok(SessionHandle {
            cancel,
            health,
            shutdown,
            worker,
        })
    }
}

/// Control side of a spawned session.
pub struct SessionHandle {
    cancel: CancelToken,
    health: Arc<LinkHealth>,
    shutdown: Arc<Mutex<Option<ShutdownHandle>>>,
    worker: JoinHandle<SessionState>,
}

impl SessionHandle {
    pub fn health(&self) -> &Arc<LinkHealth> {
        &self.health
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Cancel, abort in-flight I/O where the transport allows it, and wait
    /// for the worker to hand back its state.
    pub fn stop(self) -> Result<SessionState> {
        self.cancel.cancel();
        if let Some(handle) = lock(&self.shutdown).as_ref() {
            handle.shutdown();
        }
        self.worker.join().map_err(|_| DriverError::WorkerPanicked)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::accumulators::Accumulators;
    use crate::config::DeviceFamily;
    use crate::host_clock::ManualClock;
    use crate::sample::Sample;
    use crate::test_utils::{clock_at, HidMemory, MockTransport};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<Sample>>>);

    impl RecordSink for SharedSink {
        fn record(&mut self, sample: &Sample, _totals: &Accumulators) -> Result<()> {
            self.0.lock().unwrap().push(sample.clone());
            Ok(())
        }
    }

    fn hid_config() -> StationConfig {
        let mut config = StationConfig {
            family: DeviceFamily::HidConsole,
            failure_threshold: 2,
            ..StationConfig::default()
        };
        config.clock.disabled = true;
        config.retry.reconnect_backoff_secs = 1;
        config
    }

    /// Fixed block plus four five-minute entries, the newest at 0x130.
    fn console() -> HidMemory {
        let memory = HidMemory::new();
        memory.write(0, &[0x55, 0xAA]);
        memory.write(16, &[5]);
        memory.write_u16(27, 4);
        memory.write_u16(30, 0x130);
        memory.write_u16(32, 10132);
        memory.write_u16(34, 10100);
        for (i, temperature) in [100u16, 110, 120, 130].iter().enumerate() {
            let mut entry = vec![0u8; 16];
            entry[0] = 5;
            entry[1] = 50;
            entry[2..4].copy_from_slice(&215u16.to_le_bytes());
            entry[4] = 70;
            entry[5..7].copy_from_slice(&temperature.to_le_bytes());
            entry[7..9].copy_from_slice(&10100u16.to_le_bytes());
            entry[12] = 0;
            memory.write(0x100 + i * 0x10, &entry);
        }
        memory
    }

    fn session(clock: &Arc<ManualClock>, transport: MockTransport, sink: &SharedSink) -> Session {
        Session::with_transport(
            hid_config(),
            Box::new(transport),
            Box::new(sink.clone()),
            None,
            Arc::clone(clock) as Arc<dyn HostClock>,
            CancelToken::new(),
        )
    }

    #[test]
    fn test_backfill_then_live() {
        let clock = Arc::new(clock_at(2024, 7, 1, 12, 0));
        let start = clock.now();
        let sink = SharedSink::default();
        let mut session = session(&clock, console().transport(), &sink);

        session.run(Some(start + TimeDelta::seconds(45))).unwrap();
        assert_eq!(SyncState::Fallback, session.sync_state());

        let records = sink.0.lock().unwrap().clone();
        assert!(records.len() > 4, "only {} records", records.len());
        let history: Vec<String> = records[..4]
            .iter()
            .map(|s| s.timestamp.format("%H:%M").to_string())
            .collect();
        assert_eq!(vec!["11:45", "11:50", "11:55", "12:00"], history);
        assert_eq!(Some(10.0), records[0].outdoor_temperature);
        assert!((records[0].pressure.unwrap() - 1013.2).abs() < 1e-9);
        for pair in records.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        assert!(session.state().last_update.unwrap() > start);

        // Nothing new in the log: a second backfill applies nothing.
        let report = session.backfill().unwrap();
        assert_eq!(0, report.applied);
    }

    #[test]
    fn test_reconnects_after_data_stops() {
        let clock = Arc::new(clock_at(2024, 7, 1, 12, 0));
        let start = clock.now();
        let sink = SharedSink::default();
        let memory = console();
        let mut session = session(&clock, MockTransport::scripted(Vec::new()), &sink)
            .with_connector(Box::new(move || {
                Ok(Box::new(memory.transport()) as Box<dyn Transport>)
            }));

        session.run_live(Some(start + TimeDelta::minutes(2))).unwrap();

        assert!(!session.health().is_data_stopped());
        assert!(!sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_spawned_session_hands_back_state() {
        let clock = Arc::new(clock_at(2024, 7, 1, 12, 0));
        let start = clock.now();
        let sink = SharedSink::default();
        let session = session(&clock, console().transport(), &sink);

        let handle = session.spawn(Some(start + TimeDelta::seconds(30))).unwrap();
        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(5));
        }
        let state = handle.stop().unwrap();
        assert_eq!(state.last_update, sink.0.lock().unwrap().last().map(|s| s.timestamp));
    }
}
