//! Weather station acquisition driver.
//!
//! Talks to consumer weather consoles over serial, USB HID and TCP, reads
//! back the history a console logged while nobody was polling it, and then
//! polls live readings at a fixed period. Every record, historic or live,
//! goes through the same validation, day-rollover and accumulation pipeline
//! before it reaches a [`RecordSink`].
//!
//! # Timing
//!
//! Consoles that keep history write to it on their own clocks. A read that
//! overlaps such a write can return a half-updated entry, so families with
//! observable clocks are synchronised first ([`ClockSynchronizer`]) and every
//! read is held back while the console is about to write
//! ([`AvoidancePlan`]).
//!
//! History timestamps are reconstructed by walking back from the newest
//! entry in steps of each entry's own interval, seeded from the console's
//! clock or, when that is not trusted, the host's.
//!
//! # Sessions
//!
//! A [`Session`] owns one transport and runs start, clock synchronisation,
//! backfill and live polling in that order, on the caller's thread or its
//! own ([`Session::spawn`]). Its [`SessionState`] is serialisable so that a
//! later session resumes exactly after the last record handed downstream.

pub mod accumulators;
pub mod backfill;
pub mod checksum;
pub mod clock_sync;
pub mod codec;
pub mod config;
mod errors;
pub mod host_clock;
pub mod link;
pub mod live;
pub mod log_reader;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod rollover;
pub mod sample;
pub mod session;
pub mod stations;
pub mod transport;
pub mod validation;

#[cfg(test)]
mod test_utils;

pub use accumulators::{AccumulationSettings, Accumulators, DaySummary};
pub use backfill::{BackfillReport, Sequencer};
pub use clock_sync::{AvoidancePlan, ClockProbe, ClockSynchronizer, SyncState, TickKind};
pub use config::{DeviceFamily, StationConfig, TransportConfig};
pub use errors::*;
pub use host_clock::{CancelToken, HostClock, ManualClock, SystemClock};
pub use link::{Link, LinkHealth};
pub use live::{LivePoller, SkipReason, TickOutcome};
pub use log_reader::{HistoryLog, LogEntry, LogGeometry};
pub use logging::{init_logging, init_logging_with};
pub use pipeline::{Outcome, RecordSink, SampleProcessor, SessionState};
pub use sample::{Field, Sample};
pub use session::{Session, SessionHandle};
pub use stations::Station;
pub use transport::Transport;
pub use validation::SanityBounds;
