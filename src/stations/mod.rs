//! Device families.
//!
//! Each family implements [`Station`]: how to bring the console up, how to
//! turn one live read into a [`Sample`], and which optional capabilities
//! (on-board history, observable clock ticks) it has.

use log::info;

use crate::clock_sync::ClockProbe;
use crate::config::{DeviceFamily, StationConfig};
use crate::errors::Result;
use crate::link::Link;
use crate::log_reader::HistoryLog;
use crate::sample::Sample;

pub mod gateway;
pub mod hid_console;
pub mod nibble;
pub mod stream;

pub use gateway::Gateway;
pub use hid_console::HidConsole;
pub use nibble::NibbleSerial;
pub use stream::StreamSerial;

/// Capabilities of one device family.
pub trait Station: Send {
    fn family(&self) -> DeviceFamily;

    /// Bring the console into a state where it answers reads.
    fn start(&mut self, link: &mut Link) -> Result<()>;

    /// Leave the console idle before the transport is closed.
    fn stop(&mut self, _link: &mut Link) {}

    /// One live reading. The timestamp is assigned by the caller.
    fn decode_live(&mut self, link: &mut Link) -> Result<Sample>;

    /// On-board history, for families that keep one.
    fn history(&mut self) -> Option<&mut dyn HistoryLog> {
        None
    }

    /// Observable device clocks, for families whose reads can be torn by a tick.
    fn clock_probe(&mut self) -> Option<&mut dyn ClockProbe> {
        None
    }
}

/// The family implementation selected by `config`.
pub fn build(config: &StationConfig) -> Box<dyn Station> {
    let policy = config.exchange_policy();
    info!(
        "station family: {}, attempts={}",
        config.family.name(),
        policy.attempts
    );
    match config.family {
        DeviceFamily::Gateway => Box::new(Gateway::new(policy)),
        DeviceFamily::NibbleSerial => Box::new(NibbleSerial::new(policy)),
        DeviceFamily::HidConsole => Box::new(HidConsole::new(policy, config.solar_sensor)),
        DeviceFamily::StreamSerial => Box::new(StreamSerial::new(config.poll_period())),
    }
}
