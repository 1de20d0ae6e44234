//! Serial console addressed nibble by nibble.
//!
//! Memory is nibble-addressed and every read is a dialogue in which each
//! byte the host sends is acknowledged before the next one:
//!
//! ```text
//! host  82+4*a3   console  00+a3
//! host  82+4*a2   console  10+a2
//! host  82+4*a1   console  20+a1
//! host  82+4*a0   console  30+a0
//! host  C2+4*n    console  30+n, n data bytes, byte sum of the data
//! ```
//!
//! A console that lost track of the dialogue is brought back by sending
//! `06` until it answers `02`.

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, info, warn};

use crate::checksum::{byte_sum, verify};
use crate::codec::Frame;
use crate::config::DeviceFamily;
use crate::errors::{DriverError, Result};
use crate::link::Link;
use crate::log_reader::{HistoryLog, LogGeometry, LogStatus, RawEntry};
use crate::retry::RetryPolicy;
use crate::sample::Sample;
use crate::stations::Station;

// ============================================================================
// Constants
// ============================================================================

const RESET_REQUEST: u8 = 0x06;
const RESET_ACK: u8 = 0x02;
const RESET_TRIES: usize = 50;

const ADDRESS_BASE: u8 = 0x82;
const COUNT_BASE: u8 = 0xC2;
const COUNT_ACK_BASE: u8 = 0x30;

/// Longest single read the console accepts.
pub const MAX_READ: usize = 15;

const ADDR_INDOOR_TEMPERATURE: u16 = 0x346;
const ADDR_OUTDOOR_TEMPERATURE: u16 = 0x373;
const ADDR_INDOOR_HUMIDITY: u16 = 0x3FB;
const ADDR_OUTDOOR_HUMIDITY: u16 = 0x419;
const ADDR_RAIN_1H: u16 = 0x4B4;
const ADDR_RAIN_TOTAL: u16 = 0x4D2;
const ADDR_WIND: u16 = 0x527;
const ADDR_PRESSURE: u16 = 0x5E2;
const ADDR_HISTORY_STATUS: u16 = 0x6B2;

const HISTORY_BASE: u16 = 0x6C6;
const HISTORY_RECORD_NIBBLES: u16 = 19;
const HISTORY_LAST_RECORD: u16 = 0xAE;

/// Rain gauge tip in millimetres.
const RAIN_PER_TICK: f64 = 0.518;

pub const GEOMETRY: LogGeometry = LogGeometry {
    base_address: HISTORY_BASE,
    max_address: HISTORY_BASE + HISTORY_LAST_RECORD * HISTORY_RECORD_NIBBLES,
    entry_size: HISTORY_RECORD_NIBBLES,
};

// ============================================================================
// Addressing
// ============================================================================

/// The four address bytes, most significant nibble first.
pub fn encode_address(address: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    for (step, byte) in out.iter_mut().enumerate() {
        let nibble = (address >> (12 - 4 * step)) as u8 & 0x0F;
        *byte = ADDRESS_BASE + nibble * 4;
    }
    out
}

/// Inverse of [`encode_address`]; `None` if any byte is not an address byte.
pub fn decode_address(bytes: &[u8; 4]) -> Option<u16> {
    bytes.iter().try_fold(0u16, |acc, b| {
        let offset = b.checked_sub(ADDRESS_BASE)?;
        if offset % 4 != 0 || offset / 4 > 0x0F {
            return None;
        }
        Some(acc << 4 | u16::from(offset / 4))
    })
}

pub fn encode_count(count: u8) -> u8 {
    COUNT_BASE + count * 4
}

fn expect_ack(link: &mut Link, step: usize, byte: u8, expected: u8) -> Result<()> {
    link.send(&[byte])?;
    let reply = link.receive_exact(1)?;
    if reply[0] != expected {
        return Err(DriverError::AckMismatch {
            step,
            expected,
            received: reply[0],
        });
    }
    Ok(())
}

/// Bring the console back to the start of a dialogue.
pub fn reset(link: &mut Link) -> Result<()> {
    for _ in 0..RESET_TRIES {
        link.discard_input()?;
        link.send(&[RESET_REQUEST])?;
        match link.receive(1) {
            Ok(reply) if reply.first() == Some(&RESET_ACK) => return Ok(()),
            Ok(reply) => debug!("reset answered with {:02X?}", reply),
            Err(DriverError::Timeout(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Err(DriverError::Timeout("console never acknowledged reset".into()))
}

fn read_chunk(link: &mut Link, address: u16, count: u8) -> Result<Frame> {
    for (step, byte) in encode_address(address).into_iter().enumerate() {
        let nibble = (byte - ADDRESS_BASE) / 4;
        expect_ack(link, step, byte, step as u8 * 16 + nibble)?;
    }
    expect_ack(link, 4, encode_count(count), COUNT_ACK_BASE + count)?;

    let mut data = link.receive_exact(usize::from(count) + 1)?;
    let Some(received) = data.pop() else {
        return Err(DriverError::ShortFrame {
            declared: usize::from(count) + 1,
            received: 0,
        });
    };
    verify(byte_sum(&data), received)?;
    Ok(Frame::verified(COUNT_BASE, data))
}

/// Read `len` bytes starting at nibble `address`, split into console-sized
/// chunks. A failed chunk resets the dialogue and is re-read.
pub fn read_memory(
    link: &mut Link,
    policy: &RetryPolicy,
    address: u16,
    len: usize,
) -> Result<Vec<u8>> {
    let clock = link.clock_handle();
    let cancel = link.cancel().clone();
    let mut out = Vec::with_capacity(len);
    let mut chunk_address = address;

    while out.len() < len {
        let count = (len - out.len()).min(MAX_READ) as u8;
        let frame = policy.run(clock.as_ref(), &cancel, |attempt| {
            if attempt > 0 {
                reset(link)?;
            }
            let result = read_chunk(link, chunk_address, count);
            if let Err(e) = &result {
                warn!(
                    "read rejected: address={:#06X}, attempt={}, error={}",
                    chunk_address,
                    attempt + 1,
                    e
                );
            }
            result
        })?;
        out.extend_from_slice(frame.payload());
        chunk_address = chunk_address.wrapping_add(u16::from(count) * 2);
    }
    Ok(out)
}

// ============================================================================
// Decoding
// ============================================================================

/// Little-endian BCD over the first `nibbles` nibbles; `None` if a nibble is not a digit.
fn bcd(data: &[u8], nibbles: usize) -> Option<u32> {
    let mut value = 0u32;
    for i in (0..nibbles).rev() {
        let nibble = (*data.get(i / 2)? >> (4 * (i % 2))) & 0x0F;
        if nibble > 9 {
            return None;
        }
        value = value * 10 + u32::from(nibble);
    }
    Some(value)
}

fn bcd_byte(b: u8) -> u32 {
    u32::from(b >> 4) * 10 + u32::from(b & 0x0F)
}

/// One history record (19 nibbles, read as 10 bytes).
pub fn decode_history_record(d: &[u8]) -> Result<Sample> {
    if d.len() < 10 {
        return Err(DriverError::ShortFrame {
            declared: 10,
            received: d.len(),
        });
    }
    let mut sample = Sample::default();

    let temperatures = u32::from(d[2] & 0x0F) << 16 | u32::from(d[1]) << 8 | u32::from(d[0]);
    sample.indoor_temperature = Some(f64::from(temperatures % 1000) / 10.0 - 30.0);
    sample.outdoor_temperature = Some(f64::from(temperatures / 1000) / 10.0 - 30.0);

    let packed = u32::from(d[4]) << 12 | u32::from(d[3]) << 4 | u32::from(d[2] >> 4);
    let mut pressure = 1000.0 + f64::from(packed % 10_000) / 10.0;
    if pressure >= 1502.2 {
        pressure -= 1000.0;
    }
    sample.pressure = Some(pressure);
    sample.indoor_humidity = Some(f64::from(packed / 10_000));
    sample.outdoor_humidity = Some(f64::from(d[5]));

    let ticks = u32::from(d[7] & 0x0F) << 8 | u32::from(d[6]);
    sample.rain_counter = Some(f64::from(ticks) * RAIN_PER_TICK);

    let wind = u32::from(d[9] & 0x0F) << 12 | u32::from(d[8]) << 4 | u32::from(d[7] >> 4);
    sample.wind_speed = Some(f64::from(wind % 1000) / 10.0);
    sample.wind_bearing = Some(f64::from(wind / 1000 % 16) * 22.5);
    Ok(sample)
}

// ============================================================================
// Station
// ============================================================================

pub struct NibbleSerial {
    policy: RetryPolicy,
    /// Logging interval last reported by the status block.
    interval: u16,
}

impl NibbleSerial {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, interval: 0 }
    }

    fn read(&self, link: &mut Link, address: u16, len: usize) -> Result<Vec<u8>> {
        read_memory(link, &self.policy, address, len)
    }

    fn read_bcd(&self, link: &mut Link, address: u16, nibbles: usize) -> Result<Option<u32>> {
        let data = self.read(link, address, nibbles.div_ceil(2))?;
        let value = bcd(&data, nibbles);
        if value.is_none() {
            debug!("non-BCD reading ignored: address={:#06X}, data={:02X?}", address, data);
        }
        Ok(value)
    }
}

impl Station for NibbleSerial {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::NibbleSerial
    }

    fn start(&mut self, link: &mut Link) -> Result<()> {
        reset(link)?;
        info!("nibble console ready: link={}", link.describe());
        Ok(())
    }

    fn decode_live(&mut self, link: &mut Link) -> Result<Sample> {
        let mut sample = Sample::default();
        let temperature = |raw: u32| f64::from(raw) / 100.0 - 30.0;

        sample.indoor_temperature = self
            .read_bcd(link, ADDR_INDOOR_TEMPERATURE, 4)?
            .map(temperature);
        sample.outdoor_temperature = self
            .read_bcd(link, ADDR_OUTDOOR_TEMPERATURE, 4)?
            .map(temperature);
        sample.indoor_humidity = self.read_bcd(link, ADDR_INDOOR_HUMIDITY, 2)?.map(f64::from);
        sample.outdoor_humidity = self.read_bcd(link, ADDR_OUTDOOR_HUMIDITY, 2)?.map(f64::from);
        sample.pressure = self
            .read_bcd(link, ADDR_PRESSURE, 5)?
            .map(|raw| f64::from(raw) / 10.0);
        sample.rain_counter = self
            .read_bcd(link, ADDR_RAIN_TOTAL, 6)?
            .map(|raw| f64::from(raw) / 100.0);
        sample.rain_rate = self
            .read_bcd(link, ADDR_RAIN_1H, 6)?
            .map(|raw| f64::from(raw) / 100.0);

        let wind = self.read(link, ADDR_WIND, 3)?;
        if wind[0] == 0x00 {
            let speed = u16::from(wind[2] & 0x0F) << 8 | u16::from(wind[1]);
            sample.wind_speed = Some(f64::from(speed) / 10.0);
            sample.wind_bearing = Some(f64::from(wind[2] >> 4) * 22.5);
        } else {
            debug!("wind reading not ready: status={:#04X}", wind[0]);
        }
        Ok(sample)
    }

    fn history(&mut self) -> Option<&mut dyn HistoryLog> {
        Some(self)
    }
}

impl HistoryLog for NibbleSerial {
    fn geometry(&self) -> LogGeometry {
        GEOMETRY
    }

    fn read_status(&mut self, link: &mut Link) -> Result<LogStatus> {
        let d = self.read(link, ADDR_HISTORY_STATUS, 10)?;

        self.interval = (u16::from(d[1] & 0x0F) << 8 | u16::from(d[0])) + 1;

        let device_time: Option<NaiveDateTime> =
            NaiveDate::from_ymd_opt(2000 + bcd_byte(d[7]) as i32, bcd_byte(d[6]), bcd_byte(d[5]))
                .and_then(|date| date.and_hms_opt(bcd_byte(d[4]), bcd_byte(d[3]), 0));
        if device_time.is_none() {
            warn!("history status carries an invalid timestamp: {:02X?}", &d[3..8]);
        }

        let last_record = u16::from(d[8]);
        if last_record > HISTORY_LAST_RECORD {
            return Err(DriverError::Protocol(format!(
                "last history record {last_record} beyond {HISTORY_LAST_RECORD}"
            )));
        }

        Ok(LogStatus {
            write_pointer: HISTORY_BASE + last_record * HISTORY_RECORD_NIBBLES,
            entry_count: usize::from(d[9]),
            device_time,
            logging_interval: Some(self.interval),
        })
    }

    fn read_entry(&mut self, link: &mut Link, address: u16) -> Result<RawEntry> {
        let data = self.read(link, address, 10)?;
        Ok(RawEntry {
            interval_minutes: self.interval,
            sample: decode_history_record(&data)?,
        })
    }
}
