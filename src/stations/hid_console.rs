//! USB HID console with a circular history memory.
//!
//! The console exposes 64 KiB of memory read 32 bytes at a time with the
//! report `A1 hi lo 20 A1 hi lo 20`. The first 256 bytes are a fixed block
//! (logging interval, entry count, write pointer, pressure calibration);
//! the rest is a ring of history entries of which the one under the write
//! pointer is the live reading the console keeps updating.
//!
//! There is no device checksum: a response is accepted when it is exactly
//! one block long.

use log::{debug, info, warn};

use crate::clock_sync::{ClockProbe, ProbeSample, TickKind, TickRegion};
use crate::codec::{drain_only, exchange, Frame, FrameCodec};
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

const READ_COMMAND: u8 = 0xA1;
const READ_SIZE: u8 = 0x20;
pub const BLOCK_LEN: usize = 32;

const FIXED_MAGIC: [u8; 2] = [0x55, 0xAA];
const FIXED_LEN: usize = 0x24;
const OFFSET_READ_PERIOD: usize = 16;
const OFFSET_DATA_COUNT: usize = 27;
const OFFSET_CURRENT_POS: usize = 30;
const OFFSET_REL_PRESSURE: usize = 32;
const OFFSET_ABS_PRESSURE: usize = 34;

const HISTORY_BASE: u16 = 0x100;
const ENTRY_LEN: u16 = 0x10;
const SOLAR_ENTRY_LEN: u16 = 0x14;

/// Status bit set while the outdoor sensors are out of contact.
const STATUS_LOST_CONTACT: u8 = 0x40;

const RAIN_PER_TICK: f64 = 0.3;
const LUX_TO_WM2: f64 = 0.0079;

/// Sensor block refresh interval.
const SENSOR_TICK_SECS: i64 = 48;
const SOLAR_TICK_SECS: i64 = 60;
const CONSOLE_MINUTE_SECS: i64 = 60;

pub fn geometry(solar: bool) -> LogGeometry {
    if solar {
        LogGeometry {
            base_address: HISTORY_BASE,
            max_address: 0xFFEC,
            entry_size: SOLAR_ENTRY_LEN,
        }
    } else {
        LogGeometry {
            base_address: HISTORY_BASE,
            max_address: 0xFFF0,
            entry_size: ENTRY_LEN,
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Block-read reports; the payload of a request is the big-endian address.
#[derive(Debug, Clone, Copy, Default)]
pub struct HidCodec;

impl FrameCodec for HidCodec {
    fn encode(&self, command: u8, payload: &[u8]) -> Vec<u8> {
        let hi = payload.first().copied().unwrap_or(0);
        let lo = payload.get(1).copied().unwrap_or(0);
        vec![command, hi, lo, READ_SIZE, command, hi, lo, READ_SIZE]
    }

    fn prefix_len(&self, _command: u8) -> usize {
        BLOCK_LEN
    }

    fn frame_len(&self, _command: u8, _prefix: &[u8]) -> Result<usize> {
        Ok(BLOCK_LEN)
    }

    fn decode(&self, bytes: &[u8], outstanding: u8) -> Result<Frame> {
        if bytes.len() < BLOCK_LEN {
            return Err(DriverError::ShortFrame {
                declared: BLOCK_LEN,
                received: bytes.len(),
            });
        }
        if bytes.len() > BLOCK_LEN {
            return Err(DriverError::Protocol(format!(
                "block of {} bytes, expected {BLOCK_LEN}",
                bytes.len()
            )));
        }
        Ok(Frame::verified(outstanding, bytes.to_vec()))
    }
}

fn read_block(link: &mut Link, policy: &RetryPolicy, address: u16) -> Result<Vec<u8>> {
    let frame = exchange(
        link,
        &HidCodec,
        policy,
        READ_COMMAND,
        &address.to_be_bytes(),
        drain_only,
    )?;
    Ok(frame.into_payload())
}

/// Read `len` bytes at `address` through as many aligned blocks as it spans.
pub fn read_range(
    link: &mut Link,
    policy: &RetryPolicy,
    address: u16,
    len: usize,
) -> Result<Vec<u8>> {
    let start = u32::from(address) & !(BLOCK_LEN as u32 - 1);
    let end = u32::from(address) + len as u32;
    let mut bytes = Vec::with_capacity(len + BLOCK_LEN);
    let mut block = start;
    while block < end {
        bytes.extend(read_block(link, policy, (block & 0xFFFF) as u16)?);
        block += BLOCK_LEN as u32;
    }
    let offset = (u32::from(address) - start) as usize;
    bytes
        .get(offset..offset + len)
        .map(<[u8]>::to_vec)
        .ok_or(DriverError::ShortFrame {
            declared: offset + len,
            received: bytes.len(),
        })
}

// ============================================================================
// Decoding
// ============================================================================

fn u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// The console's fixed block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedBlock {
    pub read_period: u8,
    pub data_count: u16,
    pub current_pos: u16,
    pub rel_pressure: f64,
    pub abs_pressure: f64,
}

impl FixedBlock {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_LEN {
            return Err(DriverError::ShortFrame {
                declared: FIXED_LEN,
                received: bytes.len(),
            });
        }
        if bytes[..2] != FIXED_MAGIC {
            return Err(DriverError::Protocol(format!(
                "fixed block magic {:02X?}",
                &bytes[..2]
            )));
        }
        Ok(Self {
            read_period: bytes[OFFSET_READ_PERIOD],
            data_count: u16_le(bytes, OFFSET_DATA_COUNT),
            current_pos: u16_le(bytes, OFFSET_CURRENT_POS),
            rel_pressure: f64::from(u16_le(bytes, OFFSET_REL_PRESSURE)) / 10.0,
            abs_pressure: f64::from(u16_le(bytes, OFFSET_ABS_PRESSURE)) / 10.0,
        })
    }

    /// Added to absolute pressure to give the sea-level pressure the console shows.
    pub fn pressure_offset(&self) -> f64 {
        self.rel_pressure - self.abs_pressure
    }
}

fn humidity(b: u8) -> Option<f64> {
    (b != 0xFF).then(|| f64::from(b))
}

/// Sign-and-magnitude tenths of a degree.
fn temperature(bytes: &[u8], offset: usize) -> Option<f64> {
    let raw = u16_le(bytes, offset);
    if raw == 0xFFFF {
        return None;
    }
    let magnitude = f64::from(raw & 0x7FFF) / 10.0;
    Some(if raw & 0x8000 != 0 { -magnitude } else { magnitude })
}

fn wind(low: u8, high_nibble: u8) -> Option<f64> {
    let raw = u16::from(high_nibble) << 8 | u16::from(low);
    (raw != 0xFFF).then(|| f64::from(raw) / 10.0)
}

/// Decode one history entry. `pressure_offset` turns the stored absolute
/// pressure into relative pressure.
pub fn decode_entry(bytes: &[u8], solar: bool, pressure_offset: f64) -> Result<RawEntry> {
    let len = usize::from(if solar { SOLAR_ENTRY_LEN } else { ENTRY_LEN });
    if bytes.len() < len {
        return Err(DriverError::ShortFrame {
            declared: len,
            received: bytes.len(),
        });
    }

    let mut sample = Sample::default();
    sample.indoor_humidity = humidity(bytes[1]);
    sample.indoor_temperature = temperature(bytes, 2);
    sample.outdoor_humidity = humidity(bytes[4]);
    sample.outdoor_temperature = temperature(bytes, 5);

    let pressure = u16_le(bytes, 7);
    sample.pressure = (pressure != 0xFFFF).then(|| f64::from(pressure) / 10.0 + pressure_offset);

    sample.wind_speed = wind(bytes[9], bytes[11] & 0x0F);
    sample.wind_gust = wind(bytes[10], bytes[11] >> 4);
    sample.wind_bearing = (bytes[12] & 0x80 == 0).then(|| f64::from(bytes[12] & 0x0F) * 22.5);

    let rain = u16_le(bytes, 13);
    sample.rain_counter = (rain != 0xFFFF).then(|| f64::from(rain) * RAIN_PER_TICK);

    if solar {
        let lux = u32::from(bytes[16]) | u32::from(bytes[17]) << 8 | u32::from(bytes[18]) << 16;
        sample.solar_radiation = (lux != 0xFF_FFFF).then(|| f64::from(lux) / 10.0 * LUX_TO_WM2);
        sample.uv_index = (bytes[19] != 0xFF).then(|| f64::from(bytes[19]));
    }

    if bytes[15] & STATUS_LOST_CONTACT != 0 {
        debug!("outdoor sensors out of contact: status={:#04X}", bytes[15]);
        sample.outdoor_temperature = None;
        sample.outdoor_humidity = None;
        sample.wind_speed = None;
        sample.wind_gust = None;
        sample.wind_bearing = None;
        sample.rain_counter = None;
    }

    Ok(RawEntry {
        interval_minutes: u16::from(bytes[0]),
        sample,
    })
}

// ============================================================================
// Station
// ============================================================================

pub struct HidConsole {
    policy: RetryPolicy,
    solar: bool,
    fixed: Option<FixedBlock>,
}

impl HidConsole {
    pub fn new(policy: RetryPolicy, solar: bool) -> Self {
        Self {
            policy,
            solar,
            fixed: None,
        }
    }

    pub fn fixed_block(&self) -> Option<&FixedBlock> {
        self.fixed.as_ref()
    }

    fn entry_len(&self) -> usize {
        usize::from(geometry(self.solar).entry_size)
    }

    fn read_fixed(&mut self, link: &mut Link) -> Result<FixedBlock> {
        let bytes = read_range(link, &self.policy, 0, FIXED_LEN)?;
        let fixed = FixedBlock::parse(&bytes)?;
        self.fixed = Some(fixed);
        Ok(fixed)
    }

    fn pressure_offset(&self) -> f64 {
        self.fixed.map_or(0.0, |f| f.pressure_offset())
    }

    fn read_raw(&mut self, link: &mut Link, address: u16) -> Result<RawEntry> {
        let bytes = read_range(link, &self.policy, address, self.entry_len())?;
        decode_entry(&bytes, self.solar, self.pressure_offset())
    }
}

impl Station for HidConsole {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::HidConsole
    }

    fn start(&mut self, link: &mut Link) -> Result<()> {
        let fixed = self.read_fixed(link)?;
        info!(
            "hid console ready: interval={}min, entries={}, pointer={:#06X}, pressure_offset={:.1}",
            fixed.read_period,
            fixed.data_count,
            fixed.current_pos,
            fixed.pressure_offset()
        );
        Ok(())
    }

    fn decode_live(&mut self, link: &mut Link) -> Result<Sample> {
        let fixed = self.read_fixed(link)?;
        let raw = self.read_raw(link, fixed.current_pos)?;
        if raw.sample.outdoor_temperature.is_none() && raw.sample.indoor_temperature.is_some() {
            warn!("live reading without outdoor data");
        }
        Ok(raw.sample)
    }

    fn history(&mut self) -> Option<&mut dyn HistoryLog> {
        Some(self)
    }

    fn clock_probe(&mut self) -> Option<&mut dyn ClockProbe> {
        Some(self)
    }
}

impl HistoryLog for HidConsole {
    fn geometry(&self) -> LogGeometry {
        geometry(self.solar)
    }

    fn read_status(&mut self, link: &mut Link) -> Result<LogStatus> {
        let fixed = self.read_fixed(link)?;
        Ok(LogStatus {
            write_pointer: fixed.current_pos,
            entry_count: usize::from(fixed.data_count),
            device_time: None,
            logging_interval: Some(u16::from(fixed.read_period)),
        })
    }

    fn read_entry(&mut self, link: &mut Link, address: u16) -> Result<RawEntry> {
        self.read_raw(link, address)
    }
}

impl ClockProbe for HidConsole {
    fn tick_regions(&self) -> Vec<TickRegion> {
        let mut regions = vec![
            TickRegion {
                kind: TickKind::SensorTick,
                bytes: 1..16,
                period_secs: SENSOR_TICK_SECS,
                required: true,
            },
            TickRegion {
                kind: TickKind::ConsoleMinute,
                bytes: 0..0,
                period_secs: CONSOLE_MINUTE_SECS,
                required: false,
            },
        ];
        if self.solar {
            regions.push(TickRegion {
                kind: TickKind::SolarTick,
                bytes: 16..20,
                period_secs: SOLAR_TICK_SECS,
                required: true,
            });
        }
        regions
    }

    fn sample_block(&mut self, link: &mut Link) -> Result<ProbeSample> {
        let head = read_block(link, &self.policy, 0)?;
        let pointer = u16_le(&head, OFFSET_CURRENT_POS);
        let bytes = read_range(link, &self.policy, pointer, self.entry_len())?;
        Ok(ProbeSample {
            bytes,
            write_pointer: Some(pointer),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{clock_at, mock_link, HidMemory};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10))
    }

    fn entry() -> Vec<u8> {
        vec![
            5,    // minutes since previous entry
            45,   // indoor humidity
            0xD7, 0x00, // 21.5
            80,   // outdoor humidity
            0x23, 0x80, // -3.5
            0x74, 0x27, // 1010.0 hPa absolute
            35,   // average 3.5 m/s
            80,   // gust 8.0 m/s
            0x00, // high nibbles
            4,    // east
            100, 0, // 100 tips
            0x00, // status
        ]
    }

    fn memory_with_fixed(pointer: u16, count: u16) -> HidMemory {
        let memory = HidMemory::new();
        memory.write(0, &FIXED_MAGIC);
        memory.write(OFFSET_READ_PERIOD, &[5]);
        memory.write_u16(OFFSET_DATA_COUNT, count);
        memory.write_u16(OFFSET_CURRENT_POS, pointer);
        memory.write_u16(OFFSET_REL_PRESSURE, 10132);
        memory.write_u16(OFFSET_ABS_PRESSURE, 10100);
        memory
    }

    #[test]
    fn test_encode_read_report() {
        assert_eq!(
            vec![0xA1, 0x01, 0x20, 0x20, 0xA1, 0x01, 0x20, 0x20],
            HidCodec.encode(READ_COMMAND, &0x0120u16.to_be_bytes())
        );
    }

    #[test]
    fn test_block_length_is_the_integrity_check() {
        assert!(HidCodec.decode(&[0u8; 32], READ_COMMAND).unwrap().is_verified());
        assert!(matches!(
            HidCodec.decode(&[0u8; 31], READ_COMMAND),
            Err(DriverError::ShortFrame {
                declared: 32,
                received: 31
            })
        ));
        assert!(matches!(
            HidCodec.decode(&[0u8; 33], READ_COMMAND),
            Err(DriverError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_entry() {
        let raw = decode_entry(&entry(), false, 3.2).unwrap();
        let s = &raw.sample;
        assert_eq!(5, raw.interval_minutes);
        assert_eq!(Some(45.0), s.indoor_humidity);
        assert_eq!(Some(21.5), s.indoor_temperature);
        assert_eq!(Some(80.0), s.outdoor_humidity);
        assert_eq!(Some(-3.5), s.outdoor_temperature);
        assert!((s.pressure.unwrap() - 1013.2).abs() < 1e-9);
        assert_eq!(Some(3.5), s.wind_speed);
        assert_eq!(Some(8.0), s.wind_gust);
        assert_eq!(Some(90.0), s.wind_bearing);
        assert!((s.rain_counter.unwrap() - 30.0).abs() < 1e-9);
        assert_eq!(None, s.solar_radiation);
    }

    #[test]
    fn test_lost_contact_clears_outdoor_readings() {
        let mut bytes = entry();
        bytes[15] = STATUS_LOST_CONTACT;
        let s = decode_entry(&bytes, false, 0.0).unwrap().sample;
        assert_eq!(None, s.outdoor_temperature);
        assert_eq!(None, s.wind_speed);
        assert_eq!(None, s.rain_counter);
        assert_eq!(Some(21.5), s.indoor_temperature);
    }

    #[test]
    fn test_invalid_wind_direction() {
        let mut bytes = entry();
        bytes[12] = 0x80;
        assert_eq!(None, decode_entry(&bytes, false, 0.0).unwrap().sample.wind_bearing);
    }

    #[test]
    fn test_solar_fields() {
        let mut bytes = entry();
        // 12000.0 lux, UV 3
        bytes.extend_from_slice(&[0xC0, 0xD4, 0x01, 3]);
        let s = decode_entry(&bytes, true, 0.0).unwrap().sample;
        assert!((s.solar_radiation.unwrap() - 12_000.0 * LUX_TO_WM2).abs() < 1e-9);
        assert_eq!(Some(3.0), s.uv_index);

        assert!(matches!(
            decode_entry(&entry(), true, 0.0),
            Err(DriverError::ShortFrame { declared: 20, .. })
        ));
    }

    #[test]
    fn test_fixed_block() {
        let mut bytes = vec![0u8; FIXED_LEN];
        bytes[..2].copy_from_slice(&FIXED_MAGIC);
        bytes[OFFSET_READ_PERIOD] = 10;
        bytes[OFFSET_CURRENT_POS..OFFSET_CURRENT_POS + 2].copy_from_slice(&0x1230u16.to_le_bytes());
        bytes[OFFSET_REL_PRESSURE..OFFSET_REL_PRESSURE + 2]
            .copy_from_slice(&10132u16.to_le_bytes());
        bytes[OFFSET_ABS_PRESSURE..OFFSET_ABS_PRESSURE + 2]
            .copy_from_slice(&10100u16.to_le_bytes());

        let fixed = FixedBlock::parse(&bytes).unwrap();
        assert_eq!(10, fixed.read_period);
        assert_eq!(0x1230, fixed.current_pos);
        assert!((fixed.pressure_offset() - 3.2).abs() < 1e-9);

        bytes[0] = 0x00;
        assert!(matches!(FixedBlock::parse(&bytes), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_read_range_spans_blocks() {
        let memory = HidMemory::new();
        let data: Vec<u8> = (0..20).collect();
        memory.write(0x11C, &data);
        let transport = memory.transport();
        let sent = transport.sent_log();
        let mut link = mock_link(transport, Arc::new(clock_at(2024, 1, 15, 8, 0)));

        assert_eq!(data, read_range(&mut link, &policy(), 0x11C, 20).unwrap());
        let requests = sent.lock().unwrap().clone();
        assert_eq!(2, requests.len());
        assert_eq!(&[0xA1, 0x01, 0x00], &requests[0][..3]);
        assert_eq!(&[0xA1, 0x01, 0x20], &requests[1][..3]);
    }

    #[test]
    fn test_live_read_applies_pressure_offset() {
        let memory = memory_with_fixed(0x1230, 100);
        memory.write(0x1230, &entry());
        let mut link = mock_link(memory.transport(), Arc::new(clock_at(2024, 1, 15, 8, 0)));
        let mut console = HidConsole::new(policy(), false);

        console.start(&mut link).unwrap();
        assert_eq!(Some(0x1230), console.fixed_block().map(|f| f.current_pos));
        let sample = console.decode_live(&mut link).unwrap();
        assert!((sample.pressure.unwrap() - 1013.2).abs() < 1e-9);
        assert_eq!(Some(-3.5), sample.outdoor_temperature);
    }

    #[test]
    fn test_status_and_probe() {
        let memory = memory_with_fixed(0x1230, 100);
        memory.write(0x1230, &entry());
        let mut link = mock_link(memory.transport(), Arc::new(clock_at(2024, 1, 15, 8, 0)));
        let mut console = HidConsole::new(policy(), false);

        let status = console.read_status(&mut link).unwrap();
        assert_eq!(0x1230, status.write_pointer);
        assert_eq!(100, status.entry_count);
        assert_eq!(Some(5), status.logging_interval);

        let probe = console.sample_block(&mut link).unwrap();
        assert_eq!(Some(0x1230), probe.write_pointer);
        assert_eq!(entry(), probe.bytes);
        assert_eq!(2, console.tick_regions().len());
        assert_eq!(3, HidConsole::new(policy(), true).tick_regions().len());
    }
}
