//! Serial console that pushes packets unprompted.
//!
//! ```text
//! FF FF | type | payload | sum
//! ```
//!
//! The payload length is fixed per type and `sum` is the rolling signed-byte
//! sum of everything before it. Packets for different sensors arrive on
//! their own schedules, so a live reading is the merge of the latest packet
//! of every type.

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, info};

use crate::checksum::{signed_sum, verify};
use crate::config::DeviceFamily;
use crate::errors::{DriverError, Result};
use crate::link::Link;
use crate::sample::{Field, Sample, EXTRA_CHANNELS};
use crate::stations::Station;

// ============================================================================
// Constants
// ============================================================================

const SYNC: u8 = 0xFF;

pub const TYPE_WIND: u8 = 0x00;
pub const TYPE_RAIN: u8 = 0x01;
pub const TYPE_EXTRA: u8 = 0x02;
pub const TYPE_OUTDOOR: u8 = 0x03;
pub const TYPE_INDOOR: u8 = 0x05;
pub const TYPE_MINUTE: u8 = 0x0E;
pub const TYPE_CLOCK: u8 = 0x0F;
pub const TYPE_SOLAR: u8 = 0x10;

/// Reads per live tick before giving the buffered bytes to the decoder.
const MAX_DRAIN_READS: usize = 64;

/// Payload length of each packet type.
pub fn payload_len(kind: u8) -> Option<usize> {
    match kind {
        TYPE_WIND | TYPE_RAIN => Some(7),
        TYPE_EXTRA | TYPE_CLOCK => Some(5),
        TYPE_OUTDOOR => Some(4),
        TYPE_INDOOR => Some(6),
        TYPE_MINUTE => Some(1),
        TYPE_SOLAR => Some(3),
        _ => None,
    }
}

// ============================================================================
// Packet Buffer
// ============================================================================

/// One checksummed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
enum PacketLength {
    Complete(usize),
    Partial,
    Malformed(DriverError),
}

fn length_from_bytes(buf: &[u8]) -> PacketLength {
    use PacketLength::*;

    for (i, b) in buf.iter().take(2).enumerate() {
        if *b != SYNC {
            return Malformed(DriverError::Protocol(format!("byte {i} is {b:#04X}, not sync")));
        }
    }
    if buf.len() < 3 {
        return Partial;
    }
    let kind = buf[2];
    let Some(len) = payload_len(kind) else {
        return Malformed(DriverError::UnknownCommand(kind));
    };
    let total = 3 + len + 1;
    if buf.len() < total {
        return Partial;
    }
    match verify(signed_sum(&buf[..total - 1]) as u8, buf[total - 1]) {
        Ok(()) => Complete(total),
        Err(e) => Malformed(e),
    }
}

/// Accumulates raw serial bytes and hands out verified packets, skipping
/// forward one byte at a time past anything that does not check out.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: Vec<u8>,
    skipped: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete packet, `None` until enough bytes are buffered.
    pub fn next_packet(&mut self) -> Option<Packet> {
        loop {
            match length_from_bytes(&self.buf) {
                PacketLength::Complete(len) => {
                    let packet = Packet {
                        kind: self.buf[2],
                        payload: self.buf[3..len - 1].to_vec(),
                    };
                    self.buf.drain(..len);
                    return Some(packet);
                }
                PacketLength::Partial => return None,
                PacketLength::Malformed(e) => {
                    debug!("resynchronising: {}", e);
                    self.buf.drain(..1);
                    self.skipped += 1;
                }
            }
        }
    }

    /// Bytes discarded while resynchronising.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn bcd(b: u8) -> f64 {
    f64::from(b >> 4) * 10.0 + f64::from(b & 0x0F)
}

/// BCD tenths, units, tens and a two-bit hundreds digit; bit 7 of `hi` is the sign.
fn temperature(lo: u8, hi: u8) -> f64 {
    let magnitude = f64::from(lo & 0x0F) / 10.0
        + f64::from(lo >> 4)
        + f64::from(hi & 0x0F) * 10.0
        + f64::from((hi >> 4) & 0x03) * 100.0;
    if hi & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Fold one packet into the running reading.
pub fn apply_packet(packet: &Packet, sample: &mut Sample) {
    let p = &packet.payload;
    match packet.kind {
        TYPE_WIND => {
            sample.wind_bearing = Some(bcd(p[1]) + f64::from(p[2] & 0x0F) * 100.0);
            sample.wind_gust = Some(bcd(p[3]) + f64::from(p[2] >> 4) / 10.0);
            let tenths = f64::from(p[4] & 0x0F) / 10.0;
            sample.wind_speed = Some(tenths + f64::from(p[4] >> 4) + f64::from(p[5] & 0x0F) * 10.0);
        }
        TYPE_RAIN => {
            sample.rain_rate = Some(bcd(p[1]) + f64::from(p[2] & 0x0F) * 100.0);
            sample.rain_counter = Some(f64::from(p[2] >> 4) / 10.0 + bcd(p[3]) + bcd(p[4]) * 100.0);
        }
        TYPE_EXTRA => {
            let channel = (p[0] & 0x0F).trailing_zeros() as usize;
            if channel < EXTRA_CHANNELS {
                sample.set(Field::ExtraTemperature(channel), temperature(p[1], p[2]));
                sample.set(Field::ExtraHumidity(channel), bcd(p[3]));
            } else {
                debug!("extra sensor packet without channel: {:#04X}", p[0]);
            }
        }
        TYPE_OUTDOOR => {
            sample.outdoor_temperature = Some(temperature(p[1], p[2]));
            sample.outdoor_humidity = Some(bcd(p[3]));
        }
        TYPE_INDOOR => {
            sample.indoor_temperature = Some(temperature(p[1], p[2]));
            sample.indoor_humidity = Some(bcd(p[3]));
            sample.pressure = Some(795.0 + f64::from(p[5]));
        }
        TYPE_SOLAR => {
            sample.solar_radiation = Some(f64::from(u16::from_le_bytes([p[0], p[1]])));
            sample.uv_index = Some(f64::from(p[2]) / 10.0);
        }
        _ => {}
    }
}

/// Console time carried by a clock packet.
pub fn clock_time(packet: &Packet) -> Option<NaiveDateTime> {
    if packet.kind != TYPE_CLOCK {
        return None;
    }
    let p = &packet.payload;
    let as_u32 = |b: u8| bcd(b) as u32;
    NaiveDate::from_ymd_opt(2000 + as_u32(p[4]) as i32, as_u32(p[3]), as_u32(p[2]))?
        .and_hms_opt(as_u32(p[1]), as_u32(p[0]), 0)
}

// ============================================================================
// Station
// ============================================================================

pub struct StreamSerial {
    buffer: PacketBuffer,
    current: Sample,
    period: Duration,
    device_time: Option<NaiveDateTime>,
}

impl StreamSerial {
    pub fn new(period: Duration) -> Self {
        Self {
            buffer: PacketBuffer::new(),
            current: Sample::default(),
            period,
            device_time: None,
        }
    }

    /// Time reported by the most recent clock packet.
    pub fn device_time(&self) -> Option<NaiveDateTime> {
        self.device_time
    }

    fn drain(&mut self, link: &mut Link) -> Result<()> {
        for _ in 0..MAX_DRAIN_READS {
            match link.receive(256) {
                Ok(bytes) => self.buffer.extend_from_slice(&bytes),
                Err(DriverError::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Station for StreamSerial {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::StreamSerial
    }

    fn start(&mut self, link: &mut Link) -> Result<()> {
        link.discard_input()?;
        info!(
            "stream console listening: link={}, period={:?}",
            link.describe(),
            self.period
        );
        Ok(())
    }

    fn decode_live(&mut self, link: &mut Link) -> Result<Sample> {
        self.drain(link)?;

        let mut packets = 0;
        while let Some(packet) = self.buffer.next_packet() {
            packets += 1;
            match packet.kind {
                TYPE_CLOCK => self.device_time = clock_time(&packet),
                TYPE_MINUTE => debug!("console minute: {:02X?}", packet.payload),
                _ => apply_packet(&packet, &mut self.current),
            }
        }

        if packets == 0 {
            return Err(DriverError::Timeout(format!(
                "no packets since last read, {} bytes pending",
                self.buffer.len()
            )));
        }
        debug!(
            "stream packets decoded: count={}, skipped_bytes={}",
            packets,
            self.buffer.skipped()
        );
        Ok(self.current.clone())
    }
}
