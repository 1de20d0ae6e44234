//! Network gateway family.
//!
//! Requests and responses share one packet shape:
//!
//! ```text
//! FF FF | cmd | size (1 or 2 bytes, BE) | payload | sum
//! ```
//!
//! `size` counts from `cmd` through `sum`; `sum` is the byte sum of
//! everything after the header. Live data comes back as a stream of
//! `tag value` pairs whose value width is fixed per tag.

use log::{debug, info, warn};

use crate::checksum::{byte_sum, verify};
use crate::codec::{drain_only, exchange, Frame, FrameCodec};
use crate::config::DeviceFamily;
use crate::errors::{DriverError, Result};
use crate::link::Link;
use crate::retry::RetryPolicy;
use crate::sample::{Field, Sample};
use crate::stations::Station;

// ============================================================================
// Constants
// ============================================================================

const HEADER: [u8; 2] = [0xFF, 0xFF];

pub const CMD_READ_MAC: u8 = 0x26;
pub const CMD_LIVE_DATA: u8 = 0x27;
pub const CMD_READ_SYSTEM: u8 = 0x30;
pub const CMD_READ_SENSOR_ID: u8 = 0x3A;
pub const CMD_READ_SENSOR_ID_NEW: u8 = 0x3C;
pub const CMD_READ_FIRMWARE: u8 = 0x50;
pub const CMD_READ_RAIN: u8 = 0x57;

/// Illuminance (lux) to irradiance (W/m²).
const LUX_TO_WM2: f64 = 0.0079;

fn is_known(command: u8) -> bool {
    matches!(
        command,
        CMD_READ_MAC
            | CMD_LIVE_DATA
            | CMD_READ_SYSTEM
            | CMD_READ_SENSOR_ID
            | CMD_READ_SENSOR_ID_NEW
            | CMD_READ_FIRMWARE
            | CMD_READ_RAIN
    )
}

/// Width of the response size field.
fn size_width(command: u8) -> usize {
    match command {
        CMD_LIVE_DATA | CMD_READ_SENSOR_ID | CMD_READ_SENSOR_ID_NEW => 2,
        _ => 1,
    }
}

// ============================================================================
// Codec
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayCodec;

fn check_header(bytes: &[u8]) -> Result<()> {
    if bytes.get(..2) != Some(&HEADER[..]) {
        return Err(DriverError::Protocol(format!(
            "bad packet header {:02X?}",
            &bytes[..bytes.len().min(2)]
        )));
    }
    Ok(())
}

fn declared_size(bytes: &[u8], width: usize) -> usize {
    match width {
        2 => usize::from(u16::from_be_bytes([bytes[3], bytes[4]])),
        _ => usize::from(bytes[3]),
    }
}

impl FrameCodec for GatewayCodec {
    /// Requests always carry a one-byte size.
    fn encode(&self, command: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(payload.len() + 5);
        bytes.extend_from_slice(&HEADER);
        bytes.push(command);
        bytes.push((payload.len() + 3) as u8);
        bytes.extend_from_slice(payload);
        bytes.push(byte_sum(&bytes[2..]));
        bytes
    }

    fn prefix_len(&self, command: u8) -> usize {
        3 + size_width(command)
    }

    fn frame_len(&self, command: u8, prefix: &[u8]) -> Result<usize> {
        check_header(prefix)?;
        if prefix[2] != command {
            return Err(DriverError::UnknownCommand(prefix[2]));
        }
        let total = 2 + declared_size(prefix, size_width(command));
        if total <= self.prefix_len(command) {
            return Err(DriverError::Protocol(format!("declared size {total} too small")));
        }
        Ok(total)
    }

    fn decode(&self, bytes: &[u8], outstanding: u8) -> Result<Frame> {
        let width = size_width(outstanding);
        let prefix = 3 + width;
        if bytes.len() < prefix {
            return Err(DriverError::ShortFrame {
                declared: prefix,
                received: bytes.len(),
            });
        }
        check_header(bytes)?;

        let command = bytes[2];
        if !is_known(command) || command != outstanding {
            return Err(DriverError::UnknownCommand(command));
        }

        // Length before checksum: a truncated frame never reaches the sum.
        let total = 2 + declared_size(bytes, width);
        if total <= prefix {
            return Err(DriverError::Protocol(format!("declared size {total} too small")));
        }
        if bytes.len() < total {
            return Err(DriverError::ShortFrame {
                declared: total,
                received: bytes.len(),
            });
        }
        if bytes.len() > total {
            return Err(DriverError::Protocol(format!(
                "{} bytes beyond declared size",
                bytes.len() - total
            )));
        }

        verify(byte_sum(&bytes[2..total - 1]), bytes[total - 1])?;
        Ok(Frame::verified(command, bytes[prefix..total - 1].to_vec()))
    }
}

// ============================================================================
// Live Data
// ============================================================================

/// Value width of a live-data tag, `None` for tags this table does not know.
pub fn tag_width(tag: u8) -> Option<usize> {
    let width = match tag {
        0x01..=0x05 => 2,
        0x06 | 0x07 => 1,
        0x08..=0x11 => 2,
        0x12..=0x15 => 4,
        0x16 => 2,
        0x17 => 1,
        0x18 => 6,
        0x19 => 2,
        0x1A..=0x21 => 2,
        0x22..=0x29 => 1,
        0x2A => 2,
        // Soil temperature / moisture pairs for 16 channels.
        0x2B..=0x4A => {
            if (tag - 0x2B) % 2 == 0 {
                2
            } else {
                1
            }
        }
        0x4C => 16,
        0x4D..=0x53 => 2,
        0x58..=0x5B => 1,
        0x60 => 1,
        0x61 | 0x62 => 4,
        0x63..=0x6A => 3,
        0x70 => 16,
        0x72..=0x79 => 1,
        _ => return None,
    };
    Some(width)
}

fn unsigned(value: &[u8]) -> f64 {
    value.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b)) as f64
}

fn temperature(value: &[u8]) -> f64 {
    f64::from(i16::from_be_bytes([value[0], value[1]])) / 10.0
}

fn apply_tag(tag: u8, value: &[u8], sample: &mut Sample) {
    match tag {
        0x01 => sample.indoor_temperature = Some(temperature(value)),
        0x02 => sample.outdoor_temperature = Some(temperature(value)),
        0x06 => sample.indoor_humidity = Some(unsigned(value)),
        0x07 => sample.outdoor_humidity = Some(unsigned(value)),
        0x09 => sample.pressure = Some(unsigned(value) / 10.0),
        0x0A => sample.wind_bearing = Some(unsigned(value)),
        0x0B => sample.wind_speed = Some(unsigned(value) / 10.0),
        0x0C => sample.wind_gust = Some(unsigned(value) / 10.0),
        0x0E => sample.rain_rate = Some(unsigned(value) / 10.0),
        // Rain year, overridden by the lifetime total when the gateway sends one.
        0x13 | 0x14 => sample.rain_counter = Some(unsigned(value) / 10.0),
        0x15 => sample.solar_radiation = Some(unsigned(value) / 10.0 * LUX_TO_WM2),
        0x17 => sample.uv_index = Some(unsigned(value)),
        0x1A..=0x21 => sample.set(
            Field::ExtraTemperature(usize::from(tag - 0x1A)),
            temperature(value),
        ),
        0x22..=0x29 => sample.set(Field::ExtraHumidity(usize::from(tag - 0x22)), unsigned(value)),
        _ => {}
    }
}

/// Decode a live-data payload into `sample`, returning the number of tags
/// read. An unknown tag or truncated value stops decoding; readings before
/// it are already in `sample`.
pub fn parse_live_data(payload: &[u8], sample: &mut Sample) -> Result<usize> {
    let mut pos = 0;
    let mut tags = 0;
    while pos < payload.len() {
        let tag = payload[pos];
        let width = tag_width(tag).ok_or(DriverError::UnknownSensor(tag))?;
        let value = payload
            .get(pos + 1..pos + 1 + width)
            .ok_or(DriverError::ShortFrame {
                declared: width,
                received: payload.len() - pos - 1,
            })?;
        apply_tag(tag, value, sample);
        pos += 1 + width;
        tags += 1;
    }
    Ok(tags)
}

// ============================================================================
// Station
// ============================================================================

pub struct Gateway {
    codec: GatewayCodec,
    policy: RetryPolicy,
    firmware: Option<String>,
    mac: Option<String>,
}

impl Gateway {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            codec: GatewayCodec,
            policy,
            firmware: None,
            mac: None,
        }
    }

    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    fn request(&self, link: &mut Link, command: u8) -> Result<Frame> {
        exchange(link, &self.codec, &self.policy, command, &[], drain_only)
    }
}

impl Station for Gateway {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Gateway
    }

    fn start(&mut self, link: &mut Link) -> Result<()> {
        let frame = self.request(link, CMD_READ_FIRMWARE)?;
        // Length-prefixed ASCII.
        let firmware = frame
            .payload()
            .get(1..)
            .map(|text| String::from_utf8_lossy(text).trim().to_string())
            .unwrap_or_default();

        let frame = self.request(link, CMD_READ_MAC)?;
        let mac = frame
            .payload()
            .iter()
            .take(6)
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");

        info!("gateway ready: firmware={}, mac={}, link={}", firmware, mac, link.describe());
        self.firmware = Some(firmware);
        self.mac = Some(mac);
        Ok(())
    }

    fn decode_live(&mut self, link: &mut Link) -> Result<Sample> {
        let frame = self.request(link, CMD_LIVE_DATA)?;
        let mut sample = Sample::default();
        match parse_live_data(frame.payload(), &mut sample) {
            Ok(tags) => debug!("live data decoded: tags={}", tags),
            Err(e) => warn!("live data decoding stopped early: {}", e),
        }
        Ok(sample)
    }
}
