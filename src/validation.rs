//! Per-field sanity windows.
//!
//! Out-of-range readings are cleared from the sample and logged; they never
//! abort the record they belong to. The `999`/`-999` "no calculation"
//! sentinel some consoles emit is cleared as well but is not an error: it
//! only marks the sample as `derived_suppressed`.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::sample::{Field, Sample};

/// Magnitude of the "no calculation performed" sentinel.
pub const SENTINEL: f64 = 999.0;

/// Inclusive `[min, max]` window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: f64,
    pub max: f64,
}

impl Bound {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// NaN is never inside.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Sanity windows for every physical quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanityBounds {
    pub indoor_temperature: Bound,
    pub outdoor_temperature: Bound,
    pub humidity: Bound,
    pub pressure: Bound,
    /// Implausibility ceiling for the average wind speed.
    pub wind_speed: Bound,
    pub wind_gust: Bound,
    pub wind_bearing: Bound,
    pub rain_counter: Bound,
    pub rain_rate: Bound,
    pub solar_radiation: Bound,
    pub uv_index: Bound,
    pub extra_temperature: Bound,
}

impl Default for SanityBounds {
    fn default() -> Self {
        Self {
            indoor_temperature: Bound::new(-20.0, 60.0),
            outdoor_temperature: Bound::new(-50.0, 70.0),
            humidity: Bound::new(0.0, 100.0),
            pressure: Bound::new(850.0, 1100.0),
            wind_speed: Bound::new(0.0, 60.0),
            wind_gust: Bound::new(0.0, 90.0),
            wind_bearing: Bound::new(0.0, 360.0),
            rain_counter: Bound::new(0.0, 1.0e6),
            rain_rate: Bound::new(0.0, 1000.0),
            solar_radiation: Bound::new(0.0, 1800.0),
            uv_index: Bound::new(0.0, 20.0),
            extra_temperature: Bound::new(-50.0, 70.0),
        }
    }
}

impl SanityBounds {
    pub fn bound_for(&self, field: Field) -> Bound {
        match field {
            Field::IndoorTemperature => self.indoor_temperature,
            Field::OutdoorTemperature => self.outdoor_temperature,
            Field::IndoorHumidity | Field::OutdoorHumidity | Field::ExtraHumidity(_) => {
                self.humidity
            }
            Field::Pressure => self.pressure,
            Field::WindSpeed => self.wind_speed,
            Field::WindGust => self.wind_gust,
            Field::WindBearing => self.wind_bearing,
            Field::RainCounter => self.rain_counter,
            Field::RainRate => self.rain_rate,
            Field::SolarRadiation => self.solar_radiation,
            Field::UvIndex => self.uv_index,
            Field::ExtraTemperature(_) => self.extra_temperature,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let windows = [
            ("indoor_temperature", self.indoor_temperature),
            ("outdoor_temperature", self.outdoor_temperature),
            ("humidity", self.humidity),
            ("pressure", self.pressure),
            ("wind_speed", self.wind_speed),
            ("wind_gust", self.wind_gust),
            ("wind_bearing", self.wind_bearing),
            ("rain_counter", self.rain_counter),
            ("rain_rate", self.rain_rate),
            ("solar_radiation", self.solar_radiation),
            ("uv_index", self.uv_index),
            ("extra_temperature", self.extra_temperature),
        ];
        for (name, bound) in windows {
            if !(bound.min < bound.max) {
                return Err(DriverError::Config(format!(
                    "bounds.{name}: min {} must be below max {}",
                    bound.min, bound.max
                )));
            }
        }
        Ok(())
    }

    /// Check one reading.
    pub fn check(&self, field: Field, value: f64) -> Result<Reading> {
        if sentinel_applies(field) && is_sentinel(value) {
            return Ok(Reading::Sentinel);
        }
        if self.bound_for(field).contains(value) {
            Ok(Reading::Valid(value))
        } else {
            Err(DriverError::OutOfRange {
                field: field.name(),
                value,
            })
        }
    }
}

/// Outcome of checking a reading that is not out of range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Valid(f64),
    Sentinel,
}

fn is_sentinel(value: f64) -> bool {
    value.abs() == SENTINEL
}

/// Only temperatures use the sentinel; 999 mm of rain is a real reading.
fn sentinel_applies(field: Field) -> bool {
    matches!(
        field,
        Field::IndoorTemperature | Field::OutdoorTemperature | Field::ExtraTemperature(_)
    )
}

/// What [`sanitize`] removed from a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub rejected: usize,
    pub sentinels: usize,
}

/// Clear every reading in `sample` that falls outside `bounds`.
pub fn sanitize(sample: &mut Sample, bounds: &SanityBounds) -> ValidationReport {
    let mut report = ValidationReport::default();
    let timestamp = sample.timestamp;

    for field in Field::all() {
        let Some(value) = sample.get(field) else {
            continue;
        };
        let keep = match bounds.check(field, value) {
            Ok(Reading::Valid(_)) => true,
            Ok(Reading::Sentinel) => {
                debug!("sentinel reading: field={}, time={}", field.name(), timestamp);
                report.sentinels += 1;
                sample.derived_suppressed = true;
                false
            }
            Err(e) => {
                warn!("discarding reading: time={}, {}", timestamp, e);
                report.rejected += 1;
                false
            }
        };
        if !keep {
            if let Some(slot) = sample.slot_mut(field) {
                *slot = None;
            }
        }
    }
    report
}
