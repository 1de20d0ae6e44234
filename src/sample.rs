//! The record shape shared by backfilled and live data.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Number of auxiliary temperature/humidity channels a sample can carry.
pub const EXTRA_CHANNELS: usize = 8;

/// One set of sensor readings at a point in station-local time.
///
/// Units: temperatures in °C, humidity in %RH, pressure in hPa (sea-level
/// relative), wind in m/s, bearing in degrees, rain in mm, rain rate in mm/h,
/// solar radiation in W/m². Missing or rejected readings are `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: NaiveDateTime,
    /// Time span this sample stands for, used to integrate accumulators.
    pub interval_seconds: u32,
    pub indoor_temperature: Option<f64>,
    pub outdoor_temperature: Option<f64>,
    pub indoor_humidity: Option<f64>,
    pub outdoor_humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    pub wind_bearing: Option<f64>,
    /// Monotonic device rain counter; daily rain is derived from its deltas.
    pub rain_counter: Option<f64>,
    pub rain_rate: Option<f64>,
    pub solar_radiation: Option<f64>,
    pub uv_index: Option<f64>,
    pub extra_temperature: [Option<f64>; EXTRA_CHANNELS],
    pub extra_humidity: [Option<f64>; EXTRA_CHANNELS],
    /// A device reported the "no calculation" sentinel in at least one field.
    pub derived_suppressed: bool,
}

/// Addressable reading within a [`Sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    IndoorTemperature,
    OutdoorTemperature,
    IndoorHumidity,
    OutdoorHumidity,
    Pressure,
    WindSpeed,
    WindGust,
    WindBearing,
    RainCounter,
    RainRate,
    SolarRadiation,
    UvIndex,
    ExtraTemperature(usize),
    ExtraHumidity(usize),
}

impl Field {
    /// Every field a sample carries, extra channels included.
    pub fn all() -> impl Iterator<Item = Field> {
        [
            Field::IndoorTemperature,
            Field::OutdoorTemperature,
            Field::IndoorHumidity,
            Field::OutdoorHumidity,
            Field::Pressure,
            Field::WindSpeed,
            Field::WindGust,
            Field::WindBearing,
            Field::RainCounter,
            Field::RainRate,
            Field::SolarRadiation,
            Field::UvIndex,
        ]
        .into_iter()
        .chain((0..EXTRA_CHANNELS).map(Field::ExtraTemperature))
        .chain((0..EXTRA_CHANNELS).map(Field::ExtraHumidity))
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::IndoorTemperature => "indoor_temperature",
            Field::OutdoorTemperature => "outdoor_temperature",
            Field::IndoorHumidity => "indoor_humidity",
            Field::OutdoorHumidity => "outdoor_humidity",
            Field::Pressure => "pressure",
            Field::WindSpeed => "wind_speed",
            Field::WindGust => "wind_gust",
            Field::WindBearing => "wind_bearing",
            Field::RainCounter => "rain_counter",
            Field::RainRate => "rain_rate",
            Field::SolarRadiation => "solar_radiation",
            Field::UvIndex => "uv_index",
            Field::ExtraTemperature(_) => "extra_temperature",
            Field::ExtraHumidity(_) => "extra_humidity",
        }
    }
}

impl Sample {
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    pub fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::IndoorTemperature => self.indoor_temperature,
            Field::OutdoorTemperature => self.outdoor_temperature,
            Field::IndoorHumidity => self.indoor_humidity,
            Field::OutdoorHumidity => self.outdoor_humidity,
            Field::Pressure => self.pressure,
            Field::WindSpeed => self.wind_speed,
            Field::WindGust => self.wind_gust,
            Field::WindBearing => self.wind_bearing,
            Field::RainCounter => self.rain_counter,
            Field::RainRate => self.rain_rate,
            Field::SolarRadiation => self.solar_radiation,
            Field::UvIndex => self.uv_index,
            Field::ExtraTemperature(ch) => self.extra_temperature.get(ch).copied().flatten(),
            Field::ExtraHumidity(ch) => self.extra_humidity.get(ch).copied().flatten(),
        }
    }

    /// Mutable slot for `field`; `None` for an extra channel beyond [`EXTRA_CHANNELS`].
    pub fn slot_mut(&mut self, field: Field) -> Option<&mut Option<f64>> {
        match field {
            Field::IndoorTemperature => Some(&mut self.indoor_temperature),
            Field::OutdoorTemperature => Some(&mut self.outdoor_temperature),
            Field::IndoorHumidity => Some(&mut self.indoor_humidity),
            Field::OutdoorHumidity => Some(&mut self.outdoor_humidity),
            Field::Pressure => Some(&mut self.pressure),
            Field::WindSpeed => Some(&mut self.wind_speed),
            Field::WindGust => Some(&mut self.wind_gust),
            Field::WindBearing => Some(&mut self.wind_bearing),
            Field::RainCounter => Some(&mut self.rain_counter),
            Field::RainRate => Some(&mut self.rain_rate),
            Field::SolarRadiation => Some(&mut self.solar_radiation),
            Field::UvIndex => Some(&mut self.uv_index),
            Field::ExtraTemperature(ch) => self.extra_temperature.get_mut(ch),
            Field::ExtraHumidity(ch) => self.extra_humidity.get_mut(ch),
        }
    }

    pub fn set(&mut self, field: Field, value: f64) {
        if let Some(slot) = self.slot_mut(field) {
            *slot = Some(value);
        }
    }

    /// Overlay every reading present in `newer` onto `self`.
    pub fn merge_from(&mut self, newer: &Sample) {
        for field in Field::all() {
            if let Some(value) = newer.get(field) {
                self.set(field, value);
            }
        }
        self.derived_suppressed |= newer.derived_suppressed;
    }

    /// True when no reading at all is present.
    pub fn is_empty(&self) -> bool {
        Field::all().all(|field| self.get(field).is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_slots() {
        let mut sample = Sample::default();
        sample.set(Field::ExtraTemperature(3), 12.5);
        sample.set(Field::ExtraHumidity(EXTRA_CHANNELS), 50.0);
        assert_eq!(Some(12.5), sample.extra_temperature[3]);
        assert_eq!(Some(12.5), sample.get(Field::ExtraTemperature(3)));
        assert_eq!(None, sample.get(Field::ExtraHumidity(EXTRA_CHANNELS)));
        assert_eq!(12 + 2 * EXTRA_CHANNELS, Field::all().count());
    }

    #[test]
    fn test_merge_keeps_older_readings() {
        let mut current = Sample::default();
        current.outdoor_temperature = Some(4.0);
        current.pressure = Some(1012.0);

        let mut newer = Sample::default();
        newer.outdoor_temperature = Some(4.5);
        newer.wind_speed = Some(2.0);

        current.merge_from(&newer);
        assert_eq!(Some(4.5), current.outdoor_temperature);
        assert_eq!(Some(1012.0), current.pressure);
        assert_eq!(Some(2.0), current.wind_speed);
        assert!(!current.is_empty());
        assert!(Sample::default().is_empty());
    }
}
