//! Running daily totals and extremes.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::sample::Sample;

const SECONDS_PER_DAY: f64 = 86_400.0;
const SECONDS_PER_HOUR: f64 = 3_600.0;

/// Thresholds used when integrating samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulationSettings {
    /// Heating degree days accrue below this temperature (°C).
    pub heating_base: f64,
    /// Cooling degree days accrue above this temperature (°C).
    pub cooling_base: f64,
    /// Chill hours accrue below this temperature (°C).
    pub chill_threshold: f64,
    /// Month (1-12) on whose first day the chill-hour season restarts.
    pub chill_season_start_month: u32,
    /// Solar radiation (W/m²) at or above which an interval counts as sunshine.
    pub sunshine_threshold: f64,
}

impl Default for AccumulationSettings {
    fn default() -> Self {
        Self {
            heating_base: 15.5,
            cooling_base: 15.5,
            chill_threshold: 7.0,
            chill_season_start_month: 10,
            sunshine_threshold: 120.0,
        }
    }
}

impl AccumulationSettings {
    pub fn validate(&self) -> Result<()> {
        if !(1..=12).contains(&self.chill_season_start_month) {
            return Err(DriverError::Config(format!(
                "accumulation.chill_season_start_month must be 1-12, got {}",
                self.chill_season_start_month
            )));
        }
        if self.sunshine_threshold < 0.0 {
            return Err(DriverError::Config(
                "accumulation.sunshine_threshold must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// A value and when it was seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extreme {
    pub value: f64,
    pub at: NaiveDateTime,
}

/// Highs and lows of the current weather day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayExtremes {
    pub high_temperature: Option<Extreme>,
    pub low_temperature: Option<Extreme>,
    pub high_gust: Option<Extreme>,
    pub high_pressure: Option<Extreme>,
    pub low_pressure: Option<Extreme>,
    pub high_rain_rate: Option<Extreme>,
}

fn raise(slot: &mut Option<Extreme>, value: Option<f64>, at: NaiveDateTime) {
    if let Some(value) = value {
        if slot.map_or(true, |e| value > e.value) {
            *slot = Some(Extreme { value, at });
        }
    }
}

fn lower(slot: &mut Option<Extreme>, value: Option<f64>, at: NaiveDateTime) {
    if let Some(value) = value {
        if slot.map_or(true, |e| value < e.value) {
            *slot = Some(Extreme { value, at });
        }
    }
}

impl DayExtremes {
    fn update(&mut self, sample: &Sample) {
        let at = sample.timestamp;
        raise(&mut self.high_temperature, sample.outdoor_temperature, at);
        lower(&mut self.low_temperature, sample.outdoor_temperature, at);
        raise(&mut self.high_gust, sample.wind_gust, at);
        raise(&mut self.high_pressure, sample.pressure, at);
        lower(&mut self.low_pressure, sample.pressure, at);
        raise(&mut self.high_rain_rate, sample.rain_rate, at);
    }
}

/// Totals handed downstream when a weather day closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySummary {
    /// The weather day that just closed.
    pub date: NaiveDate,
    pub wind_run_km: f64,
    pub heating_degree_days: f64,
    pub cooling_degree_days: f64,
    pub dominant_bearing: Option<f64>,
    pub rain_mm: f64,
    pub sunshine_hours: f64,
    pub chill_hours: f64,
    pub extremes: DayExtremes,
}

/// Integrated quantities since the last rollover / midnight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulators {
    pub wind_run_km: f64,
    pub heating_degree_days: f64,
    pub cooling_degree_days: f64,
    /// Σ speed·sin θ
    pub bearing_x: f64,
    /// Σ speed·cos θ
    pub bearing_y: f64,
    /// Season total, reset on the first day of the chill season.
    pub chill_hours: f64,
    /// Rain over the current weather day.
    pub rain_today_mm: f64,
    pub rain_since_midnight_mm: f64,
    pub sunshine_hours: f64,
    last_rain_counter: Option<f64>,
    pub extremes: DayExtremes,
}

impl Accumulators {
    /// Integrate one validated sample over its interval.
    pub fn apply(&mut self, sample: &Sample, settings: &AccumulationSettings) {
        let seconds = f64::from(sample.interval_seconds);

        if let Some(speed) = sample.wind_speed {
            self.wind_run_km += speed * seconds / 1000.0;
            if let Some(bearing) = sample.wind_bearing {
                if speed > 0.0 {
                    let theta = bearing.to_radians();
                    self.bearing_x += speed * theta.sin();
                    self.bearing_y += speed * theta.cos();
                }
            }
        }

        if let Some(temperature) = sample.outdoor_temperature {
            let fraction = seconds / SECONDS_PER_DAY;
            self.heating_degree_days += (settings.heating_base - temperature).max(0.0) * fraction;
            self.cooling_degree_days += (temperature - settings.cooling_base).max(0.0) * fraction;
            if temperature < settings.chill_threshold {
                self.chill_hours += seconds / SECONDS_PER_HOUR;
            }
        }

        if let Some(solar) = sample.solar_radiation {
            if solar >= settings.sunshine_threshold {
                self.sunshine_hours += seconds / SECONDS_PER_HOUR;
            }
        }

        if let Some(counter) = sample.rain_counter {
            match self.last_rain_counter {
                Some(last) if counter >= last => {
                    let delta = counter - last;
                    self.rain_today_mm += delta;
                    self.rain_since_midnight_mm += delta;
                }
                Some(last) => debug!(
                    "rain counter went backwards, rebasing: previous={}, current={}",
                    last, counter
                ),
                None => {}
            }
            self.last_rain_counter = Some(counter);
        }

        self.extremes.update(sample);
    }

    /// Resultant wind direction in degrees, `None` while the vector is zero.
    pub fn dominant_bearing(&self) -> Option<f64> {
        if self.bearing_x.abs() < f64::EPSILON && self.bearing_y.abs() < f64::EPSILON {
            return None;
        }
        Some(self.bearing_x.atan2(self.bearing_y).to_degrees().rem_euclid(360.0))
    }

    /// Close weather day `date`: snapshot the daily totals and start over.
    /// `next_day` is the weather day now beginning; on the first day of the
    /// chill season the chill-hour count restarts too.
    pub fn close_day(
        &mut self,
        date: NaiveDate,
        next_day: NaiveDate,
        settings: &AccumulationSettings,
    ) -> DaySummary {
        let summary = DaySummary {
            date,
            wind_run_km: self.wind_run_km,
            heating_degree_days: self.heating_degree_days,
            cooling_degree_days: self.cooling_degree_days,
            dominant_bearing: self.dominant_bearing(),
            rain_mm: self.rain_today_mm,
            sunshine_hours: self.sunshine_hours,
            chill_hours: self.chill_hours,
            extremes: std::mem::take(&mut self.extremes),
        };

        self.wind_run_km = 0.0;
        self.heating_degree_days = 0.0;
        self.cooling_degree_days = 0.0;
        self.bearing_x = 0.0;
        self.bearing_y = 0.0;
        self.rain_today_mm = 0.0;

        if next_day.day() == 1 && next_day.month() == settings.chill_season_start_month {
            debug!("chill season restarts: date={}", next_day);
            self.chill_hours = 0.0;
        }
        summary
    }

    /// Calendar midnight: clear rain-since-midnight and sunshine hours.
    pub fn reset_midnight(&mut self) {
        self.rain_since_midnight_mm = 0.0;
        self.sunshine_hours = 0.0;
    }
}
