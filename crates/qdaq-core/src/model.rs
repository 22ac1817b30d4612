//! Data model for the Q-Series acquisition engine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QdaqError, Result};

/// ADC sample rates the firmware accepts, in Hz.
pub const VALID_ADC_RATES: [u32; 8] = [4, 8, 16, 33, 62, 125, 250, 500];

/// Inclusive averaging range the firmware accepts.
pub const AVERAGING_MIN: u32 = 1;
pub const AVERAGING_MAX: u32 = 65_535;

/// Acquisition mode of the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorMode {
    /// Continuous streaming at `adc_rate_hz / averaging` Hz.
    Freerun,
    /// One reading per externally issued TAG-prefixed query.
    Polled,
}

impl fmt::Display for SensorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorMode::Freerun => write!(f, "freerun"),
            SensorMode::Polled => write!(f, "polled"),
        }
    }
}

impl FromStr for SensorMode {
    type Err = QdaqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "freerun" => Ok(SensorMode::Freerun),
            "polled" => Ok(SensorMode::Polled),
            other => Err(QdaqError::InvalidConfigValue(format!(
                "mode must be 'freerun' or 'polled', got '{other}'"
            ))),
        }
    }
}

/// Connection states of the controller.
///
/// Transitions between these are the only legal way controller state
/// changes; see `SensorController` for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Disconnected,
    ConfigMenu,
    AcqFreerun,
    AcqPolled,
    Paused,
    Error,
}

impl ControllerState {
    /// True for the two acquisition states.
    pub fn is_acquiring(self) -> bool {
        matches!(self, ControllerState::AcqFreerun | ControllerState::AcqPolled)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ControllerState::Disconnected => "disconnected",
            ControllerState::ConfigMenu => "config_menu",
            ControllerState::AcqFreerun => "acq_freerun",
            ControllerState::AcqPolled => "acq_polled",
            ControllerState::Paused => "paused",
            ControllerState::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// One timestamped measurement.
///
/// Immutable once constructed. Within a session, timestamps are
/// non-decreasing in the order the controller appends to the ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// UTC instant assigned by the controller when the line was parsed.
    pub timestamp: DateTime<Utc>,
    /// Device identifier, constant for the session.
    pub sensor_id: String,
    /// Acquisition mode the reading was taken in.
    pub mode: SensorMode,
    /// Primary calibrated measurement. Always finite.
    pub value: f64,
    /// Temperature in Celsius, if the device is configured to emit it.
    pub temp_c: Option<f64>,
    /// Line voltage in volts, if the device is configured to emit it.
    pub vin: Option<f64>,
}

/// Observed configuration snapshot of the instrument.
///
/// Mutated only by the controller, only in the config menu, and only as the
/// parsed result of a completed `^` dump exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Number of ADC readings averaged per emitted sample (1-65535).
    pub averaging: u32,
    /// ADC sample rate in Hz; one of [`VALID_ADC_RATES`].
    pub adc_rate_hz: u32,
    /// Operating mode.
    pub mode: SensorMode,
    /// Polling TAG, present iff `mode` is polled.
    pub tag: Option<char>,
    /// Whether the device emits the temperature field.
    pub include_temp: bool,
    /// Whether the device emits the line-voltage field.
    pub include_vin: bool,
    /// Device serial number, from the config dump.
    pub sensor_id: String,
    /// Firmware version string, from the config dump.
    pub firmware_version: String,
    /// Preamble the device prepends to freerun data lines.
    pub preamble: String,
    /// Calibration factor applied by the device.
    pub calfactor: f64,
}

impl SensorConfig {
    /// Effective time between emitted samples: `averaging / adc_rate_hz`.
    pub fn sample_period_s(&self) -> f64 {
        self.averaging as f64 / self.adc_rate_hz as f64
    }

    /// [`Self::sample_period_s`] as a [`Duration`].
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(self.sample_period_s())
    }
}

/// Validate an averaging count against the firmware range.
pub fn validate_averaging(n: u32) -> Result<()> {
    if (AVERAGING_MIN..=AVERAGING_MAX).contains(&n) {
        Ok(())
    } else {
        Err(QdaqError::InvalidConfigValue(format!(
            "averaging must be {AVERAGING_MIN}-{AVERAGING_MAX}, got {n}"
        )))
    }
}

/// Validate an ADC rate against the firmware's discrete set.
pub fn validate_adc_rate(hz: u32) -> Result<()> {
    if VALID_ADC_RATES.contains(&hz) {
        Ok(())
    } else {
        Err(QdaqError::InvalidConfigValue(format!(
            "ADC rate must be one of {VALID_ADC_RATES:?}, got {hz}"
        )))
    }
}

/// Validate a polled-mode TAG character.
pub fn validate_tag(tag: char) -> Result<()> {
    if tag.is_ascii_uppercase() {
        Ok(())
    } else {
        Err(QdaqError::InvalidConfigValue(format!(
            "TAG must be a single uppercase letter A-Z, got '{tag}'"
        )))
    }
}
