//! Wire codec for the 2150 REV 4.003 serial protocol.
//!
//! Pure functions over byte lines: builders for outbound commands, and
//! classifiers/parsers for the device's banner, menu echoes, freerun lines
//! and polled responses. No I/O, no state.
//!
//! The protocol is a human-interactive menu, not an RPC surface. The only
//! reliable success signal after a state-changing command is the
//! reappearance of the menu prompt; individual confirmation strings vary
//! across firmware quirks and are classified here only so the driver can
//! log and skip them.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::model::{SensorConfig, SensorMode};

// =============================================================================
// Command builders
// =============================================================================

/// Menu letter that sets the averaging count.
pub const CMD_SET_AVERAGING: char = 'A';
/// Menu letter that sets the ADC sample rate.
pub const CMD_SET_RATE: char = 'R';
/// Menu letter that sets the operating mode.
pub const CMD_SET_MODE: char = 'M';
/// Menu command that dumps the configuration as one CSV line.
pub const CMD_CONFIG_DUMP: char = '^';
/// Menu command that exits the menu by triggering a full device reset.
pub const CMD_EXIT: char = 'X';

/// ESC, which forces the device into its config menu from any mode.
pub fn menu_enter() -> &'static [u8] {
    &[0x1b]
}

/// A single menu letter followed by CR.
pub fn menu_command(letter: char) -> Vec<u8> {
    format!("{letter}\r").into_bytes()
}

/// A decimal numeric reply followed by CR.
pub fn numeric_reply(n: u32) -> Vec<u8> {
    format!("{n}\r").into_bytes()
}

/// Polled-mode initialization: `*<TAG>Q000!` + CR.
///
/// Must be sent once after the post-exit reset before the first query.
pub fn polled_init(tag: char) -> Vec<u8> {
    format!("*{tag}Q000!\r").into_bytes()
}

/// Polled-mode single-sample query: `><TAG>` + CR.
pub fn polled_query(tag: char) -> Vec<u8> {
    format!(">{tag}\r").into_bytes()
}

/// Menu exit: `X` + CR. The device reboots on receipt; the driver must
/// absorb the post-reset banner before using the link again.
pub fn menu_exit() -> Vec<u8> {
    menu_command(CMD_EXIT)
}

// =============================================================================
// Classification
// =============================================================================

/// Known fixed error strings the firmware emits, each with a distinct tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// "Invalid rate!!! Command is ignored."
    InvalidRate,
    /// "****Invalid number, averaging set to 12..."
    InvalidAveraging,
    /// " Bad TAG "
    BadTag,
    /// "I am confused"
    ModeConfused,
    /// "Timed out waiting for response."
    ResponseTimeout,
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceFault::InvalidRate => "device rejected ADC rate",
            DeviceFault::InvalidAveraging => "device rejected averaging count",
            DeviceFault::BadTag => "device rejected TAG",
            DeviceFault::ModeConfused => "device rejected operating mode",
            DeviceFault::ResponseTimeout => "device timed out internally",
        };
        write!(f, "{label}")
    }
}

/// Classification of one inbound line (terminator already stripped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// The anchored "Select the letter of the menu entry:" prompt.
    MenuPrompt,
    /// Signon banner, menu body, or other diagnostic chatter.
    Banner,
    /// The one-line CSV response to the `^` command.
    ConfigDump,
    /// Firmware echo of a numeric argument ("125 was entered").
    Echo,
    /// A freerun data line.
    FreerunReading,
    /// A TAG-prefixed polled data line.
    PolledReading,
    /// One of the firmware's fixed error strings.
    ErrorBanner(DeviceFault),
    /// Anything else. Never an error; policy belongs to the caller.
    Unknown,
}

static RE_MENU_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^select the letter of the menu entry:\s*$").expect("menu prompt regex")
});

// Freerun: <optional non-numeric preamble><signed decimal>[, <temp>][, <vin>]
static RE_FREERUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^\d\-]*?)([\-\d.]+)(?:,\s*([\-\d.]+))?(?:,\s*([\-\d.]+))?\s*$")
        .expect("freerun regex")
});

// Polled: <TAG>,<optional preamble><signed decimal>[, <temp>][, <vin>]
static RE_POLLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z]),([^\d\-]*?)([\-\d.]+)(?:,\s*([\-\d.]+))?(?:,\s*([\-\d.]+))?\s*$")
        .expect("polled regex")
});

// Config dump from `^`:
// avg,baud,calfactor,description,E,version,G,H,serial,immersion,dark,
// supply,mode,tag,preamble,temp_flag,vin_flag,rate
static RE_CONFIG_DUMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d+),(\d+),([\d.]+),([^,]*),E,([\d.]+),G,H,([^,]*),[\d.]+,[\d.]+,[\d.]+,([01]),([^,]*),([^,]*),([01]),([01]),(\d+),?$",
    )
    .expect("config dump regex")
});

static RE_ECHO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\s+was entered\s*$").expect("echo regex"));

// Unanchored alternation over words that only occur in banner/menu chatter.
static RE_BANNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(biospherical|unit id|operating in|operating mode|adc |averaging|sensor temperature|supply voltage|calfactor|rebooting|calling reset|sampling|enter | to set |reduced resolution|diagnostic|password|immersion|dark zero|preamble|startup mode|calibration|log offset|dac offset|note tags|if you set|^model:)",
    )
    .expect("banner regex")
});

/// Strict form of the error-banner match, for callers that already know a
/// line is a device complaint (it carries the firmware's `****` or `!!!`
/// markers) and need its tag.
pub fn parse_fault(line: &str) -> Result<DeviceFault, CodecError> {
    match_fault(line).ok_or_else(|| CodecError::UnknownErrorBanner(line.to_string()))
}

fn match_fault(line: &str) -> Option<DeviceFault> {
    if line.contains("Invalid rate") {
        Some(DeviceFault::InvalidRate)
    } else if line.contains("Invalid number") && line.contains("averaging set to 12") {
        Some(DeviceFault::InvalidAveraging)
    } else if line.contains("Bad TAG") {
        Some(DeviceFault::BadTag)
    } else if line.contains("I am confused") {
        Some(DeviceFault::ModeConfused)
    } else if line.contains("Timed out waiting") {
        Some(DeviceFault::ResponseTimeout)
    } else {
        None
    }
}

/// Classify one inbound line.
///
/// Classification is purely syntactic and never fails: benign ambiguity
/// (e.g. a banner line arriving during freerun) yields [`LineClass::Banner`]
/// or [`LineClass::Unknown`] and the driver's policy decides what to do.
pub fn classify(line: &str) -> LineClass {
    if RE_MENU_PROMPT.is_match(line) {
        return LineClass::MenuPrompt;
    }
    if let Some(fault) = match_fault(line) {
        return LineClass::ErrorBanner(fault);
    }
    if RE_CONFIG_DUMP.is_match(line) {
        return LineClass::ConfigDump;
    }
    if RE_ECHO.is_match(line) {
        return LineClass::Echo;
    }
    if RE_BANNER.is_match(line) {
        return LineClass::Banner;
    }
    if RE_POLLED.is_match(line) {
        return LineClass::PolledReading;
    }
    if RE_FREERUN.is_match(line) {
        return LineClass::FreerunReading;
    }
    LineClass::Unknown
}

// =============================================================================
// Parsing
// =============================================================================

/// Failure modes of the parse functions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The line does not match the expected shape, or a numeric field is
    /// malformed or non-finite.
    #[error("unparseable line: {0:?}")]
    InvalidLine(String),

    /// A polled response carried a different TAG than the caller expected.
    /// This is a hard parse error, not a skip.
    #[error("TAG mismatch: expected '{expected}', got '{got}'")]
    TagMismatch { expected: char, got: char },

    /// A line that looks like an error banner but matches none of the known
    /// fixed strings.
    #[error("unrecognized error banner: {0:?}")]
    UnknownErrorBanner(String),
}

/// Numeric fields of one data line, before the controller stamps it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub value: f64,
    pub temp_c: Option<f64>,
    pub vin: Option<f64>,
}

fn parse_num(field: &str, line: &str) -> Result<f64, CodecError> {
    let v: f64 = field
        .parse()
        .map_err(|_| CodecError::InvalidLine(line.to_string()))?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err(CodecError::InvalidLine(line.to_string()))
    }
}

fn parse_opt_num(field: Option<regex::Match<'_>>, line: &str) -> Result<Option<f64>, CodecError> {
    match field {
        Some(m) => parse_num(m.as_str(), line).map(Some),
        None => Ok(None),
    }
}

/// Parse a freerun data line: `<preamble><value>[, <temp>][, <vin>]`.
pub fn parse_freerun(line: &str) -> Result<RawSample, CodecError> {
    let caps = RE_FREERUN
        .captures(line.trim_end())
        .ok_or_else(|| CodecError::InvalidLine(line.to_string()))?;
    Ok(RawSample {
        value: parse_num(&caps[2], line)?,
        temp_c: parse_opt_num(caps.get(3), line)?,
        vin: parse_opt_num(caps.get(4), line)?,
    })
}

/// Parse a polled data line and enforce the expected TAG prefix.
pub fn parse_polled(line: &str, expected_tag: char) -> Result<RawSample, CodecError> {
    let caps = RE_POLLED
        .captures(line.trim_end())
        .ok_or_else(|| CodecError::InvalidLine(line.to_string()))?;
    let got = caps[1].chars().next().unwrap_or('?');
    if got != expected_tag {
        return Err(CodecError::TagMismatch {
            expected: expected_tag,
            got,
        });
    }
    Ok(RawSample {
        value: parse_num(&caps[3], line)?,
        temp_c: parse_opt_num(caps.get(4), line)?,
        vin: parse_opt_num(caps.get(5), line)?,
    })
}

/// Parse the one-line CSV dump produced by the `^` command.
pub fn parse_config_dump(line: &str) -> Result<SensorConfig, CodecError> {
    let trimmed = line.trim_end();
    let caps = RE_CONFIG_DUMP
        .captures(trimmed)
        .ok_or_else(|| CodecError::InvalidLine(line.to_string()))?;

    let averaging: u32 = caps[1]
        .parse()
        .map_err(|_| CodecError::InvalidLine(line.to_string()))?;
    let calfactor = parse_num(&caps[3], line)?;
    let firmware_version = caps[5].to_string();
    let sensor_id = caps[6].to_string();
    let mode = match &caps[7] {
        "0" => SensorMode::Freerun,
        _ => SensorMode::Polled,
    };
    let tag = caps[8].chars().next();
    if mode == SensorMode::Polled && tag.is_none() {
        return Err(CodecError::InvalidLine(line.to_string()));
    }
    let preamble = caps[9].to_string();
    let include_temp = &caps[10] == "1";
    let include_vin = &caps[11] == "1";
    let adc_rate_hz: u32 = caps[12]
        .parse()
        .map_err(|_| CodecError::InvalidLine(line.to_string()))?;

    Ok(SensorConfig {
        averaging,
        adc_rate_hz,
        mode,
        tag: if mode == SensorMode::Polled { tag } else { None },
        include_temp,
        include_vin,
        sensor_id,
        firmware_version,
        preamble,
        calfactor,
    })
}
