//! Core types used throughout sdrbridge.
//!
//! These types describe the receiver independently of the capture backend
//! (UHD, the simulator, or a test mock).

use std::fmt;
use std::str::FromStr;

/// One complex baseband sample: `re` is I, `im` is Q.
pub type IqSample = num_complex::Complex32;

/// Reference clock selection for the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClockSource {
    /// The receiver's own oscillator.
    #[default]
    Internal,
    /// An external 10 MHz reference.
    External,
}

impl ClockSource {
    /// The lower-case name used on the wire and by UHD.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockSource::Internal => "internal",
            ClockSource::External => "external",
        }
    }
}

impl fmt::Display for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string cannot be parsed into a [`ClockSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseClockSourceError(String);

impl fmt::Display for ParseClockSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown clock source: '{}'. Expected: internal, external",
            self.0
        )
    }
}

impl std::error::Error for ParseClockSourceError {}

impl FromStr for ClockSource {
    type Err = ParseClockSourceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "internal" | "int" => Ok(ClockSource::Internal),
            "external" | "ext" => Ok(ClockSource::External),
            _ => Err(ParseClockSourceError(s.to_string())),
        }
    }
}

/// Static information about the connected receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Motherboard name as reported by the driver (e.g. "B210", "ANTSDR-E310").
    pub model: String,
    /// Motherboard serial number.
    pub serial: String,
}

impl DeviceInfo {
    pub fn new(model: impl Into<String>, serial: impl Into<String>) -> Self {
        DeviceInfo {
            model: model.into(),
            serial: serial.into(),
        }
    }

    /// Vendor name derived from the model string.
    ///
    /// Microphase ANTSDR boards speak UHD but report models starting with
    /// `ANT`; everything else is an Ettus Research USRP.
    pub fn make(&self) -> &'static str {
        if self.model.starts_with("ANT") {
            "Microphase"
        } else {
            "Ettus Research"
        }
    }
}

/// A sample-rate range as reported by the capture backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRange {
    /// Lowest supported rate in samples per second.
    pub start: f64,
    /// Highest supported rate in samples per second.
    pub stop: f64,
    /// Granularity of the range; `0.0` means continuous.
    pub step: f64,
}

/// Smallest spacing between advertised sample rates.
///
/// Receivers typically report a very fine step; listing every value would
/// produce thousands of entries.
pub const MIN_RATE_STEP: f64 = 500_000.0;

impl RateRange {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        RateRange { start, stop, step }
    }

    /// Quantize this range into a list of advertisable sample rates.
    ///
    /// Walks down from `stop` to `start` using the backend's step scaled up
    /// to at least [`MIN_RATE_STEP`], and returns the rates ascending.
    pub fn catalog(&self) -> Vec<u64> {
        if !(self.start.is_finite() && self.stop.is_finite()) || self.stop < self.start {
            return Vec::new();
        }

        let mut step = self.step;
        if step <= 0.0 {
            step = MIN_RATE_STEP;
        } else if step < MIN_RATE_STEP {
            step *= (MIN_RATE_STEP / step).ceil();
        }

        let mut rates = Vec::new();
        let mut rate = self.stop;
        while rate >= self.start {
            rates.push(rate as u64);
            rate -= step;
        }
        rates.reverse();
        rates
    }
}

/// Block depths offered to clients, in samples.
///
/// UHD has no fixed capture memory, so this is a list of reasonable
/// buffer sizes from 10k to 100M samples.
pub fn sample_depth_catalog() -> Vec<u64> {
    const K: u64 = 1_000;
    const M: u64 = K * K;
    vec![
        10 * K,
        20 * K,
        50 * K,
        100 * K,
        200 * K,
        500 * K,
        M,
        2 * M,
        5 * M,
        10 * M,
        20 * M,
        50 * M,
        100 * M,
    ]
}
