//! Formatting and argument-parsing helpers.
//!
//! Small utilities shared by the control session and the capture backends
//! for logging values in engineering units and parsing numeric arguments.

use crate::error::{Error, Result};

/// Format a frequency in hertz as a human-readable MHz string.
///
/// # Example
///
/// ```
/// use sdrbridge_core::format_freq_mhz;
///
/// assert_eq!(format_freq_mhz(2_441_000_000.0), "2441.000000 MHz");
/// assert_eq!(format_freq_mhz(100_000.0), "0.100000 MHz");
/// ```
pub fn format_freq_mhz(freq_hz: f64) -> String {
    let mhz = freq_hz / 1_000_000.0;
    format!("{mhz:.6} MHz")
}

/// Format a sample rate as a human-readable Msps string.
///
/// # Example
///
/// ```
/// use sdrbridge_core::format_rate_msps;
///
/// assert_eq!(format_rate_msps(61_440_000.0), "61.44 Msps");
/// ```
pub fn format_rate_msps(rate_hz: f64) -> String {
    let msps = rate_hz * 1e-6;
    format!("{msps:.2} Msps")
}

/// Parse a floating-point command argument.
///
/// Accepts anything `f64::from_str` accepts, including exponent notation
/// (`2.4e9`), after trimming whitespace. Non-finite values are rejected.
pub fn parse_f64_arg(arg: &str) -> Result<f64> {
    let value: f64 = arg
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("'{}' is not a number", arg.trim())))?;
    if !value.is_finite() {
        return Err(Error::Parse(format!("'{}' is not a finite number", arg.trim())));
    }
    Ok(value)
}

/// Parse an unsigned integer command argument.
///
/// Clients written against floating-point instruments sometimes send
/// `1e6` or `1000000.0` for integer settings, so integral floats are
/// accepted as well.
pub fn parse_u64_arg(arg: &str) -> Result<u64> {
    let trimmed = arg.trim();
    if let Ok(value) = trimmed.parse::<u64>() {
        return Ok(value);
    }
    let value = parse_f64_arg(trimmed)?;
    if value < 0.0 || value.fract() != 0.0 || value > u64::MAX as f64 {
        return Err(Error::Parse(format!(
            "'{trimmed}' is not a non-negative integer"
        )));
    }
    Ok(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_freq_mhz_vhf() {
        assert_eq!(format_freq_mhz(144_174_000.0), "144.174000 MHz");
    }

    #[test]
    fn format_rate() {
        assert_eq!(format_rate_msps(1_000_000.0), "1.00 Msps");
        assert_eq!(format_rate_msps(250_000.0), "0.25 Msps");
    }

    #[test]
    fn parse_f64_accepts_common_forms() {
        assert_eq!(parse_f64_arg("20.5").unwrap(), 20.5);
        assert_eq!(parse_f64_arg(" -3 ").unwrap(), -3.0);
        assert_eq!(parse_f64_arg("2.4e9").unwrap(), 2.4e9);
    }

    #[test]
    fn parse_f64_rejects_garbage() {
        assert!(matches!(parse_f64_arg("abc"), Err(Error::Parse(_))));
        assert!(matches!(parse_f64_arg(""), Err(Error::Parse(_))));
        assert!(matches!(parse_f64_arg("inf"), Err(Error::Parse(_))));
        assert!(matches!(parse_f64_arg("NaN"), Err(Error::Parse(_))));
    }

    #[test]
    fn parse_u64_accepts_integral_floats() {
        assert_eq!(parse_u64_arg("10000").unwrap(), 10_000);
        assert_eq!(parse_u64_arg("1e6").unwrap(), 1_000_000);
        assert_eq!(parse_u64_arg("20000000.0").unwrap(), 20_000_000);
    }

    #[test]
    fn parse_u64_rejects_fractions_and_negatives() {
        assert!(matches!(parse_u64_arg("10.5"), Err(Error::Parse(_))));
        assert!(matches!(parse_u64_arg("-1"), Err(Error::Parse(_))));
        assert!(matches!(parse_u64_arg("lots"), Err(Error::Parse(_))));
    }
}
