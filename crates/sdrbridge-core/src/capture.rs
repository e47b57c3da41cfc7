//! Capture-source trait: the bridge's view of the receiver hardware.
//!
//! The [`CaptureSource`] trait abstracts over the driver that tunes the
//! receiver and delivers baseband samples. Implementations exist for UHD
//! devices and a simulated receiver (`sdrbridge-capture`), and for scripted
//! tests (`MockCapture` in `sdrbridge-test-harness`).
//!
//! Configuration setters and their read-back getters are separate calls so
//! the control session can log what it asked for next to what the hardware
//! actually applied. Hardware snaps most values to supported steps.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{ClockSource, DeviceInfo, IqSample, RateRange};

/// Completion code of a single [`CaptureSource::receive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// Samples were delivered normally.
    Ok,
    /// No samples arrived within the timeout.
    Timeout,
    /// The device overran its buffers and dropped samples.
    Overflow,
    /// Any other driver-specific error code.
    Unknown(i32),
}

impl fmt::Display for RecvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvStatus::Ok => write!(f, "ok"),
            RecvStatus::Timeout => write!(f, "timeout"),
            RecvStatus::Overflow => write!(f, "overflow"),
            RecvStatus::Unknown(code) => write!(f, "unknown error 0x{code:x}"),
        }
    }
}

/// Outcome of a single [`CaptureSource::receive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvResult {
    /// Number of samples written to the front of the caller's buffer.
    pub count: usize,
    /// Completion code reported alongside the samples.
    pub status: RecvStatus,
}

impl RecvResult {
    pub fn ok(count: usize) -> Self {
        RecvResult {
            count,
            status: RecvStatus::Ok,
        }
    }

    pub fn timeout() -> Self {
        RecvResult {
            count: 0,
            status: RecvStatus::Timeout,
        }
    }

    pub fn overflow(count: usize) -> Self {
        RecvResult {
            count,
            status: RecvStatus::Overflow,
        }
    }

    /// Convert a non-`Ok` status into the matching [`Error`].
    pub fn error(&self) -> Option<Error> {
        match self.status {
            RecvStatus::Ok => None,
            RecvStatus::Timeout => Some(Error::CaptureTimeout),
            RecvStatus::Overflow => Some(Error::CaptureOverflow),
            RecvStatus::Unknown(code) => {
                Some(Error::Device(format!("receive failed with code 0x{code:x}")))
            }
        }
    }
}

/// Asynchronous interface to a receiver.
///
/// All methods take `&self`: one source is shared between the control
/// session (configuration) and the streaming worker (sample capture), so
/// implementations guard their driver handles internally. Backends built
/// on blocking drivers are expected to move those calls off the async
/// runtime themselves.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Static information about the connected receiver.
    fn info(&self) -> &DeviceInfo;

    /// Select the RX sub-device and antenna port.
    async fn select_frontend(&self, _subdev: &str, _antenna: &str) -> Result<()> {
        Err(Error::Unsupported("front-end selection".into()))
    }

    /// Select the reference clock.
    async fn set_clock_source(&self, source: ClockSource) -> Result<()>;

    /// Request an RX gain in dB.
    async fn set_rx_gain(&self, gain_db: f64) -> Result<()>;

    /// Read back the RX gain actually applied.
    async fn rx_gain(&self) -> Result<f64>;

    /// Request an analog RX bandwidth in hertz.
    async fn set_rx_bandwidth(&self, bandwidth_hz: f64) -> Result<()>;

    /// Read back the RX bandwidth actually applied.
    async fn rx_bandwidth(&self) -> Result<f64>;

    /// Tune the receiver to a center frequency in hertz.
    async fn set_rx_frequency(&self, freq_hz: f64) -> Result<()>;

    /// Read back the center frequency actually tuned.
    async fn rx_frequency(&self) -> Result<f64>;

    /// Request a sample rate in samples per second.
    async fn set_rx_rate(&self, rate_hz: f64) -> Result<()>;

    /// Read back the sample rate actually applied.
    async fn rx_rate(&self) -> Result<f64>;

    /// The range of sample rates the receiver supports.
    fn rx_rate_range(&self) -> RateRange;

    /// Ask the receiver for exactly `num_samples` samples, starting now.
    ///
    /// The samples are then collected with repeated [`receive`](Self::receive)
    /// calls.
    async fn request_block(&self, num_samples: usize) -> Result<()>;

    /// Receive up to `buf.len()` samples, waiting at most `timeout`.
    ///
    /// Partial delivery is normal; the caller accumulates until it has the
    /// requested count or a non-`Ok` status is reported.
    async fn receive(&self, buf: &mut [IqSample], timeout: Duration) -> RecvResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_status_display() {
        assert_eq!(RecvStatus::Ok.to_string(), "ok");
        assert_eq!(RecvStatus::Timeout.to_string(), "timeout");
        assert_eq!(RecvStatus::Overflow.to_string(), "overflow");
        assert_eq!(RecvStatus::Unknown(0x10).to_string(), "unknown error 0x10");
    }

    #[test]
    fn recv_result_errors() {
        assert!(RecvResult::ok(10).error().is_none());
        assert!(matches!(
            RecvResult::timeout().error(),
            Some(Error::CaptureTimeout)
        ));
        assert!(matches!(
            RecvResult::overflow(4).error(),
            Some(Error::CaptureOverflow)
        ));
        let unknown = RecvResult {
            count: 0,
            status: RecvStatus::Unknown(0x20),
        };
        assert!(matches!(unknown.error(), Some(Error::Device(_))));
    }
}
