//! SdrDevice -- the SCPI device implementation for a receiver.
//!
//! This module ties the generic bridge verbs from `sdrbridge-scpi` to a
//! [`CaptureSource`], the shared [`ConfigStore`] and the session's
//! [`AcquisitionFlags`]. It also owns the receiver-specific verbs:
//!
//! | Line | Effect |
//! |---|---|
//! | `REFCLK internal\|external` | select the reference clock |
//! | `RXGAIN <dB>` | set RX gain |
//! | `RXBW <Hz>` | set RX analog bandwidth |
//! | `RXFREQ <Hz>` | tune the receiver |
//!
//! and the status queries `REFCLK?`, `RXGAIN?`, `RXBW?`, `RXFREQ?`, `RATE?`
//! and `DEPTH?`.
//!
//! Every configuration change runs under the store's lock: the requested
//! value is stored, the capture source is asked to apply it, and the value
//! it reports back is logged next to the request. A value the receiver
//! rejects is still stored as requested, and the rejection is returned so
//! the session can queue it.

use std::sync::Arc;

use async_trait::async_trait;

use sdrbridge_core::capture::CaptureSource;
use sdrbridge_core::error::{Error, Result};
use sdrbridge_core::helpers::{format_freq_mhz, format_rate_msps, parse_f64_arg};
use sdrbridge_core::types::{ClockSource, sample_depth_catalog};
use sdrbridge_scpi::protocol::ScpiLine;
use sdrbridge_scpi::server::{
    ChannelInfo, ChannelType, CommandHandler, Identify, Identity, required_arg,
};

use crate::config::ConfigStore;
use crate::flags::AcquisitionFlags;

/// Firmware version reported by `*IDN?`.
pub const FIRMWARE_VERSION: &str = "1.0";

/// A receiver as seen by one control session.
pub struct SdrDevice {
    source: Arc<dyn CaptureSource>,
    config: Arc<ConfigStore>,
    flags: Arc<AcquisitionFlags>,
}

impl SdrDevice {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        config: Arc<ConfigStore>,
        flags: Arc<AcquisitionFlags>,
    ) -> Self {
        SdrDevice {
            source,
            config,
            flags,
        }
    }

    /// `REFCLK`: select the reference clock.
    ///
    /// Unlike the analog settings, a clock source the receiver refuses is
    /// not stored.
    pub async fn set_clock_source(&self, arg: &str) -> Result<()> {
        let source: ClockSource = arg
            .parse()
            .map_err(|e| Error::Parse(format!("{}", e)))?;

        let mut config = self.config.lock().await;
        self.source.set_clock_source(source).await.map_err(|e| {
            tracing::warn!(requested = %source, error = %e, "Receiver refused clock source");
            e
        })?;
        config.clock_source = source;
        tracing::debug!(clock_source = %source, "set reference clock");
        Ok(())
    }

    /// `RXGAIN`: set RX gain in dB.
    pub async fn set_rx_gain(&self, arg: &str) -> Result<()> {
        let requested = parse_f64_arg(arg)?;

        let mut config = self.config.lock().await;
        config.rx_gain_db = requested;
        self.source
            .set_rx_gain(requested)
            .await
            .map_err(|e| rejected("rx gain", requested, e))?;
        let achieved = self.source.rx_gain().await?;
        tracing::debug!(requested, achieved, "set rx gain (dB)");
        Ok(())
    }

    /// `RXBW`: set RX analog bandwidth in Hz.
    pub async fn set_rx_bandwidth(&self, arg: &str) -> Result<()> {
        let requested = parse_f64_arg(arg)?;

        let mut config = self.config.lock().await;
        config.rx_bandwidth_hz = requested;
        self.source
            .set_rx_bandwidth(requested)
            .await
            .map_err(|e| rejected("rx bandwidth", requested, e))?;
        let achieved = self.source.rx_bandwidth().await?;
        tracing::debug!(
            requested = %format_freq_mhz(requested),
            achieved = %format_freq_mhz(achieved),
            "set rx bandwidth"
        );
        Ok(())
    }

    /// `RXFREQ`: tune to a center frequency in Hz.
    ///
    /// Also caches the frequency actually tuned, which `RXFREQ?` reports.
    pub async fn set_rx_frequency(&self, arg: &str) -> Result<()> {
        let requested = parse_f64_arg(arg)?;

        let mut config = self.config.lock().await;
        config.center_frequency_hz = requested.round() as i64;
        self.source
            .set_rx_frequency(requested)
            .await
            .map_err(|e| rejected("rx frequency", requested, e))?;
        let achieved = self.source.rx_frequency().await?;
        config.tuned_frequency_hz = achieved.round() as i64;
        tracing::debug!(
            requested = %format_freq_mhz(requested),
            achieved = %format_freq_mhz(achieved),
            "set rx frequency"
        );
        Ok(())
    }
}

fn rejected(what: &str, requested: f64, e: Error) -> Error {
    tracing::warn!(setting = what, requested, error = %e, "Receiver rejected setting, keeping requested value");
    e
}

impl Identify for SdrDevice {
    fn identity(&self) -> Identity {
        let info = self.source.info();
        Identity {
            make: info.make().to_string(),
            model: info.model.clone(),
            serial: info.serial.clone(),
            firmware: FIRMWARE_VERSION.to_string(),
        }
    }
}

impl ChannelInfo for SdrDevice {
    fn analog_channel_count(&self) -> usize {
        1
    }

    /// `C1`, `CH1`, `c2` ... all name the single RX channel.
    fn channel_id(&self, subject: &str) -> Option<usize> {
        let digits = subject
            .strip_prefix("CH")
            .or_else(|| subject.strip_prefix('C'))?;
        (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())).then_some(0)
    }

    fn channel_type(&self, _channel: usize) -> ChannelType {
        ChannelType::Analog
    }

    fn sample_rates(&self) -> Vec<u64> {
        self.source.rx_rate_range().catalog()
    }

    fn sample_depths(&self) -> Vec<u64> {
        sample_depth_catalog()
    }
}

#[async_trait]
impl CommandHandler for SdrDevice {
    async fn acquisition_start(&self, one_shot: bool) -> Result<()> {
        self.flags.arm(one_shot);
        tracing::debug!(one_shot, "acquisition armed");
        Ok(())
    }

    async fn acquisition_stop(&self) -> Result<()> {
        if self.flags.disarm() {
            tracing::debug!("acquisition stopped");
        } else if self.flags.is_armed() {
            tracing::debug!("stop with single block pending; it will still be delivered");
        }
        Ok(())
    }

    async fn acquisition_force_trigger(&self) -> Result<()> {
        // Blocks start as soon as acquisition is armed; there is no trigger to force.
        Ok(())
    }

    fn is_trigger_armed(&self) -> bool {
        self.flags.is_armed()
    }

    async fn set_sample_rate(&self, rate_hz: u64) -> Result<()> {
        if rate_hz == 0 {
            return Err(Error::InvalidParameter("sample rate must be positive".into()));
        }
        let requested = rate_hz as f64;

        let mut config = self.config.lock().await;
        config.sample_rate_hz = rate_hz;
        self.source
            .set_rx_rate(requested)
            .await
            .map_err(|e| rejected("sample rate", requested, e))?;
        let achieved = self.source.rx_rate().await?;
        tracing::debug!(
            requested = %format_rate_msps(requested),
            achieved = %format_rate_msps(achieved),
            "set sample rate"
        );
        Ok(())
    }

    async fn set_sample_depth(&self, depth: u64) -> Result<()> {
        if depth == 0 {
            return Err(Error::InvalidParameter("sample depth must be positive".into()));
        }
        self.config.lock().await.block_depth = depth;
        tracing::debug!(depth, "set sample depth");
        Ok(())
    }

    // The receiver has one always-on analog channel and no trigger
    // hardware. Generic clients still send channel and trigger setup, so
    // these are accepted and ignored.

    async fn set_channel_enabled(&self, _channel: usize, _enabled: bool) -> Result<()> {
        Ok(())
    }

    async fn set_analog_coupling(&self, _channel: usize, _coupling: &str) -> Result<()> {
        Ok(())
    }

    async fn set_analog_range(&self, _channel: usize, _range_v: f64) -> Result<()> {
        Ok(())
    }

    async fn set_analog_offset(&self, _channel: usize, _offset_v: f64) -> Result<()> {
        Ok(())
    }

    async fn set_digital_threshold(&self, _channel: usize, _threshold_v: f64) -> Result<()> {
        Ok(())
    }

    async fn set_digital_hysteresis(&self, _channel: usize, _hysteresis_v: f64) -> Result<()> {
        Ok(())
    }

    async fn set_trigger_delay(&self, _delay_fs: u64) -> Result<()> {
        Ok(())
    }

    async fn set_trigger_source(&self, _channel: usize) -> Result<()> {
        Ok(())
    }

    async fn set_trigger_level(&self, _level_v: f64) -> Result<()> {
        Ok(())
    }

    async fn set_trigger_type_edge(&self) -> Result<()> {
        Ok(())
    }

    async fn set_edge_trigger_edge(&self, _edge: &str) -> Result<()> {
        Ok(())
    }

    async fn on_command(&self, line: &ScpiLine) -> Result<bool> {
        if line.subject.is_some() {
            return Ok(false);
        }
        let handler = match line.command.as_str() {
            "REFCLK" | "RXGAIN" | "RXBW" | "RXFREQ" => line.command.as_str(),
            _ => return Ok(false),
        };
        let arg = required_arg(line)?;

        match handler {
            "REFCLK" => self.set_clock_source(arg).await?,
            "RXGAIN" => self.set_rx_gain(arg).await?,
            "RXBW" => self.set_rx_bandwidth(arg).await?,
            _ => self.set_rx_frequency(arg).await?,
        }
        Ok(true)
    }

    async fn on_query(&self, line: &ScpiLine) -> Result<Option<String>> {
        if line.subject.is_some() {
            return Ok(None);
        }
        let config = self.config.snapshot().await;
        let reply = match line.command.as_str() {
            "REFCLK" => config.clock_source.to_string(),
            "RXGAIN" => config.rx_gain_db.to_string(),
            "RXBW" => config.rx_bandwidth_hz.to_string(),
            "RXFREQ" => config.tuned_frequency_hz.to_string(),
            "RATE" => config.sample_rate_hz.to_string(),
            "DEPTH" => config.block_depth.to_string(),
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }
}
