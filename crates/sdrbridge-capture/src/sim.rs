//! Simulated receiver.
//!
//! [`SimulatedSource`] produces a complex tone plus uniform noise, paced to
//! the configured sample rate, and snaps configuration values the way real
//! front ends do (gain to whole dB, everything clamped to a plausible
//! range). It lets the bridge run end to end on a machine with no radio
//! attached.

use async_trait::async_trait;
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::time::Duration;
use tokio::sync::Mutex;

use sdrbridge_core::capture::{CaptureSource, RecvResult};
use sdrbridge_core::error::{Error, Result};
use sdrbridge_core::types::{ClockSource, DeviceInfo, IqSample, RateRange};

use crate::device::DeviceArgs;

/// Gain range in dB. Values are floored to whole dB.
pub const GAIN_RANGE_DB: (f64, f64) = (0.0, 76.0);

/// Analog bandwidth range in Hz.
pub const BANDWIDTH_RANGE_HZ: (f64, f64) = (200e3, 56e6);

/// Tuning range in Hz.
pub const FREQUENCY_RANGE_HZ: (f64, f64) = (70e6, 6e9);

/// Sample-rate range reported by the simulator.
pub const RATE_RANGE: RateRange = RateRange {
    start: 200e3,
    stop: 61.44e6,
    step: 1.0,
};

/// Simulator settings, usually parsed from a `sim:key=value,...` device string.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub model: String,
    pub serial: String,
    /// Initial sample rate in samples per second.
    pub sample_rate_hz: f64,
    /// Tone offset from the center frequency in Hz.
    pub tone_offset_hz: f64,
    /// Tone amplitude (full scale is 1.0).
    pub amplitude: f32,
    /// Peak amplitude of the uniform noise added to each component.
    pub noise: f32,
    /// Maximum samples delivered per receive call.
    pub chunk: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            model: "SIM".into(),
            serial: "0000".into(),
            sample_rate_hz: 1e6,
            tone_offset_hz: 100e3,
            amplitude: 0.5,
            noise: 0.01,
            chunk: 4096,
        }
    }
}

impl SimConfig {
    /// Build a config from device-string arguments, starting from defaults.
    ///
    /// Recognized keys: `rate`, `tone`, `amplitude`, `noise`, `chunk`,
    /// `model`, `serial`. Unknown keys are logged and ignored.
    pub fn from_args(args: &DeviceArgs) -> Result<Self> {
        let mut config = SimConfig::default();
        for (key, value) in args.iter() {
            match key {
                "rate" => config.sample_rate_hz = parse_arg(key, value)?,
                "tone" => config.tone_offset_hz = parse_arg(key, value)?,
                "amplitude" => config.amplitude = parse_arg(key, value)?,
                "noise" => config.noise = parse_arg(key, value)?,
                "chunk" => config.chunk = parse_arg(key, value)?,
                "model" => config.model = value.to_string(),
                "serial" => config.serial = value.to_string(),
                _ => tracing::warn!(key, value, "Ignoring unknown simulator argument"),
            }
        }
        if config.chunk == 0 {
            return Err(Error::InvalidParameter("chunk must be at least 1".into()));
        }
        if !config.sample_rate_hz.is_finite() || config.sample_rate_hz <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "rate must be positive, got {}",
                config.sample_rate_hz
            )));
        }
        Ok(config)
    }
}

fn parse_arg<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Parse(format!("invalid value '{}' for '{}'", value, key)))
}

#[derive(Debug)]
struct SimState {
    clock_source: ClockSource,
    gain_db: f64,
    bandwidth_hz: f64,
    frequency_hz: f64,
    rate_hz: f64,
    /// Samples still owed for the current block.
    pending: usize,
    /// Tone phase in radians, carried across receive calls.
    phase: f64,
    rng: StdRng,
}

/// A receiver that synthesizes samples instead of reading hardware.
#[derive(Debug)]
pub struct SimulatedSource {
    info: DeviceInfo,
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimulatedSource {
    pub fn new(config: SimConfig) -> Self {
        tracing::info!(
            model = %config.model,
            serial = %config.serial,
            rate = config.sample_rate_hz,
            "Opening simulated receiver"
        );
        let state = SimState {
            clock_source: ClockSource::Internal,
            gain_db: 0.0,
            bandwidth_hz: BANDWIDTH_RANGE_HZ.1,
            frequency_hz: FREQUENCY_RANGE_HZ.0,
            rate_hz: RATE_RANGE.start.max(config.sample_rate_hz.min(RATE_RANGE.stop)),
            pending: 0,
            phase: 0.0,
            rng: StdRng::from_entropy(),
        };
        SimulatedSource {
            info: DeviceInfo::new(config.model.clone(), config.serial.clone()),
            config,
            state: Mutex::new(state),
        }
    }

    /// The reference clock currently selected.
    pub async fn clock_source(&self) -> ClockSource {
        self.state.lock().await.clock_source
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

/// Reject NaN and infinities, then clamp into `range`.
fn clamp_finite(what: &str, value: f64, range: (f64, f64)) -> Result<f64> {
    if !value.is_finite() {
        return Err(Error::Device(format!("{} must be finite, got {}", what, value)));
    }
    Ok(value.clamp(range.0, range.1))
}

#[async_trait]
impl CaptureSource for SimulatedSource {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn select_frontend(&self, subdev: &str, antenna: &str) -> Result<()> {
        tracing::debug!(subdev, antenna, "Simulated front end selected");
        Ok(())
    }

    async fn set_clock_source(&self, source: ClockSource) -> Result<()> {
        self.state.lock().await.clock_source = source;
        Ok(())
    }

    async fn set_rx_gain(&self, gain_db: f64) -> Result<()> {
        let gain = clamp_finite("gain", gain_db, GAIN_RANGE_DB)?.floor();
        self.state.lock().await.gain_db = gain;
        Ok(())
    }

    async fn rx_gain(&self) -> Result<f64> {
        Ok(self.state.lock().await.gain_db)
    }

    async fn set_rx_bandwidth(&self, bandwidth_hz: f64) -> Result<()> {
        let bw = clamp_finite("bandwidth", bandwidth_hz, BANDWIDTH_RANGE_HZ)?;
        self.state.lock().await.bandwidth_hz = bw;
        Ok(())
    }

    async fn rx_bandwidth(&self) -> Result<f64> {
        Ok(self.state.lock().await.bandwidth_hz)
    }

    async fn set_rx_frequency(&self, freq_hz: f64) -> Result<()> {
        // Synthesizer resolution is 1 Hz.
        let freq = clamp_finite("frequency", freq_hz, FREQUENCY_RANGE_HZ)?.round();
        self.state.lock().await.frequency_hz = freq;
        Ok(())
    }

    async fn rx_frequency(&self) -> Result<f64> {
        Ok(self.state.lock().await.frequency_hz)
    }

    async fn set_rx_rate(&self, rate_hz: f64) -> Result<()> {
        let rate = clamp_finite("sample rate", rate_hz, (RATE_RANGE.start, RATE_RANGE.stop))?;
        self.state.lock().await.rate_hz = rate;
        Ok(())
    }

    async fn rx_rate(&self) -> Result<f64> {
        Ok(self.state.lock().await.rate_hz)
    }

    fn rx_rate_range(&self) -> RateRange {
        RATE_RANGE
    }

    async fn request_block(&self, num_samples: usize) -> Result<()> {
        self.state.lock().await.pending = num_samples;
        Ok(())
    }

    async fn receive(&self, buf: &mut [IqSample], timeout: Duration) -> RecvResult {
        let (want, rate) = {
            let state = self.state.lock().await;
            (
                state.pending.min(buf.len()).min(self.config.chunk),
                state.rate_hz,
            )
        };

        if want == 0 {
            tokio::time::sleep(timeout).await;
            return RecvResult::timeout();
        }

        // Deliver no faster than the hardware would.
        let pace = Duration::from_secs_f64(want as f64 / rate);
        tokio::time::sleep(pace.min(timeout)).await;

        let mut state = self.state.lock().await;
        let n = want.min(state.pending);
        let step = TAU * self.config.tone_offset_hz / state.rate_hz;
        for sample in &mut buf[..n] {
            let (sin, cos) = state.phase.sin_cos();
            let noise_i = state.rng.gen_range(-1.0f32..=1.0) * self.config.noise;
            let noise_q = state.rng.gen_range(-1.0f32..=1.0) * self.config.noise;
            *sample = Complex32::new(
                self.config.amplitude * cos as f32 + noise_i,
                self.config.amplitude * sin as f32 + noise_q,
            );
            state.phase = (state.phase + step) % TAU;
        }
        state.pending -= n;
        RecvResult::ok(n)
    }
}
