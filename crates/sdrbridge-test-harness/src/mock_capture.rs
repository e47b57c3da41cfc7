//! Scripted capture source for deterministic testing of the streaming loop.
//!
//! [`MockCapture`] implements [`CaptureSource`] with per-block scripts of
//! receive results. This lets you test full blocks, partial blocks after a
//! timeout or overflow, and configuration changes made while a block is in
//! flight, without real hardware.
//!
//! # Example
//!
//! ```
//! use sdrbridge_core::capture::RecvResult;
//! use sdrbridge_test_harness::MockCapture;
//!
//! # async fn example() {
//! let mock = MockCapture::new();
//! // The next block delivers 4 samples, then times out.
//! mock.script_block(vec![RecvResult::ok(4), RecvResult::timeout()]).await;
//! # }
//! ```

use async_trait::async_trait;
use num_complex::Complex32;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use sdrbridge_core::capture::{CaptureSource, RecvResult, RecvStatus};
use sdrbridge_core::error::{Error, Result};
use sdrbridge_core::types::{ClockSource, DeviceInfo, IqSample, RateRange};

/// A configuration parameter of the mock receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Gain,
    Bandwidth,
    Frequency,
    Rate,
    ClockSource,
}

/// What the mock does with values written to one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
enum Rule {
    /// Store the value as given.
    #[default]
    Accept,
    /// Store the value clamped to `[min, max]`.
    Clamp(f64, f64),
    /// Refuse with [`Error::Device`] and keep the old value.
    Reject,
}

#[derive(Debug)]
struct MockState {
    gain: f64,
    bandwidth: f64,
    frequency: f64,
    rate: f64,
    clock_source: ClockSource,
    rules: Vec<(Param, Rule)>,
    frontend: Option<(String, String)>,

    /// Scripts for upcoming blocks, consumed one per `request_block`.
    scripts: VecDeque<Vec<RecvResult>>,
    /// Remaining script entries for the block in flight.
    current: VecDeque<RecvResult>,
    /// Samples still owed for the block in flight.
    pending: usize,
    /// Counter used to fill samples with recognizable values.
    next_sample: u32,
    /// Every `request_block` size, in order.
    requests: Vec<usize>,

    /// When set, each block waits for `release_block` before delivering.
    paused: bool,
    released: usize,
    current_released: bool,
}

/// A mock [`CaptureSource`] for testing the bridge without hardware.
///
/// Without a script, a block is delivered in full in one receive call.
/// A scripted block plays back its entries in order, each limited to what
/// is still owed; once the script is exhausted any remaining samples are
/// delivered in full. A receive with nothing owed times out immediately.
///
/// Samples are numbered: the n-th sample delivered over the mock's lifetime
/// is `(n, -n)`, which makes block boundaries visible in frame payloads.
#[derive(Debug)]
pub struct MockCapture {
    info: DeviceInfo,
    rate_range: RateRange,
    state: Mutex<MockState>,
    release: Notify,
}

impl MockCapture {
    /// Create a mock reporting model `MOCK`, serial `1234`.
    pub fn new() -> Self {
        Self::with_info("MOCK", "1234")
    }

    /// Create a mock reporting the given model and serial.
    pub fn with_info(model: &str, serial: &str) -> Self {
        MockCapture {
            info: DeviceInfo::new(model, serial),
            rate_range: RateRange::new(1e6, 4e6, 1.0),
            state: Mutex::new(MockState {
                gain: 0.0,
                bandwidth: 0.0,
                frequency: 0.0,
                rate: 1e6,
                clock_source: ClockSource::Internal,
                rules: Vec::new(),
                frontend: None,
                scripts: VecDeque::new(),
                current: VecDeque::new(),
                pending: 0,
                next_sample: 0,
                requests: Vec::new(),
                paused: false,
                released: 0,
                current_released: false,
            }),
            release: Notify::new(),
        }
    }

    /// Override the reported sample-rate range.
    pub fn with_rate_range(mut self, range: RateRange) -> Self {
        self.rate_range = range;
        self
    }

    /// Queue the receive results for the next block.
    pub async fn script_block(&self, chunks: Vec<RecvResult>) {
        self.state.lock().await.scripts.push_back(chunks);
    }

    /// Clamp values written to `param` into `[min, max]`.
    pub async fn clamp(&self, param: Param, min: f64, max: f64) {
        self.set_rule(param, Rule::Clamp(min, max)).await;
    }

    /// Make every write to `param` fail with [`Error::Device`].
    pub async fn reject(&self, param: Param) {
        self.set_rule(param, Rule::Reject).await;
    }

    async fn set_rule(&self, param: Param, rule: Rule) {
        let mut state = self.state.lock().await;
        state.rules.retain(|(p, _)| *p != param);
        state.rules.push((param, rule));
    }

    /// Hold every block before its first sample until [`release_block`](Self::release_block).
    pub async fn pause_blocks(&self) {
        self.state.lock().await.paused = true;
    }

    /// Let one held block proceed.
    pub async fn release_block(&self) {
        self.state.lock().await.released += 1;
        self.release.notify_one();
    }

    /// Stop holding blocks.
    pub async fn resume(&self) {
        self.state.lock().await.paused = false;
        self.release.notify_one();
    }

    /// Sizes passed to `request_block`, in order.
    pub async fn requests(&self) -> Vec<usize> {
        self.state.lock().await.requests.clone()
    }

    /// Wait until at least `n` blocks have been requested.
    ///
    /// Returns `false` if that does not happen within `timeout`.
    pub async fn wait_for_requests(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state.lock().await.requests.len() >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// The sub-device and antenna last selected, if any.
    pub async fn frontend(&self) -> Option<(String, String)> {
        self.state.lock().await.frontend.clone()
    }

    /// The value currently applied to a numeric parameter.
    pub async fn applied(&self, param: Param) -> f64 {
        let state = self.state.lock().await;
        match param {
            Param::Gain => state.gain,
            Param::Bandwidth => state.bandwidth,
            Param::Frequency => state.frequency,
            Param::Rate => state.rate,
            Param::ClockSource => match state.clock_source {
                ClockSource::Internal => 0.0,
                ClockSource::External => 1.0,
            },
        }
    }

    async fn write(&self, param: Param, value: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        let rule = state
            .rules
            .iter()
            .find(|(p, _)| *p == param)
            .map(|(_, r)| *r)
            .unwrap_or_default();
        let value = match rule {
            Rule::Accept => value,
            Rule::Clamp(min, max) => value.clamp(min, max),
            Rule::Reject => {
                return Err(Error::Device(format!("{:?} value {} rejected", param, value)));
            }
        };
        match param {
            Param::Gain => state.gain = value,
            Param::Bandwidth => state.bandwidth = value,
            Param::Frequency => state.frequency = value,
            Param::Rate => state.rate = value,
            Param::ClockSource => {}
        }
        Ok(())
    }

    /// Block until the block in flight may deliver samples.
    async fn wait_for_release(&self) {
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.paused || state.current_released {
                    return;
                }
                if state.released > 0 {
                    state.released -= 1;
                    state.current_released = true;
                    return;
                }
            }
            self.release.notified().await;
        }
    }
}

impl Default for MockCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureSource for MockCapture {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn select_frontend(&self, subdev: &str, antenna: &str) -> Result<()> {
        self.state.lock().await.frontend = Some((subdev.to_string(), antenna.to_string()));
        Ok(())
    }

    async fn set_clock_source(&self, source: ClockSource) -> Result<()> {
        self.write(Param::ClockSource, 0.0).await?;
        self.state.lock().await.clock_source = source;
        Ok(())
    }

    async fn set_rx_gain(&self, gain_db: f64) -> Result<()> {
        self.write(Param::Gain, gain_db).await
    }

    async fn rx_gain(&self) -> Result<f64> {
        Ok(self.state.lock().await.gain)
    }

    async fn set_rx_bandwidth(&self, bandwidth_hz: f64) -> Result<()> {
        self.write(Param::Bandwidth, bandwidth_hz).await
    }

    async fn rx_bandwidth(&self) -> Result<f64> {
        Ok(self.state.lock().await.bandwidth)
    }

    async fn set_rx_frequency(&self, freq_hz: f64) -> Result<()> {
        self.write(Param::Frequency, freq_hz).await
    }

    async fn rx_frequency(&self) -> Result<f64> {
        Ok(self.state.lock().await.frequency)
    }

    async fn set_rx_rate(&self, rate_hz: f64) -> Result<()> {
        self.write(Param::Rate, rate_hz).await
    }

    async fn rx_rate(&self) -> Result<f64> {
        Ok(self.state.lock().await.rate)
    }

    fn rx_rate_range(&self) -> RateRange {
        self.rate_range
    }

    async fn request_block(&self, num_samples: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        state.requests.push(num_samples);
        state.pending = num_samples;
        state.current = state.scripts.pop_front().unwrap_or_default().into();
        state.current_released = false;
        Ok(())
    }

    async fn receive(&self, buf: &mut [IqSample], _timeout: Duration) -> RecvResult {
        self.wait_for_release().await;

        let mut state = self.state.lock().await;
        let owed = state.pending.min(buf.len());
        let result = match state.current.pop_front() {
            Some(scripted) => RecvResult {
                count: scripted.count.min(owed),
                status: scripted.status,
            },
            None if owed > 0 => RecvResult::ok(owed),
            None => RecvResult::timeout(),
        };

        for sample in &mut buf[..result.count] {
            let n = state.next_sample as f32;
            *sample = Complex32::new(n, -n);
            state.next_sample += 1;
        }
        state.pending -= result.count;

        if result.status != RecvStatus::Ok {
            tracing::debug!(status = %result.status, count = result.count, "Mock receive ended early");
        }
        result
    }
}
