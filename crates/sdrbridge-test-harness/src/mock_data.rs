//! Recording data-plane transport.
//!
//! [`MockDataTransport`] implements [`DataTransport`] by appending every
//! write to a shared log. Clones share the log, so a test can hand one
//! clone to the streaming worker and inspect the frames through another.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use sdrbridge_core::error::{Error, Result};
use sdrbridge_core::frame::{DecodeResult, WaveformFrame, decode_frame};
use sdrbridge_core::transport::DataTransport;

#[derive(Debug)]
struct DataState {
    /// One entry per `send()` call.
    sends: Vec<Vec<u8>>,
    connected: bool,
    /// Fail every send once this many have succeeded.
    fail_after: Option<usize>,
}

/// A mock [`DataTransport`] that records what the streaming worker writes.
#[derive(Debug, Clone)]
pub struct MockDataTransport {
    state: Arc<Mutex<DataState>>,
}

impl MockDataTransport {
    /// Create a connected mock transport with an empty log.
    pub fn new() -> Self {
        MockDataTransport {
            state: Arc::new(Mutex::new(DataState {
                sends: Vec::new(),
                connected: true,
                fail_after: None,
            })),
        }
    }

    /// Simulate the client going away: subsequent sends fail with
    /// [`Error::ConnectionLost`].
    pub async fn disconnect(&self) {
        self.state.lock().await.connected = false;
    }

    /// Let `n` more sends succeed, then behave as if the client went away.
    pub async fn fail_after_sends(&self, n: usize) {
        let mut state = self.state.lock().await;
        state.fail_after = Some(state.sends.len() + n);
    }

    /// Number of successful `send()` calls.
    pub async fn send_count(&self) -> usize {
        self.state.lock().await.sends.len()
    }

    /// Everything written so far, concatenated.
    pub async fn bytes(&self) -> Vec<u8> {
        self.state.lock().await.sends.concat()
    }

    /// Decode every complete frame written so far.
    pub async fn frames(&self) -> Vec<WaveformFrame> {
        let bytes = self.bytes().await;
        let mut frames = Vec::new();
        let mut offset = 0;
        while let DecodeResult::Frame { frame, consumed } = decode_frame(&bytes[offset..]) {
            frames.push(frame);
            offset += consumed;
        }
        frames
    }

    /// Wait until at least `n` complete frames have been written.
    ///
    /// Returns whatever frames exist when the wait ends, which may be fewer
    /// than `n` if `timeout` expired.
    pub async fn wait_for_frames(&self, n: usize, timeout: Duration) -> Vec<WaveformFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            let frames = self.frames().await;
            if frames.len() >= n || Instant::now() >= deadline {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Default for MockDataTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataTransport for MockDataTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(Error::ConnectionLost);
        }
        if state.fail_after.is_some_and(|limit| state.sends.len() >= limit) {
            state.connected = false;
            return Err(Error::ConnectionLost);
        }
        state.sends.push(data.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().await.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state
            .try_lock()
            .map(|state| state.connected)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrbridge_core::frame::write_frame;
    use sdrbridge_core::types::IqSample;

    #[tokio::test]
    async fn records_frames() {
        let mock = MockDataTransport::new();
        let mut writer = mock.clone();

        let frame = WaveformFrame::new(2_000_000, vec![IqSample::new(1.0, 2.0); 3]);
        write_frame(&mut writer, &frame).await.unwrap();
        write_frame(&mut writer, &WaveformFrame::new(2_000_000, Vec::new()))
            .await
            .unwrap();

        let frames = mock.frames().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frame);
        assert_eq!(frames[1].sample_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_fails_sends() {
        let mock = MockDataTransport::new();
        let mut writer = mock.clone();
        mock.disconnect().await;
        assert!(matches!(writer.send(b"x").await, Err(Error::ConnectionLost)));
        assert!(!writer.is_connected());
    }

    #[tokio::test]
    async fn fail_after_sends() {
        let mock = MockDataTransport::new();
        let mut writer = mock.clone();
        mock.fail_after_sends(2).await;
        writer.send(b"a").await.unwrap();
        writer.send(b"b").await.unwrap();
        assert!(writer.send(b"c").await.is_err());
        assert_eq!(mock.send_count().await, 2);
        assert_eq!(mock.bytes().await, b"ab");
    }

    #[tokio::test]
    async fn wait_for_frames_returns_partial_on_timeout() {
        let mock = MockDataTransport::new();
        let frames = mock.wait_for_frames(1, Duration::from_millis(5)).await;
        assert!(frames.is_empty());
    }
}
