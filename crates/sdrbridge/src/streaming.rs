//! Acquisition state machine and block-streaming loop.
//!
//! One [`StreamingWorker`] runs per session, next to the control session.
//! The two never call each other: the worker learns what to do from the
//! session's [`AcquisitionFlags`] and, at each block boundary, from a
//! [`BlockParams`] snapshot of the [`ConfigStore`].
//!
//! ```text
//!           armed                start block
//!   Idle ─────────────► ArmedWaiting ─────────► BlockInFlight
//!    ▲                       ▲                       │
//!    │  disarmed / one-shot  │  still armed          │ frame sent
//!    └───────────────────────┴───────────────────────┘
//!
//!   any state ── quit ──► Stopped
//! ```
//!
//! A block that ends early (timeout, overflow, receiver error) is still
//! sent, carrying however many samples arrived. A failed write to the data
//! plane ends the worker.

use std::sync::Arc;
use std::time::Duration;


use sdrbridge_core::capture::{CaptureSource, RecvStatus};
use sdrbridge_core::error::Result;
use sdrbridge_core::frame::{WaveformFrame, write_frame};
use sdrbridge_core::transport::DataTransport;
use sdrbridge_core::types::IqSample;

use crate::config::{BlockParams, ConfigStore};
use crate::flags::{AcquisitionFlags, ArmState};

/// Default bound on a single receive call.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default fallback interval for re-checking the armed flag while idle.
pub const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Where the worker is in the acquisition cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not armed; waiting for a flag change.
    Idle,
    /// Armed, no block outstanding.
    ArmedWaiting,
    /// One capture request outstanding.
    BlockInFlight,
    /// Quit observed or the data plane failed. Terminal.
    Stopped,
}

/// Outcome of one capture request.
#[derive(Debug)]
struct CapturedBlock {
    samples: Vec<IqSample>,
    status: RecvStatus,
}

/// Pulls blocks from a [`CaptureSource`] and writes them as frames.
pub struct StreamingWorker {
    source: Arc<dyn CaptureSource>,
    config: Arc<ConfigStore>,
    flags: Arc<AcquisitionFlags>,
    capture_timeout: Duration,
    idle_poll_interval: Duration,
    state: StreamState,
    blocks_sent: u64,
}

impl StreamingWorker {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        config: Arc<ConfigStore>,
        flags: Arc<AcquisitionFlags>,
    ) -> Self {
        StreamingWorker {
            source,
            config,
            flags,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            idle_poll_interval: DEFAULT_IDLE_POLL_INTERVAL,
            state: StreamState::Idle,
            blocks_sent: 0,
        }
    }

    pub fn capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Number of frames written so far.
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent
    }

    /// Run until quit is requested or the data plane fails.
    ///
    /// Returns `Ok(())` on quit and the transport error otherwise.
    pub async fn run(&mut self, transport: &mut dyn DataTransport) -> Result<()> {
        let result = self.stream(transport).await;
        self.state = StreamState::Stopped;
        tracing::debug!(blocks = self.blocks_sent, "streaming worker stopped");
        result
    }

    async fn stream(&mut self, transport: &mut dyn DataTransport) -> Result<()> {
        loop {
            if self.flags.is_quit() {
                return Ok(());
            }

            let arm = self.flags.snapshot();
            if !arm.armed() {
                self.transition(StreamState::Idle);
                self.flags.wait_for_change(self.idle_poll_interval).await;
                continue;
            }
            self.transition(StreamState::ArmedWaiting);

            let params = self.config.block_params().await;
            self.transition(StreamState::BlockInFlight);
            let Some(block) = self.capture_block(params).await else {
                tracing::debug!("quit during capture, block dropped");
                return Ok(());
            };

            let frame = WaveformFrame::new(
                i64::try_from(params.sample_rate_hz).unwrap_or(i64::MAX),
                block.samples,
            );
            if let Err(e) = write_frame(transport, &frame).await {
                tracing::info!(error = %e, "Data client disconnected");
                return Err(e);
            }
            self.blocks_sent += 1;
            tracing::trace!(
                samples = frame.sample_count(),
                depth = params.depth,
                status = %block.status,
                "frame sent"
            );

            if arm.one_shot() {
                self.finish_one_shot(arm);
            }
        }
    }

    fn transition(&mut self, next: StreamState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "stream state");
            self.state = next;
        }
    }

    fn finish_one_shot(&self, at_start: ArmState) {
        if self.flags.complete_one_shot(at_start) {
            tracing::debug!("single block delivered, disarmed");
        } else {
            tracing::debug!("re-armed during single block, staying armed");
        }
    }

    /// Capture one block of `params.depth` samples.
    ///
    /// Returns `None` if quit is requested before the block completes.
    async fn capture_block(&self, params: BlockParams) -> Option<CapturedBlock> {
        let depth = match usize::try_from(params.depth) {
            Ok(depth) => depth,
            Err(_) => {
                tracing::warn!(depth = params.depth, "Block depth exceeds address space");
                return Some(CapturedBlock::empty(RecvStatus::Unknown(0)));
            }
        };

        let mut samples = Vec::new();
        if let Err(e) = samples.try_reserve_exact(depth) {
            tracing::warn!(depth, error = %e, "Cannot allocate block buffer");
            return Some(CapturedBlock::empty(RecvStatus::Unknown(0)));
        }
        samples.resize(depth, IqSample::default());

        if let Err(e) = self.source.request_block(depth).await {
            tracing::warn!(depth, error = %e, "Block request failed");
            samples.clear();
            return Some(CapturedBlock {
                samples,
                status: RecvStatus::Unknown(0),
            });
        }

        let quit = self.flags.quit_token();
        let mut received = 0;
        let mut status = RecvStatus::Ok;
        while received < depth {
            let result = tokio::select! {
                biased;

                _ = quit.cancelled() => return None,

                r = self.source.receive(&mut samples[received..], self.capture_timeout) => r,
            };
            received += result.count.min(depth - received);
            if let Some(e) = result.error() {
                match result.status {
                    RecvStatus::Timeout => tracing::debug!(received, depth, "Capture timed out"),
                    _ => tracing::warn!(received, depth, error = %e, "Capture ended early"),
                }
                status = result.status;
                break;
            }
        }

        samples.truncate(received);
        Some(CapturedBlock { samples, status })
    }
}

impl CapturedBlock {
    fn empty(status: RecvStatus) -> Self {
        CapturedBlock {
            samples: Vec::new(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrbridge_core::capture::RecvResult;
    use sdrbridge_core::error::Error;
    use sdrbridge_test_harness::{MockCapture, MockDataTransport};
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        mock: Arc<MockCapture>,
        config: Arc<ConfigStore>,
        flags: Arc<AcquisitionFlags>,
        data: MockDataTransport,
        worker: JoinHandle<(Result<()>, StreamState)>,
    }

    impl Harness {
        async fn start(depth: u64, rate: u64) -> Self {
            let mock = Arc::new(MockCapture::new());
            let config = Arc::new(ConfigStore::default());
            {
                let mut c = config.lock().await;
                c.block_depth = depth;
                c.sample_rate_hz = rate;
            }
            let flags = Arc::new(AcquisitionFlags::new());
            let data = MockDataTransport::new();

            let mut worker = StreamingWorker::new(mock.clone(), config.clone(), flags.clone())
                .capture_timeout(Duration::from_millis(50));
            let mut transport = data.clone();
            let worker = tokio::spawn(async move {
                let result = worker.run(&mut transport).await;
                (result, worker.state())
            });

            Harness {
                mock,
                config,
                flags,
                data,
                worker,
            }
        }

        async fn stop(self) -> (Result<()>, StreamState) {
            self.flags.quit();
            tokio::time::timeout(WAIT, self.worker)
                .await
                .expect("worker did not stop")
                .unwrap()
        }
    }

    #[tokio::test]
    async fn full_block_has_requested_depth() {
        let h = Harness::start(100, 2_000_000).await;
        h.flags.arm(true);

        let frames = h.data.wait_for_frames(1, WAIT).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sample_count(), 100);
        assert_eq!(frames[0].sample_rate_hz, 2_000_000);
        assert_eq!(h.mock.requests().await, vec![100]);

        let (result, state) = h.stop().await;
        assert!(result.is_ok());
        assert_eq!(state, StreamState::Stopped);
    }

    #[tokio::test]
    async fn timeout_sends_partial_block() {
        let h = Harness::start(10, 1_000_000).await;
        h.mock
            .script_block(vec![RecvResult::ok(3), RecvResult::ok(4), RecvResult::timeout()])
            .await;
        h.flags.arm(true);

        let frames = h.data.wait_for_frames(1, WAIT).await;
        assert_eq!(frames[0].sample_count(), 7);
        assert_eq!(frames[0].samples.len(), 7);
        h.stop().await.0.unwrap();
    }

    #[tokio::test]
    async fn overflow_and_device_errors_send_partial_block() {
        let h = Harness::start(10, 1_000_000).await;
        h.mock.script_block(vec![RecvResult::overflow(2)]).await;
        h.mock
            .script_block(vec![
                RecvResult::ok(5),
                RecvResult {
                    count: 0,
                    status: RecvStatus::Unknown(0x10),
                },
            ])
            .await;
        h.mock.script_block(vec![RecvResult::timeout()]).await;
        h.flags.arm(false);

        let frames = h.data.wait_for_frames(3, WAIT).await;
        let counts: Vec<u64> = frames.iter().take(3).map(|f| f.sample_count()).collect();
        assert_eq!(counts, vec![2, 5, 0]);
        h.stop().await.0.unwrap();
    }

    #[tokio::test]
    async fn one_shot_sends_exactly_one_frame() {
        let h = Harness::start(16, 1_000_000).await;
        h.flags.arm(true);

        h.data.wait_for_frames(1, WAIT).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.data.frames().await.len(), 1);
        assert!(!h.flags.is_armed());
        assert_eq!(h.mock.requests().await.len(), 1);

        // Re-arming produces another.
        h.flags.arm(true);
        assert_eq!(h.data.wait_for_frames(2, WAIT).await.len(), 2);
        h.stop().await.0.unwrap();
    }

    #[tokio::test]
    async fn continuous_until_stop() {
        let h = Harness::start(8, 1_000_000).await;
        h.flags.arm(false);

        assert!(h.data.wait_for_frames(3, WAIT).await.len() >= 3);
        assert!(h.flags.disarm());

        // Allow the block in flight to land, then nothing more.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = h.data.frames().await.len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.data.frames().await.len(), settled);
        assert!(h.data.frames().await.iter().all(|f| f.sample_count() == 8));
        h.stop().await.0.unwrap();
    }

    #[tokio::test]
    async fn depth_change_applies_at_next_block() {
        let h = Harness::start(10, 1_000_000).await;
        h.mock.pause_blocks().await;
        h.flags.arm(false);

        // First block is in flight with depth 10.
        assert!(h.mock.wait_for_requests(1, WAIT).await);
        {
            let mut c = h.config.lock().await;
            c.block_depth = 20;
            c.sample_rate_hz = 4_000_000;
        }
        h.mock.release_block().await;
        h.mock.release_block().await;

        let frames = h.data.wait_for_frames(2, WAIT).await;
        assert_eq!(frames[0].sample_count(), 10);
        assert_eq!(frames[0].sample_rate_hz, 1_000_000);
        assert_eq!(frames[1].sample_count(), 20);
        assert_eq!(frames[1].sample_rate_hz, 4_000_000);
        assert_eq!(&h.mock.requests().await[..2], &[10, 20]);

        h.mock.resume().await;
        h.stop().await.0.unwrap();
    }

    #[tokio::test]
    async fn stop_does_not_cancel_committed_single() {
        let h = Harness::start(10, 1_000_000).await;
        h.mock.script_block(vec![RecvResult::ok(10)]).await;

        h.flags.arm(true);
        h.flags.disarm();

        let frames = h.data.wait_for_frames(1, WAIT).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sample_count(), 10);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.data.frames().await.len(), 1);
        assert!(!h.flags.is_armed());
        h.stop().await.0.unwrap();
    }

    #[tokio::test]
    async fn write_failure_ends_worker() {
        let h = Harness::start(4, 1_000_000).await;
        h.data.fail_after_sends(2).await;
        h.flags.arm(false);

        let (result, state) = tokio::time::timeout(WAIT, h.worker).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::ConnectionLost)));
        assert_eq!(state, StreamState::Stopped);
        // Header and payload of the first frame made it out.
        assert_eq!(h.data.frames().await.len(), 1);
    }

    #[tokio::test]
    async fn quit_while_idle() {
        let h = Harness::start(4, 1_000_000).await;
        let mock = h.mock.clone();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (result, state) = h.stop().await;
        assert!(result.is_ok());
        assert_eq!(state, StreamState::Stopped);
        assert!(mock.requests().await.is_empty());
    }

    #[tokio::test]
    async fn quit_abandons_block_in_flight() {
        let h = Harness::start(4, 1_000_000).await;
        h.mock.pause_blocks().await;
        h.flags.arm(false);
        assert!(h.mock.wait_for_requests(1, WAIT).await);

        let data = h.data.clone();
        let (result, _) = h.stop().await;
        assert!(result.is_ok());
        assert_eq!(data.send_count().await, 0);
    }
}
