//! One control session and its streaming worker.
//!
//! A session starts when a control client connects. It creates fresh
//! [`AcquisitionFlags`], spawns the data-plane task (which accepts one
//! client on the shared waveform listener and runs a [`StreamingWorker`]
//! for it), and then runs the SCPI read loop on the control connection.
//! When the control client goes away the session sets quit and waits for
//! the data-plane task before returning, so at most one worker ever
//! touches the capture source.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sdrbridge_core::capture::CaptureSource;
use sdrbridge_core::error::Result;
use sdrbridge_core::transport::DataTransport;
use sdrbridge_scpi::server::{DEFAULT_ERROR_QUEUE_DEPTH, ErrorQueue, serve};
use sdrbridge_transport::{TcpDataTransport, accept_client};

use crate::config::ConfigStore;
use crate::device::SdrDevice;
use crate::flags::AcquisitionFlags;
use crate::streaming::{DEFAULT_CAPTURE_TIMEOUT, DEFAULT_IDLE_POLL_INTERVAL, StreamingWorker};

/// RX sub-device selected at session start.
pub const RX_SUBDEV: &str = "A:A";

/// RX antenna port selected at session start.
pub const RX_ANTENNA: &str = "TX/RX";

/// Per-session tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Bound on a single receive call.
    pub capture_timeout: Duration,
    /// Fallback re-check interval while disarmed.
    pub idle_poll_interval: Duration,
    /// Entries kept in the SCPI error queue.
    pub error_queue_depth: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            idle_poll_interval: DEFAULT_IDLE_POLL_INTERVAL,
            error_queue_depth: DEFAULT_ERROR_QUEUE_DEPTH,
        }
    }
}

/// Everything a session shares with the server that created it.
pub struct Session {
    source: Arc<dyn CaptureSource>,
    config: Arc<ConfigStore>,
    data_listener: Arc<TcpListener>,
    settings: SessionSettings,
    flags: Arc<AcquisitionFlags>,
}

impl Session {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        config: Arc<ConfigStore>,
        data_listener: Arc<TcpListener>,
        settings: SessionSettings,
    ) -> Self {
        Session {
            source,
            config,
            data_listener,
            settings,
            flags: Arc::new(AcquisitionFlags::new()),
        }
    }

    /// Serve `control` until the client disconnects or `shutdown` fires.
    ///
    /// The data-plane task is always joined before this returns. A control
    /// socket error is returned after the join; data-plane errors are only
    /// logged.
    pub async fn run(self, control: TcpStream, peer: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(peer = %peer, "Control session started");
        self.prepare_source().await;

        let data_task = self.spawn_data_plane();

        let device = SdrDevice::new(self.source.clone(), self.config.clone(), self.flags.clone());
        let mut errors = ErrorQueue::new(self.settings.error_queue_depth);
        let (reader, writer) = control.into_split();
        let result = serve(&device, BufReader::new(reader), writer, &mut errors, shutdown).await;

        self.flags.quit();
        if let Err(e) = data_task.await {
            tracing::warn!(error = %e, "Data-plane task panicked");
        }

        match &result {
            Ok(()) => tracing::info!(peer = %peer, "Control session ended"),
            Err(e) => tracing::warn!(peer = %peer, error = %e, "Control session ended with error"),
        }
        result
    }

    /// Select the RX front end and pick up the receiver's current rate.
    async fn prepare_source(&self) {
        if let Err(e) = self.source.select_frontend(RX_SUBDEV, RX_ANTENNA).await {
            tracing::warn!(
                subdev = RX_SUBDEV,
                antenna = RX_ANTENNA,
                error = %e,
                "Could not select RX front end"
            );
        }

        match self.source.rx_rate().await {
            Ok(rate) if rate.is_finite() && rate >= 1.0 => {
                self.config.lock().await.sample_rate_hz = rate.round() as u64;
            }
            Ok(rate) => tracing::debug!(rate, "Receiver reported no usable sample rate"),
            Err(e) => tracing::debug!(error = %e, "Could not read receiver sample rate"),
        }
    }

    fn spawn_data_plane(&self) -> JoinHandle<()> {
        let listener = self.data_listener.clone();
        let quit = self.flags.quit_token();
        let worker = StreamingWorker::new(self.source.clone(), self.config.clone(), self.flags.clone())
            .capture_timeout(self.settings.capture_timeout)
            .idle_poll_interval(self.settings.idle_poll_interval);

        tokio::spawn(async move {
            let accepted = tokio::select! {
                biased;

                _ = quit.cancelled() => {
                    tracing::debug!("session ended before a data client connected");
                    return;
                }

                accepted = accept_client(&listener) => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Data-plane accept failed");
                    return;
                }
            };
            tracing::info!(peer = %peer, "Data client connected");

            let mut transport = TcpDataTransport::from_stream(stream, peer.to_string());
            stream_to(worker, &mut transport, quit).await;
            let _ = transport.close().await;
        })
    }
}

/// Run `worker` on `transport` until it stops or `quit` fires.
///
/// Quit also has to interrupt a frame write blocked on a client that has
/// stopped reading.
async fn stream_to(mut worker: StreamingWorker, transport: &mut TcpDataTransport, quit: CancellationToken) {
    let result = tokio::select! {
        biased;

        _ = quit.cancelled() => Ok(()),

        result = worker.run(transport) => result,
    };
    match result {
        Ok(()) => tracing::debug!(blocks = worker.blocks_sent(), "Streaming worker finished"),
        Err(e) => tracing::info!(
            peer = %transport.addr(),
            blocks = worker.blocks_sent(),
            error = %e,
            "Streaming worker stopped on data-plane error"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrbridge_test_harness::{BridgeClient, MockCapture};
    use sdrbridge_transport::bind_listener;

    struct Listeners {
        control: TcpListener,
        data: Arc<TcpListener>,
        control_addr: String,
        data_addr: String,
    }

    async fn listeners() -> Listeners {
        let control = bind_listener("127.0.0.1", 0).await.unwrap();
        let data = bind_listener("127.0.0.1", 0).await.unwrap();
        Listeners {
            control_addr: control.local_addr().unwrap().to_string(),
            data_addr: data.local_addr().unwrap().to_string(),
            control,
            data: Arc::new(data),
        }
    }

    fn spawn_session(
        mock: Arc<MockCapture>,
        config: Arc<ConfigStore>,
        l: &Listeners,
        control: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let session = Session::new(mock, config, l.data.clone(), SessionSettings::default());
        tokio::spawn(session.run(control, peer, shutdown))
    }

    #[tokio::test]
    async fn selects_front_end_and_syncs_rate() {
        let l = listeners().await;
        let mock = Arc::new(MockCapture::new());
        mock.set_rx_rate(2e6).await.unwrap();
        let config = Arc::new(ConfigStore::default());

        let mut client = BridgeClient::connect_control(&l.control_addr).await.unwrap();
        let (control, peer) = accept_client(&l.control).await.unwrap();
        let session = spawn_session(mock.clone(), config.clone(), &l, control, peer, CancellationToken::new());

        assert_eq!(client.query("RATE?").await.unwrap(), "2000000");
        assert_eq!(
            mock.frontend().await,
            Some((RX_SUBDEV.to_string(), RX_ANTENNA.to_string()))
        );

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn streams_to_data_client() {
        let l = listeners().await;
        let mock = Arc::new(MockCapture::new());
        let config = Arc::new(ConfigStore::default());

        let mut client = BridgeClient::connect(&l.control_addr, &l.data_addr).await.unwrap();
        let (control, peer) = accept_client(&l.control).await.unwrap();
        let session = spawn_session(mock, config, &l, control, peer, CancellationToken::new());

        client.command("DEPTH 20000").await.unwrap();
        client.command("SINGLE").await.unwrap();
        let frame = client.read_frame(Duration::from_secs(5)).await.unwrap();
        assert_eq!(frame.sample_count(), 20_000);
        assert_eq!(frame.sample_rate_hz, 1_000_000);
        assert!(client.expect_no_frame(Duration::from_millis(50)).await.unwrap());
        assert_eq!(client.query("ARMED?").await.unwrap(), "0");

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session did not end")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn ends_without_data_client() {
        let l = listeners().await;
        let mock = Arc::new(MockCapture::new());
        let config = Arc::new(ConfigStore::default());

        let client = BridgeClient::connect_control(&l.control_addr).await.unwrap();
        let (control, peer) = accept_client(&l.control).await.unwrap();
        let session = spawn_session(mock, config, &l, control, peer, CancellationToken::new());

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session did not end")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_ends_active_session() {
        let l = listeners().await;
        let mock = Arc::new(MockCapture::new());
        let config = Arc::new(ConfigStore::default());
        let shutdown = CancellationToken::new();

        let mut client = BridgeClient::connect(&l.control_addr, &l.data_addr).await.unwrap();
        let (control, peer) = accept_client(&l.control).await.unwrap();
        let session = spawn_session(mock, config, &l, control, peer, shutdown.clone());

        client.command("START").await.unwrap();
        client.read_frame(Duration::from_secs(5)).await.unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session did not end")
            .unwrap()
            .unwrap();
    }
}
