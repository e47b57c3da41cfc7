//! BridgeServer -- listeners and the session accept loop.
//!
//! The server owns the capture source, the [`ConfigStore`] and both
//! listeners. Control connections are served one at a time: the next
//! client is accepted only after the previous session, including its
//! streaming worker, has fully ended. A session that fails is logged and
//! the loop moves on.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sdrbridge::BridgeServerBuilder;
//! use sdrbridge_test_harness::MockCapture;
//!
//! # async fn example() -> sdrbridge_core::Result<()> {
//! let server = BridgeServerBuilder::new()
//!     .bind_address("127.0.0.1")
//!     .scpi_port(5025)
//!     .waveform_port(5026)
//!     .build(Arc::new(MockCapture::new()))
//!     .await?;
//! server.run().await
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sdrbridge_core::capture::CaptureSource;
use sdrbridge_core::error::{Error, Result};
use sdrbridge_transport::{accept_client, bind_listener};

use crate::config::ConfigStore;
use crate::session::{Session, SessionSettings};

/// Default control-plane port.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Default data-plane port.
pub const DEFAULT_WAVEFORM_PORT: u16 = 5026;

/// Default listen address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Fluent builder for [`BridgeServer`].
#[derive(Debug, Clone)]
pub struct BridgeServerBuilder {
    bind_address: String,
    scpi_port: u16,
    waveform_port: u16,
    settings: SessionSettings,
    shutdown: Option<CancellationToken>,
}

impl BridgeServerBuilder {
    pub fn new() -> Self {
        BridgeServerBuilder {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            scpi_port: DEFAULT_SCPI_PORT,
            waveform_port: DEFAULT_WAVEFORM_PORT,
            settings: SessionSettings::default(),
            shutdown: None,
        }
    }

    /// Address both listeners bind to.
    pub fn bind_address(mut self, addr: &str) -> Self {
        self.bind_address = addr.to_string();
        self
    }

    /// Control-plane port. 0 picks a free port.
    pub fn scpi_port(mut self, port: u16) -> Self {
        self.scpi_port = port;
        self
    }

    /// Data-plane port. 0 picks a free port.
    pub fn waveform_port(mut self, port: u16) -> Self {
        self.waveform_port = port;
        self
    }

    /// Bound on a single receive call (default 3 s).
    pub fn capture_timeout(mut self, timeout: Duration) -> Self {
        self.settings.capture_timeout = timeout;
        self
    }

    /// Fallback re-check interval while disarmed (default 1 ms).
    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.settings.idle_poll_interval = interval;
        self
    }

    /// Entries kept in each session's SCPI error queue (default 32).
    pub fn error_queue_depth(mut self, depth: usize) -> Self {
        self.settings.error_queue_depth = depth;
        self
    }

    /// Use an existing token for shutdown instead of creating one.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Bind both listeners.
    pub async fn build(self, source: Arc<dyn CaptureSource>) -> Result<BridgeServer> {
        if self.settings.capture_timeout.is_zero() {
            return Err(Error::InvalidParameter("capture timeout must be positive".into()));
        }
        if self.settings.error_queue_depth == 0 {
            return Err(Error::InvalidParameter("error queue depth must be positive".into()));
        }

        let control = bind_listener(&self.bind_address, self.scpi_port).await?;
        let data = bind_listener(&self.bind_address, self.waveform_port).await?;

        let info = source.info();
        tracing::info!(
            make = info.make(),
            model = %info.model,
            serial = %info.serial,
            control = %control.local_addr().map_err(Error::Io)?,
            data = %data.local_addr().map_err(Error::Io)?,
            "Bridge listening"
        );

        Ok(BridgeServer {
            source,
            config: Arc::new(ConfigStore::default()),
            control,
            data: Arc::new(data),
            settings: self.settings,
            shutdown: self.shutdown.unwrap_or_else(CancellationToken::new),
        })
    }
}

impl Default for BridgeServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound bridge, ready to [`run`](BridgeServer::run).
pub struct BridgeServer {
    source: Arc<dyn CaptureSource>,
    config: Arc<ConfigStore>,
    control: TcpListener,
    data: Arc<TcpListener>,
    settings: SessionSettings,
    shutdown: CancellationToken,
}

impl BridgeServer {
    /// Address of the control-plane listener.
    pub fn control_addr(&self) -> Result<SocketAddr> {
        self.control.local_addr().map_err(Error::Io)
    }

    /// Address of the data-plane listener.
    pub fn data_addr(&self) -> Result<SocketAddr> {
        self.data.local_addr().map_err(Error::Io)
    }

    /// The device configuration shared by all sessions.
    pub fn config(&self) -> Arc<ConfigStore> {
        self.config.clone()
    }

    /// Cancelling this token ends the active session and then [`run`](Self::run).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept and serve control sessions until shutdown.
    pub async fn run(self) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    tracing::info!("Bridge shutting down");
                    return Ok(());
                }

                accepted = accept_client(&self.control) => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Control accept failed, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            let session = Session::new(
                self.source.clone(),
                self.config.clone(),
                self.data.clone(),
                self.settings,
            );
            // Errors are logged by the session itself.
            let _ = session.run(stream, peer, self.shutdown.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrbridge_core::capture::RecvResult;
    use sdrbridge_test_harness::{BridgeClient, MockCapture, Param};
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    struct Running {
        mock: Arc<MockCapture>,
        config: Arc<ConfigStore>,
        control: String,
        data: String,
        shutdown: CancellationToken,
        task: JoinHandle<Result<()>>,
    }

    impl Running {
        async fn start(mock: MockCapture) -> Self {
            let mock = Arc::new(mock);
            let server = BridgeServerBuilder::new()
                .bind_address("127.0.0.1")
                .scpi_port(0)
                .waveform_port(0)
                .capture_timeout(Duration::from_millis(100))
                .build(mock.clone())
                .await
                .unwrap();
            Running {
                mock,
                config: server.config(),
                control: server.control_addr().unwrap().to_string(),
                data: server.data_addr().unwrap().to_string(),
                shutdown: server.shutdown_token(),
                task: tokio::spawn(server.run()),
            }
        }

        async fn client(&self) -> BridgeClient {
            BridgeClient::connect(&self.control, &self.data).await.unwrap()
        }

        async fn stop(self) {
            self.shutdown.cancel();
            tokio::time::timeout(WAIT, self.task)
                .await
                .expect("server did not stop")
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn builder_defaults() {
        let b = BridgeServerBuilder::new();
        assert_eq!(b.bind_address, "0.0.0.0");
        assert_eq!(b.scpi_port, 5025);
        assert_eq!(b.waveform_port, 5026);
        assert_eq!(b.settings.capture_timeout, Duration::from_secs(3));
        assert_eq!(b.settings.idle_poll_interval, Duration::from_millis(1));
        assert_eq!(b.settings.error_queue_depth, 32);
    }

    #[tokio::test]
    async fn builder_rejects_zero_timeout() {
        let result = BridgeServerBuilder::new()
            .bind_address("127.0.0.1")
            .scpi_port(0)
            .waveform_port(0)
            .capture_timeout(Duration::ZERO)
            .build(Arc::new(MockCapture::new()))
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn identity_and_catalogs() {
        let r = Running::start(MockCapture::with_info("B210", "30AD2C5")).await;
        let mut client = r.client().await;

        assert_eq!(client.query("*IDN?").await.unwrap(), "Ettus Research,B210,30AD2C5,1.0");
        assert_eq!(client.query("CHANS?").await.unwrap(), "1");
        assert!(client.query("DEPTHS?").await.unwrap().starts_with("10000,20000,"));
        assert_eq!(client.query("SYST:ERR?").await.unwrap(), "0,\"No error\"");

        drop(client);
        r.stop().await;
    }

    #[tokio::test]
    async fn gain_clamped_by_receiver_keeps_request() {
        let r = Running::start(MockCapture::new()).await;
        r.mock.clamp(Param::Gain, 0.0, 20.0).await;
        let mut client = r.client().await;

        client.command("RXGAIN 20.5").await.unwrap();
        assert_eq!(client.query("RXGAIN?").await.unwrap(), "20.5");
        assert_eq!(r.config.snapshot().await.rx_gain_db, 20.5);
        assert_eq!(r.mock.applied(Param::Gain).await, 20.0);

        drop(client);
        r.stop().await;
    }

    #[tokio::test]
    async fn single_then_stop_delivers_one_block() {
        let r = Running::start(MockCapture::new()).await;
        r.mock.script_block(vec![RecvResult::ok(10)]).await;
        let mut client = r.client().await;

        client.command("DEPTH 10").await.unwrap();
        client.command("SINGLE").await.unwrap();
        client.command("STOP").await.unwrap();

        let frame = client.read_frame(WAIT).await.unwrap();
        assert_eq!(frame.sample_count(), 10);
        assert!(client.expect_no_frame(Duration::from_millis(100)).await.unwrap());
        assert_eq!(client.query("ARMED?").await.unwrap(), "0");

        drop(client);
        r.stop().await;
    }

    #[tokio::test]
    async fn malformed_command_is_queued_without_reply() {
        let r = Running::start(MockCapture::new()).await;
        let mut client = r.client().await;

        client.command("RXGAIN loud").await.unwrap();
        client.command("BOGUS 1").await.unwrap();
        assert_eq!(client.query("RXGAIN?").await.unwrap(), "0");
        assert!(client.query("SYST:ERR?").await.unwrap().starts_with("-104,"));
        assert!(client.query("SYST:ERR?").await.unwrap().starts_with("-100,"));

        drop(client);
        r.stop().await;
    }

    #[tokio::test]
    async fn sessions_are_served_in_turn() {
        let r = Running::start(MockCapture::new()).await;

        let mut first = r.client().await;
        first.command("DEPTH 50000").await.unwrap();
        assert_eq!(first.query("DEPTH?").await.unwrap(), "50000");
        drop(first);

        // Configuration outlives the session; flags do not.
        let mut second = r.client().await;
        assert_eq!(second.query("DEPTH?").await.unwrap(), "50000");
        assert_eq!(second.query("ARMED?").await.unwrap(), "0");

        drop(second);
        r.stop().await;
    }

    #[tokio::test]
    async fn survives_data_client_disconnect() {
        let r = Running::start(MockCapture::new()).await;
        let mut client = r.client().await;

        client.command("DEPTH 10000").await.unwrap();
        client.command("START").await.unwrap();
        client.read_frame(WAIT).await.unwrap();
        client.close_data();

        // Control plane keeps working after the worker exits.
        assert_eq!(client.query("DEPTH?").await.unwrap(), "10000");
        drop(client);

        let mut next = r.client().await;
        next.command("SINGLE").await.unwrap();
        assert_eq!(next.read_frame(WAIT).await.unwrap().sample_count(), 10_000);

        drop(next);
        r.stop().await;
    }
}
