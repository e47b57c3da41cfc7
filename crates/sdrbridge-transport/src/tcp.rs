//! TCP plumbing for both bridge planes.
//!
//! This module provides the listener helpers shared by the control and
//! data planes, and [`TcpDataTransport`], which implements the
//! [`DataTransport`] trait for the binary waveform stream.
//!
//! # Example
//!
//! ```no_run
//! use sdrbridge_transport::{TcpDataTransport, accept_client, bind_listener};
//! use sdrbridge_core::transport::DataTransport;
//!
//! # async fn example() -> sdrbridge_core::Result<()> {
//! let listener = bind_listener("0.0.0.0", 5026).await?;
//! let (stream, peer) = accept_client(&listener).await?;
//! let mut transport = TcpDataTransport::from_stream(stream, peer.to_string());
//! transport.send(&[0u8; 16]).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sdrbridge_core::error::{Error, Result};
use sdrbridge_core::transport::DataTransport;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Bind a TCP listener on `bind_addr:port`.
///
/// Pass port 0 to let the OS pick a free port (used by tests); the chosen
/// address is available from [`TcpListener::local_addr`].
pub async fn bind_listener(bind_addr: &str, port: u16) -> Result<TcpListener> {
    let addr = format_bind_addr(bind_addr, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind listener");
        Error::Transport(format!("failed to bind {}: {}", addr, e))
    })?;

    let local = listener.local_addr().map_err(Error::Io)?;
    tracing::debug!(addr = %local, "Listening");
    Ok(listener)
}

/// Accept one client and disable Nagle's algorithm on it.
///
/// Both planes carry latency-sensitive traffic: short SCPI lines on the
/// control plane, and frame headers that should not wait behind a partial
/// segment on the data plane. Failure to set `TCP_NODELAY` is logged and
/// otherwise ignored.
pub async fn accept_client(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    let (stream, peer) = listener.accept().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to accept connection");
        Error::Transport(format!("accept failed: {}", e))
    })?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(
            peer = %peer,
            error = %e,
            "Failed to disable Nagle on socket, performance may be poor"
        );
    }

    tracing::info!(peer = %peer, "Client connected");
    Ok((stream, peer))
}

/// Join a bind address and port, bracketing bare IPv6 literals.
fn format_bind_addr(bind_addr: &str, port: u16) -> String {
    if bind_addr.contains(':') && !bind_addr.starts_with('[') {
        format!("[{}]:{}", bind_addr, port)
    } else {
        format!("{}:{}", bind_addr, port)
    }
}

/// TCP transport for the waveform data plane.
///
/// Wraps an accepted `TcpStream`. Every [`send`](DataTransport::send)
/// writes and flushes the full buffer before returning.
#[derive(Debug)]
pub struct TcpDataTransport {
    /// The underlying TCP stream, `None` after `close()` is called.
    stream: Option<TcpStream>,
    /// The peer address string for logging.
    addr: String,
}

impl TcpDataTransport {
    /// Wrap an already-accepted `TcpStream`.
    pub fn from_stream(stream: TcpStream, addr: String) -> Self {
        tracing::debug!(addr = %addr, "Wrapping data-plane stream");
        Self {
            stream: Some(stream),
            addr,
        }
    }

    /// Get the peer address string.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl DataTransport for TcpDataTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(addr = %self.addr, bytes = data.len(), "Sending data");

        stream.write_all(data).await.map_err(|e| {
            tracing::debug!(addr = %self.addr, error = %e, "Failed to send data");
            map_io_error(e)
        })?;

        stream.flush().await.map_err(|e| {
            tracing::debug!(addr = %self.addr, error = %e, "Failed to flush TCP stream");
            map_io_error(e)
        })?;

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(addr = %self.addr, "Closing data-plane connection");

            if let Err(e) = stream.shutdown().await {
                tracing::warn!(
                    addr = %self.addr,
                    error = %e,
                    "Failed to shutdown TCP stream (continuing anyway)"
                );
            }
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for TcpDataTransport {
    fn drop(&mut self) {
        if self.stream.is_some() {
            tracing::debug!(addr = %self.addr, "TcpDataTransport dropped, closing connection");
        }
    }
}

/// Map a data-path I/O error to the appropriate [`Error`] variant.
pub fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Helper: bind a listener on a random port and return its address.
    async fn test_listener() -> (TcpListener, SocketAddr) {
        let listener = bind_listener("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn bind_addr_formatting() {
        assert_eq!(format_bind_addr("0.0.0.0", 5025), "0.0.0.0:5025");
        assert_eq!(format_bind_addr("::", 5026), "[::]:5026");
        assert_eq!(format_bind_addr("[::1]", 1), "[::1]:1");
    }

    #[tokio::test]
    async fn bind_conflict_is_transport_error() {
        let (_listener, addr) = test_listener().await;
        let err = bind_listener("127.0.0.1", addr.port()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn accept_and_send() {
        let (listener, addr) = test_listener().await;

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut buf = vec![0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (stream, peer) = accept_client(&listener).await.unwrap();
        assert!(stream.nodelay().unwrap());

        let mut transport = TcpDataTransport::from_stream(stream, peer.to_string());
        assert!(transport.is_connected());
        assert_eq!(transport.addr(), peer.to_string());
        transport.send(b"hello").await.unwrap();

        assert_eq!(client.await.unwrap(), b"hello");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_returns_not_connected() {
        let (listener, addr) = test_listener().await;
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (stream, peer) = accept_client(&listener).await.unwrap();
        let _client_stream = client.await.unwrap();

        let mut transport = TcpDataTransport::from_stream(stream, peer.to_string());
        transport.close().await.unwrap();
        assert!(!transport.is_connected());

        let result = transport.send(b"should fail").await;
        assert!(matches!(result, Err(Error::NotConnected)));

        // Closing again is a no-op.
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn peer_disconnect_is_detected_on_send() {
        let (listener, addr) = test_listener().await;
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (stream, peer) = accept_client(&listener).await.unwrap();
        drop(client.await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut transport = TcpDataTransport::from_stream(stream, peer.to_string());

        // The first write may be buffered by the kernel; keep writing until
        // the reset surfaces.
        let chunk = vec![0u8; 64 * 1024];
        let mut result = Ok(());
        for _ in 0..100 {
            result = transport.send(&chunk).await;
            if result.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let err = result.unwrap_err();
        assert!(err.is_transport(), "expected transport error, got {err:?}");
    }

    #[test]
    fn io_error_mapping() {
        use std::io::{Error as IoError, ErrorKind};
        assert!(matches!(
            map_io_error(IoError::new(ErrorKind::BrokenPipe, "x")),
            Error::ConnectionLost
        ));
        assert!(matches!(
            map_io_error(IoError::new(ErrorKind::ConnectionReset, "x")),
            Error::ConnectionLost
        ));
        assert!(matches!(
            map_io_error(IoError::new(ErrorKind::Other, "x")),
            Error::Io(_)
        ));
    }
}
