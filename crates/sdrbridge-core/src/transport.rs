//! Data-plane transport trait.
//!
//! The [`DataTransport`] trait abstracts over the byte stream that carries
//! waveform frames to the client. The TCP implementation lives in
//! `sdrbridge-transport`; `MockDataTransport` in `sdrbridge-test-harness`
//! records frames for deterministic tests of the streaming loop.

use async_trait::async_trait;

use crate::error::Result;

/// Asynchronous, write-only byte transport for waveform frames.
#[async_trait]
pub trait DataTransport: Send {
    /// Send raw bytes to the client.
    ///
    /// Implementations should not return until all bytes have been handed
    /// to the underlying socket. A peer that has gone away is reported as
    /// [`Error::ConnectionLost`](crate::error::Error::ConnectionLost).
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` calls should return
    /// [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
