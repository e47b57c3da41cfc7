//! TCP client speaking both bridge planes.
//!
//! [`BridgeClient`] plays the role of the host application in end-to-end
//! tests: it connects to the control port, then to the waveform port, sends
//! SCPI lines and reads back replies and frames.
//!
//! # Example
//!
//! ```no_run
//! use sdrbridge_test_harness::BridgeClient;
//! use std::time::Duration;
//!
//! # async fn example() -> sdrbridge_core::Result<()> {
//! let mut client = BridgeClient::connect("127.0.0.1:5025", "127.0.0.1:5026").await?;
//! client.command("DEPTH 10000").await?;
//! client.command("SINGLE").await?;
//! let frame = client.read_frame(Duration::from_secs(5)).await?;
//! assert_eq!(frame.sample_count(), 10_000);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use sdrbridge_core::error::{Error, Result};
use sdrbridge_core::frame::{DecodeResult, HEADER_LEN, WaveformFrame, decode_frame};

/// Default time to wait for a query reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// A client connected to a running bridge.
pub struct BridgeClient {
    control_reader: BufReader<OwnedReadHalf>,
    control_writer: OwnedWriteHalf,
    data: Option<TcpStream>,
}

impl BridgeClient {
    /// Connect to the control plane, then the data plane.
    pub async fn connect(control_addr: &str, data_addr: &str) -> Result<Self> {
        let mut client = Self::connect_control(control_addr).await?;
        let data = TcpStream::connect(data_addr)
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {}: {}", data_addr, e)))?;
        client.data = Some(data);
        Ok(client)
    }

    /// Connect to the control plane only.
    pub async fn connect_control(control_addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(control_addr).await.map_err(|e| {
            Error::Transport(format!("failed to connect to {}: {}", control_addr, e))
        })?;
        let (reader, writer) = stream.into_split();
        Ok(BridgeClient {
            control_reader: BufReader::new(reader),
            control_writer: writer,
            data: None,
        })
    }

    /// Send a line that expects no reply.
    pub async fn command(&mut self, line: &str) -> Result<()> {
        self.control_writer.write_all(line.as_bytes()).await?;
        self.control_writer.write_all(b"\n").await?;
        self.control_writer.flush().await?;
        Ok(())
    }

    /// Send a query and return its reply without the trailing newline.
    pub async fn query(&mut self, line: &str) -> Result<String> {
        self.command(line).await?;
        self.read_reply(REPLY_TIMEOUT).await
    }

    /// Read one reply line from the control plane.
    pub async fn read_reply(&mut self, timeout: Duration) -> Result<String> {
        let mut reply = String::new();
        let n = tokio::time::timeout(timeout, self.control_reader.read_line(&mut reply))
            .await
            .map_err(|_| Error::Transport("timed out waiting for reply".into()))??;
        if n == 0 {
            return Err(Error::ConnectionLost);
        }
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read the next frame from the data plane.
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<WaveformFrame> {
        let data = self.data.as_mut().ok_or(Error::NotConnected)?;
        tokio::time::timeout(timeout, read_frame_from(data))
            .await
            .map_err(|_| Error::Transport("timed out waiting for frame".into()))?
    }

    /// Check that no frame bytes arrive within `window`.
    pub async fn expect_no_frame(&mut self, window: Duration) -> Result<bool> {
        let data = self.data.as_mut().ok_or(Error::NotConnected)?;
        let mut byte = [0u8; 1];
        match tokio::time::timeout(window, data.peek(&mut byte)).await {
            Err(_) => Ok(true),
            Ok(Ok(0)) => Err(Error::ConnectionLost),
            Ok(Ok(_)) => Ok(false),
            Ok(Err(e)) => Err(Error::Io(e)),
        }
    }

    /// Drop the data-plane connection, keeping the control plane open.
    pub fn close_data(&mut self) {
        self.data = None;
    }
}

async fn read_frame_from(stream: &mut TcpStream) -> Result<WaveformFrame> {
    let mut buf = vec![0u8; HEADER_LEN];
    read_exact(stream, &mut buf).await?;

    match decode_frame(&buf) {
        DecodeResult::Frame { frame, .. } => Ok(frame),
        DecodeResult::Incomplete { needed: Some(total) } => {
            buf.resize(total, 0);
            read_exact(stream, &mut buf[HEADER_LEN..]).await?;
            match decode_frame(&buf) {
                DecodeResult::Frame { frame, .. } => Ok(frame),
                DecodeResult::Incomplete { .. } => {
                    Err(Error::Transport("frame payload did not decode".into()))
                }
            }
        }
        DecodeResult::Incomplete { needed: None } => {
            Err(Error::Transport("frame header did not decode".into()))
        }
    }
}

async fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost,
        _ => Error::Io(e),
    })?;
    Ok(())
}
