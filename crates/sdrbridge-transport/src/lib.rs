//! Transport implementations for sdrbridge.
//!
//! The bridge listens on two TCP ports: the control plane, which carries
//! SCPI text, and the data plane, which carries binary waveform frames.
//! This crate provides the listener helpers for both and the concrete
//! [`DataTransport`](sdrbridge_core::DataTransport) for the data plane:
//!
//! - [`bind_listener`] / [`accept_client`]: bind, accept, disable Nagle
//! - [`TcpDataTransport`]: write-only frame stream to one client

pub mod tcp;

pub use tcp::{TcpDataTransport, accept_client, bind_listener, map_io_error};
