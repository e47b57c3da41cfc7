//! sdrbridge-test-harness: Test utilities, mock capture sources, and mock
//! transports for sdrbridge.
//!
//! This crate provides [`MockCapture`] for deterministic testing of the
//! streaming loop and control session without radio hardware,
//! [`MockDataTransport`] for inspecting the frames a worker writes, and
//! [`BridgeClient`] for end-to-end tests against a running server.

pub mod client;
pub mod mock_capture;
pub mod mock_data;

pub use client::BridgeClient;
pub use mock_capture::{MockCapture, Param};
pub use mock_data::MockDataTransport;
