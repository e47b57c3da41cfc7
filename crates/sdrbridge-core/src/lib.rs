//! sdrbridge-core: Core traits, types, wire framing and error definitions
//! for sdrbridge.
//!
//! This crate defines the backend-agnostic pieces shared by every other
//! sdrbridge crate: the receiver abstraction, the data-plane transport
//! abstraction, and the binary frame format clients decode.
//!
//! # Key types
//!
//! - [`CaptureSource`] -- tuning, configuration and blocking sample capture
//! - [`DataTransport`] -- write-only byte stream carrying waveform frames
//! - [`WaveformFrame`] -- one captured block and its wire encoding
//! - [`Error`] / [`Result`] -- error handling

pub mod capture;
pub mod error;
pub mod frame;
pub mod helpers;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use sdrbridge_core::*`.
pub use capture::{CaptureSource, RecvResult, RecvStatus};
pub use error::{Error, Result};
pub use frame::{DecodeResult, WaveformFrame, decode_frame, write_frame};
pub use helpers::{format_freq_mhz, format_rate_msps, parse_f64_arg, parse_u64_arg};
pub use transport::DataTransport;
pub use types::*;
