//! sdrbridge: expose a software-defined radio receiver over two TCP planes.
//!
//! The **control plane** speaks line-oriented SCPI: clients tune the
//! receiver, set the block depth and sample rate, and arm acquisition. The
//! **data plane** carries the captured blocks as binary frames (see
//! [`sdrbridge_core::frame`]).
//!
//! Each control connection becomes a session with its own acquisition
//! flags and one streaming worker. Device configuration outlives sessions
//! and is owned by the [`BridgeServer`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sdrbridge::BridgeServerBuilder;
//! use sdrbridge_test_harness::MockCapture;
//!
//! # async fn example() -> sdrbridge_core::Result<()> {
//! let server = BridgeServerBuilder::new()
//!     .build(Arc::new(MockCapture::new()))
//!     .await?;
//! println!("control on {}", server.control_addr()?);
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod device;
pub mod flags;
pub mod server;
pub mod session;
pub mod streaming;

pub use config::{BlockParams, ConfigStore, DeviceConfig};
pub use device::SdrDevice;
pub use flags::{AcquisitionFlags, ArmState};
pub use server::{BridgeServer, BridgeServerBuilder};
pub use session::{Session, SessionSettings};
pub use streaming::{StreamState, StreamingWorker};
