//! sdrbridge-capture: capture-source backends for sdrbridge.
//!
//! - [`sim`] -- a simulated receiver producing a tone plus noise, always
//!   available
//! - `uhd` -- Ettus/Microphase receivers over the UHD C API, behind the
//!   `uhd` cargo feature
//! - [`device`] -- `--device` string parsing and backend selection
//!
//! # Example
//!
//! ```
//! # async fn example() -> sdrbridge_core::Result<()> {
//! let source = sdrbridge_capture::open("sim:rate=2e6").await?;
//! assert_eq!(source.info().model, "SIM");
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod sim;
#[cfg(feature = "uhd")]
pub mod uhd;

pub use device::{DeviceArgs, DeviceSpec, open};
pub use sim::{SimConfig, SimulatedSource};
#[cfg(feature = "uhd")]
pub use uhd::UhdSource;
