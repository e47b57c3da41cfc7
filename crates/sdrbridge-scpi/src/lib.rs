//! Line-oriented SCPI server framework for instrument bridges.
//!
//! A bridge exposes some piece of hardware to a host application as if it
//! were a networked bench instrument. This crate holds everything that is
//! not specific to the hardware:
//!
//! - [`protocol`] -- line tokenizer and list formatting
//! - [`server`] -- capability traits, generic verb dispatch, the
//!   `SYST:ERR?` error queue, and the per-connection read loop
//!
//! A device implements [`Identify`], [`ChannelInfo`] and
//! [`CommandHandler`] and is then usable wherever a [`ScpiDevice`] is
//! expected.

pub mod protocol;
pub mod server;

pub use protocol::{ScpiLine, format_list, parse_line};
pub use server::{
    ChannelInfo, ChannelType, CommandHandler, ErrorQueue, Identify, Identity, ScpiDevice,
    ScpiError, dispatch, serve,
};
