//! Capability traits and the control-plane session loop.
//!
//! A bridge device implements three capabilities:
//!
//! - [`Identify`] -- the `*IDN?` reply
//! - [`ChannelInfo`] -- channel count, channel naming, rate and depth catalogs
//! - [`CommandHandler`] -- acquisition control, channel/trigger setup, and
//!   any device-specific verbs
//!
//! [`dispatch`] maps the generic verbs every bridge client sends onto those
//! traits and offers anything else to [`CommandHandler::on_command`] /
//! [`CommandHandler::on_query`]. [`serve`] runs the per-connection read
//! loop on top of it.
//!
//! Mutating commands never produce a reply, even on failure; failures are
//! logged and pushed onto the session's [`ErrorQueue`], which clients may
//! drain with `SYST:ERR?`.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use sdrbridge_core::error::{Error, Result};
use sdrbridge_core::helpers::{parse_f64_arg, parse_u64_arg};

use crate::protocol::{self, ScpiLine};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Identification fields returned by `*IDN?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub make: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.make, self.model, self.serial, self.firmware
        )
    }
}

/// Who the instrument is.
pub trait Identify: Send + Sync {
    fn identity(&self) -> Identity;
}

/// Channel kinds a bridge can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Analog,
    Digital,
}

/// What channels and acquisition settings the instrument offers.
pub trait ChannelInfo: Send + Sync {
    /// Number of analog channels reported by `CHANS?`.
    fn analog_channel_count(&self) -> usize;

    /// Resolve a channel subject (`C1`, `CH2`, ...) to a zero-based index.
    ///
    /// Returns `None` if `subject` does not name a channel.
    fn channel_id(&self, subject: &str) -> Option<usize>;

    fn channel_type(&self, channel: usize) -> ChannelType;

    /// Sample rates reported by `RATES?`, ascending, in samples per second.
    fn sample_rates(&self) -> Vec<u64>;

    /// Block depths reported by `DEPTHS?`, ascending, in samples.
    fn sample_depths(&self) -> Vec<u64>;
}

/// How the instrument reacts to commands.
///
/// Every generic verb is a required method so each device family decides
/// explicitly what an unsupported setting means for it.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// `START` (`one_shot == false`) or `SINGLE` (`one_shot == true`).
    async fn acquisition_start(&self, one_shot: bool) -> Result<()>;

    /// `STOP`.
    async fn acquisition_stop(&self) -> Result<()>;

    /// `FORCE`.
    async fn acquisition_force_trigger(&self) -> Result<()>;

    /// Whether acquisition is currently armed (`ARMED?`).
    fn is_trigger_armed(&self) -> bool;

    /// `RATE <hz>`.
    async fn set_sample_rate(&self, rate_hz: u64) -> Result<()>;

    /// `DEPTH <samples>`.
    async fn set_sample_depth(&self, depth: u64) -> Result<()>;

    /// `<ch>:ON` / `<ch>:OFF`.
    async fn set_channel_enabled(&self, channel: usize, enabled: bool) -> Result<()>;

    /// `<ch>:COUP <coupling>`.
    async fn set_analog_coupling(&self, channel: usize, coupling: &str) -> Result<()>;

    /// `<ch>:RANGE <volts>`.
    async fn set_analog_range(&self, channel: usize, range_v: f64) -> Result<()>;

    /// `<ch>:OFFS <volts>`.
    async fn set_analog_offset(&self, channel: usize, offset_v: f64) -> Result<()>;

    /// `<ch>:THRESH <volts>`.
    async fn set_digital_threshold(&self, channel: usize, threshold_v: f64) -> Result<()>;

    /// `<ch>:HYS <volts>`.
    async fn set_digital_hysteresis(&self, channel: usize, hysteresis_v: f64) -> Result<()>;

    /// `TRIG:DELAY <fs>`.
    async fn set_trigger_delay(&self, delay_fs: u64) -> Result<()>;

    /// `TRIG:SOU <ch>`.
    async fn set_trigger_source(&self, channel: usize) -> Result<()>;

    /// `TRIG:LEV <volts>`.
    async fn set_trigger_level(&self, level_v: f64) -> Result<()>;

    /// `TRIG:MODE EDGE`.
    async fn set_trigger_type_edge(&self) -> Result<()>;

    /// `TRIG:EDGE:DIR <edge>`.
    async fn set_edge_trigger_edge(&self, edge: &str) -> Result<()>;

    /// Handle a command the generic layer does not know.
    ///
    /// Return `Ok(true)` if the device claimed it.
    async fn on_command(&self, line: &ScpiLine) -> Result<bool>;

    /// Handle a query the generic layer does not know.
    ///
    /// Return `Ok(Some(reply))` if the device claimed it.
    async fn on_query(&self, line: &ScpiLine) -> Result<Option<String>>;
}

/// A complete bridge device: identity, channel info and command handling.
pub trait ScpiDevice: Identify + ChannelInfo + CommandHandler {}
impl<T: Identify + ChannelInfo + CommandHandler> ScpiDevice for T {}

// ---------------------------------------------------------------------------
// Error queue
// ---------------------------------------------------------------------------

/// Standard SCPI error codes used by the bridge.
pub mod codes {
    pub const NO_ERROR: i32 = 0;
    pub const COMMAND_ERROR: i32 = -100;
    pub const DATA_TYPE_ERROR: i32 = -104;
    pub const MISSING_PARAMETER: i32 = -109;
    pub const DATA_OUT_OF_RANGE: i32 = -222;
    pub const DEVICE_ERROR: i32 = -300;
    pub const QUEUE_OVERFLOW: i32 = -350;
}

/// One entry in the error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiError {
    pub code: i32,
    pub message: String,
}

impl ScpiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        ScpiError {
            code,
            message: message.into(),
        }
    }

    /// Classify a bridge error for the queue.
    pub fn from_error(err: &Error) -> Self {
        let code = match err {
            Error::Parse(_) => codes::DATA_TYPE_ERROR,
            Error::MissingArgument(_) => codes::MISSING_PARAMETER,
            Error::InvalidParameter(_) => codes::DATA_OUT_OF_RANGE,
            _ => codes::DEVICE_ERROR,
        };
        ScpiError::new(code, err.to_string())
    }
}

impl fmt::Display for ScpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Quotes inside the message would break the string field.
        write!(f, "{},\"{}\"", self.code, self.message.replace('"', "'"))
    }
}

/// Default number of errors retained per session.
pub const DEFAULT_ERROR_QUEUE_DEPTH: usize = 32;

/// Bounded FIFO of command errors for one control session.
///
/// When full, the newest entry is replaced by a queue-overflow marker, as
/// SCPI-99 prescribes.
#[derive(Debug)]
pub struct ErrorQueue {
    entries: VecDeque<ScpiError>,
    depth: usize,
}

impl ErrorQueue {
    pub fn new(depth: usize) -> Self {
        ErrorQueue {
            entries: VecDeque::with_capacity(depth),
            depth: depth.max(1),
        }
    }

    pub fn push(&mut self, err: ScpiError) {
        if self.entries.len() < self.depth {
            self.entries.push_back(err);
        } else if let Some(last) = self.entries.back_mut() {
            *last = ScpiError::new(codes::QUEUE_OVERFLOW, "Queue overflow");
        }
    }

    /// Pop the oldest error, or the "No error" entry if empty.
    pub fn pop(&mut self) -> ScpiError {
        self.entries
            .pop_front()
            .unwrap_or_else(|| ScpiError::new(codes::NO_ERROR, "No error"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ErrorQueue {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_QUEUE_DEPTH)
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Handle one tokenized line. Returns the reply to send, if any.
pub async fn dispatch<D: ScpiDevice + ?Sized>(
    device: &D,
    errors: &mut ErrorQueue,
    line: &ScpiLine,
) -> Option<String> {
    if line.query {
        match dispatch_query(device, errors, line).await {
            Ok(Some(reply)) => Some(reply),
            Ok(None) => {
                tracing::debug!(line = %line, "Unrecognized query received");
                errors.push(ScpiError::new(
                    codes::COMMAND_ERROR,
                    format!("Unrecognized query: {}", line),
                ));
                None
            }
            Err(e) => {
                tracing::warn!(line = %line, error = %e, "Query failed");
                errors.push(ScpiError::from_error(&e));
                None
            }
        }
    } else {
        match dispatch_command(device, line).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(line = %line, "Unrecognized command");
                errors.push(ScpiError::new(
                    codes::COMMAND_ERROR,
                    format!("Unrecognized command: {}", line),
                ));
            }
            Err(e) => {
                tracing::error!(line = %line, error = %e, "Command failed");
                errors.push(ScpiError::from_error(&e));
            }
        }
        None
    }
}

async fn dispatch_query<D: ScpiDevice + ?Sized>(
    device: &D,
    errors: &mut ErrorQueue,
    line: &ScpiLine,
) -> Result<Option<String>> {
    if line.has_subject("SYST") && line.command == "ERR" {
        return Ok(Some(errors.pop().to_string()));
    }
    if line.subject.is_some() {
        return device.on_query(line).await;
    }

    let reply = match line.command.as_str() {
        "*IDN" => device.identity().to_string(),
        "CHANS" => device.analog_channel_count().to_string(),
        "RATES" => protocol::format_list(&device.sample_rates()),
        "DEPTHS" => protocol::format_list(&device.sample_depths()),
        "ARMED" => u8::from(device.is_trigger_armed()).to_string(),
        _ => return device.on_query(line).await,
    };
    Ok(Some(reply))
}

async fn dispatch_command<D: ScpiDevice + ?Sized>(device: &D, line: &ScpiLine) -> Result<bool> {
    match line.subject.as_deref() {
        None => match line.command.as_str() {
            "START" => device.acquisition_start(false).await?,
            "SINGLE" => device.acquisition_start(true).await?,
            "FORCE" => device.acquisition_force_trigger().await?,
            "STOP" => device.acquisition_stop().await?,
            "RATE" => device.set_sample_rate(parse_u64_arg(required_arg(line)?)?).await?,
            "DEPTH" => device.set_sample_depth(parse_u64_arg(required_arg(line)?)?).await?,
            _ => return device.on_command(line).await,
        },

        Some("TRIG") => match line.command.as_str() {
            "MODE" => {
                let mode = required_arg(line)?;
                if mode.eq_ignore_ascii_case("EDGE") {
                    device.set_trigger_type_edge().await?;
                } else {
                    tracing::debug!(mode, "ignoring unsupported trigger mode");
                }
            }
            "SOU" => {
                let subject = required_arg(line)?;
                let channel = device.channel_id(&subject.to_ascii_uppercase()).ok_or_else(|| {
                    Error::InvalidParameter(format!("unknown channel '{}'", subject))
                })?;
                device.set_trigger_source(channel).await?;
            }
            "LEV" => device.set_trigger_level(parse_f64_arg(required_arg(line)?)?).await?,
            "DELAY" => device.set_trigger_delay(parse_u64_arg(required_arg(line)?)?).await?,
            _ => accept_unsupported(device, line).await?,
        },

        Some("TRIG:EDGE") if line.command == "DIR" => {
            device.set_edge_trigger_edge(required_arg(line)?).await?
        }
        Some("TRIG:EDGE") => accept_unsupported(device, line).await?,

        Some(subject) => {
            let Some(channel) = device.channel_id(subject) else {
                return device.on_command(line).await;
            };
            match line.command.as_str() {
                "ON" => device.set_channel_enabled(channel, true).await?,
                "OFF" => device.set_channel_enabled(channel, false).await?,
                "COUP" => device.set_analog_coupling(channel, required_arg(line)?).await?,
                "RANGE" => {
                    device
                        .set_analog_range(channel, parse_f64_arg(required_arg(line)?)?)
                        .await?
                }
                "OFFS" => {
                    device
                        .set_analog_offset(channel, parse_f64_arg(required_arg(line)?)?)
                        .await?
                }
                "THRESH" => {
                    device
                        .set_digital_threshold(channel, parse_f64_arg(required_arg(line)?)?)
                        .await?
                }
                "HYS" => {
                    device
                        .set_digital_hysteresis(channel, parse_f64_arg(required_arg(line)?)?)
                        .await?
                }
                _ => accept_unsupported(device, line).await?,
            }
        }
    }
    Ok(true)
}

/// Trigger and channel settings the device does not claim are accepted
/// and ignored, so generic clients can configure them without errors.
async fn accept_unsupported<D: ScpiDevice + ?Sized>(device: &D, line: &ScpiLine) -> Result<()> {
    if !device.on_command(line).await? {
        tracing::debug!(line = %line, "ignoring unsupported setting");
    }
    Ok(())
}

/// The first argument of `line`, or [`Error::MissingArgument`].
pub fn required_arg(line: &ScpiLine) -> Result<&str> {
    line.arg()
        .ok_or_else(|| Error::MissingArgument(format!("{} requires an argument", line.command)))
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

/// Lines longer than this, terminator included, are discarded unparsed.
///
/// The bound holds while reading: bytes past it are dropped up to the next
/// terminator instead of being buffered.
pub const MAX_LINE_LEN: usize = 4096;

/// Outcome of one [`read_line_bounded`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    /// End of input with nothing buffered.
    Eof,
    /// A line (possibly unterminated at end of input) is in the buffer.
    Line,
    /// The line exceeded [`MAX_LINE_LEN`] and was dropped.
    TooLong,
}

/// Read one terminated line into `buf`, never holding more than
/// [`MAX_LINE_LEN`] bytes.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut too_long = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if too_long {
                LineRead::TooLong
            } else if buf.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line
            });
        }

        let (chunk, terminated) = match available.iter().position(|&b| b == protocol::TERMINATOR) {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        let used = chunk.len();
        if !too_long {
            if buf.len() + used > MAX_LINE_LEN {
                too_long = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if terminated {
            return Ok(if too_long { LineRead::TooLong } else { LineRead::Line });
        }
    }
}

/// Run one control session until the client disconnects or `cancel` fires.
///
/// Reads newline-terminated lines from `reader`, dispatches them against
/// `device`, and writes each query reply followed by `\n` to `writer`.
/// Returns `Ok(())` on a clean disconnect; a socket failure is returned as
/// an error so the caller can log it, but is otherwise equivalent.
pub async fn serve<D, R, W>(
    device: &D,
    mut reader: R,
    mut writer: W,
    errors: &mut ErrorQueue,
    cancel: CancellationToken,
) -> Result<()>
where
    D: ScpiDevice + ?Sized,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(256);

    loop {
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("control session cancelled");
                return Ok(());
            }

            read = read_line_bounded(&mut reader, &mut buf) => read,
        };

        match read.map_err(Error::Io)? {
            LineRead::Eof => {
                tracing::debug!("control client disconnected");
                return Ok(());
            }
            LineRead::TooLong => {
                tracing::warn!(max = MAX_LINE_LEN, "discarding oversized control line");
                errors.push(ScpiError::new(codes::COMMAND_ERROR, "Line too long"));
                continue;
            }
            LineRead::Line => {}
        }

        let Ok(text) = std::str::from_utf8(&buf) else {
            tracing::warn!("discarding non-UTF-8 control line");
            errors.push(ScpiError::new(codes::COMMAND_ERROR, "Invalid character data"));
            continue;
        };
        let Some(line) = protocol::parse_line(text) else {
            continue;
        };
        tracing::trace!(line = %line, "control line");

        if let Some(reply) = dispatch(device, errors, &line).await {
            tracing::trace!(reply = %reply, "control reply");
            writer.write_all(reply.as_bytes()).await?;
            writer.write_all(&[protocol::TERMINATOR]).await?;
            writer.flush().await?;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
