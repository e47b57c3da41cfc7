//! Error types for sdrbridge.
//!
//! All fallible operations across the bridge return [`Result<T>`], which
//! uses [`Error`] as the error type. Command parsing, capture-source,
//! and transport failures are all captured here.

/// The error type for all sdrbridge operations.
///
/// The variants follow the bridge's recovery rules: [`Parse`](Error::Parse),
/// [`MissingArgument`](Error::MissingArgument) and [`Device`](Error::Device)
/// are recovered inside the control session,
/// [`CaptureTimeout`](Error::CaptureTimeout) and
/// [`CaptureOverflow`](Error::CaptureOverflow) end a block early, and the
/// transport variants end the owning connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A command argument could not be parsed (e.g. `RXGAIN abc`).
    ///
    /// The command is rejected with no state mutation.
    #[error("parse error: {0}")]
    Parse(String),

    /// A command that takes an argument arrived without one.
    #[error("missing argument: {0}")]
    MissingArgument(String),

    /// The capture source rejected a configuration value.
    #[error("device error: {0}")]
    Device(String),

    /// The capture source did not deliver samples within the receive timeout.
    #[error("capture timed out")]
    CaptureTimeout,

    /// The capture source dropped samples because the host fell behind.
    #[error("capture overflow")]
    CaptureOverflow,

    /// A transport-level error (listen, accept, socket write).
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the connection or the socket broke mid-write.
    #[error("connection lost")]
    ConnectionLost,

    /// The transport has been closed or was never connected.
    #[error("not connected")]
    NotConnected,

    /// The requested operation is not supported by this capture backend.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An argument was well-formed but outside the accepted range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error terminates the owning connection.
    ///
    /// Configuration and capture errors are recovered locally; only
    /// transport failures end a session or streaming worker.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectionLost | Error::NotConnected | Error::Io(_)
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_parse() {
        let e = Error::Parse("'abc' is not a number".into());
        assert_eq!(e.to_string(), "parse error: 'abc' is not a number");
    }

    #[test]
    fn error_display_missing_argument() {
        let e = Error::MissingArgument("RXGAIN requires an argument".into());
        assert_eq!(e.to_string(), "missing argument: RXGAIN requires an argument");
        assert!(!e.is_transport());
    }

    #[test]
    fn error_display_device() {
        let e = Error::Device("gain out of range".into());
        assert_eq!(e.to_string(), "device error: gain out of range");
    }

    #[test]
    fn error_display_capture() {
        assert_eq!(Error::CaptureTimeout.to_string(), "capture timed out");
        assert_eq!(Error::CaptureOverflow.to_string(), "capture overflow");
    }

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("address in use".into());
        assert_eq!(e.to_string(), "transport error: address in use");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn transport_classification() {
        assert!(Error::ConnectionLost.is_transport());
        assert!(Error::NotConnected.is_transport());
        assert!(Error::Transport("x".into()).is_transport());
        assert!(!Error::Parse("x".into()).is_transport());
        assert!(!Error::Device("x".into()).is_transport());
        assert!(!Error::CaptureTimeout.is_transport());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
