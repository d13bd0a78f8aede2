//! Error kinds shared across the runtime.
//!
//! Local failures never leak raw transport errors to user code; they are
//! wrapped in one of the kinds below. `Error` is `Clone` because a payload's
//! completion cause can be observed by any number of readers.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Failure cause for invocations, dispatches, and payload operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// Underlying I/O or framing broke. Fails the invocation and closes the
    /// connection.
    Transport(Arc<io::Error>),
    /// A decoded header violated the protocol. Same propagation as
    /// [`Error::Transport`].
    Protocol(String),
    /// Peer or local shutdown raced the operation.
    ConnectionClosed,
    /// A handler failed. Encoded into a failure response rather than closing
    /// the connection.
    Dispatch(DispatchException),
    /// Malformed body or too-deep graph.
    InvalidData(String),
    /// The caller, the deadline, or a shutdown cancelled the operation.
    Cancelled,
    /// A fields encoder failed, the path was invalid, or a payload writer
    /// misbehaved. Fails locally before anything reaches the wire.
    InvalidArgument(String),
    /// The connection was disposed while the operation was pending.
    Disposed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport failure: {e}"),
            Error::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Dispatch(e) => write!(f, "dispatch failed: {e}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Disposed => write!(f, "connection disposed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e.as_ref()),
            Error::Dispatch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(Arc::new(e))
    }
}

impl From<DispatchException> for Error {
    fn from(e: DispatchException) -> Self {
        Error::Dispatch(e)
    }
}

impl Error {
    /// Shorthand for a transport error built from a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(Arc::new(io::Error::other(msg.into())))
    }
}

/// Error code surfaced to the peer when a dispatch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatchErrorCode {
    ServiceNotFound = 1,
    OperationNotFound = 2,
    InvalidData = 3,
    UnhandledException = 4,
    Cancelled = 5,
}

impl DispatchErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ServiceNotFound),
            2 => Some(Self::OperationNotFound),
            3 => Some(Self::InvalidData),
            4 => Some(Self::UnhandledException),
            5 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ServiceNotFound => "service not found",
            Self::OperationNotFound => "operation not found",
            Self::InvalidData => "invalid data",
            Self::UnhandledException => "unhandled exception",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A dispatch failure carried back to the caller in a failure response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchException {
    pub code: DispatchErrorCode,
    pub message: String,
}

impl DispatchException {
    pub fn new(code: DispatchErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Map an arbitrary dispatch error onto the code surfaced to the peer.
    ///
    /// Handler failures that are already dispatch exceptions keep their code;
    /// invalid-data failures map to [`DispatchErrorCode::InvalidData`];
    /// cancellation maps to [`DispatchErrorCode::Cancelled`]; everything else
    /// is an unhandled exception.
    pub fn from_error(error: Error) -> Self {
        match error {
            Error::Dispatch(e) => e,
            Error::InvalidData(msg) => Self::new(DispatchErrorCode::InvalidData, msg),
            Error::Cancelled => Self::new(DispatchErrorCode::Cancelled, "dispatch cancelled"),
            other => Self::new(DispatchErrorCode::UnhandledException, other.to_string()),
        }
    }
}

impl fmt::Display for DispatchException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for DispatchException {}
