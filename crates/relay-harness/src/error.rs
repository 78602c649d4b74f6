use std::fmt;
use std::time::Duration;

use crate::endpoint::Flow;

/// Result alias used across the harness.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Misuse of an endpoint's half-duplex state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// `shutdown` on a flow that is no longer open.
    FlowAlreadyClosed(Flow),
    /// `send` after the write side was shut down.
    ClosedWriteSide,
    /// `consume` after the read side was shut down.
    ClosedReadSide,
    /// Any I/O after both flows were shut down and the socket was closed.
    SocketClosed,
    /// Data I/O on a listening endpoint that has not accepted yet.
    NotConnected,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::FlowAlreadyClosed(flow) => write!(f, "{} flow is already closed", flow),
            Violation::ClosedWriteSide => write!(f, "write side is shut down"),
            Violation::ClosedReadSide => write!(f, "read side is shut down"),
            Violation::SocketClosed => write!(f, "socket is closed"),
            Violation::NotConnected => write!(f, "endpoint is listening, no peer accepted yet"),
        }
    }
}

/// Errors raised by the harness itself.
///
/// Transfer outcomes (lost, duplicated or corrupted bytes) are not errors;
/// see [`crate::verify::Verdict`].
#[derive(Debug)]
pub enum HarnessError {
    /// Invalid construction parameters, e.g. an endpoint with zero or both
    /// of listen/connect targets.
    Configuration(String),

    /// `accept` called on a connect-mode endpoint.
    NotListening,

    /// The test drove an endpoint through an invalid transition.
    ProtocolViolation(Violation),

    /// A tracked process did not exit within its wait window.
    Timeout { process: String, after: Duration },

    /// Endpoint I/O made no progress within its window, e.g. a peer close
    /// the relay never passed on.
    Stalled { what: String, after: Duration },

    /// Draining a process whose standard output is not piped to us.
    NoOutputStream { process: String },

    /// Underlying socket or process I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            HarnessError::NotListening => write!(f, "accept called on a connect-mode endpoint"),
            HarnessError::ProtocolViolation(v) => write!(f, "protocol violation: {}", v),
            HarnessError::Timeout { process, after } => {
                write!(f, "process '{}' did not exit within {:?}", process, after)
            }
            HarnessError::Stalled { what, after } => {
                write!(f, "{} stalled for {:?}", what, after)
            }
            HarnessError::NoOutputStream { process } => {
                write!(f, "process '{}' has no piped output stream", process)
            }
            HarnessError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(e: std::io::Error) -> Self {
        HarnessError::Io(e)
    }
}

impl From<Violation> for HarnessError {
    fn from(v: Violation) -> Self {
        HarnessError::ProtocolViolation(v)
    }
}
