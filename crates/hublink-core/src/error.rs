//! Error types shared across the engine.

use core::fmt;

/// Transport-level errors.
///
/// Everything below the framing layer: connect failures, socket I/O, and the
/// caller refusing an untrusted certificate.
#[derive(Debug)]
pub enum TransportError {
    /// The transport is closed or was never opened.
    Closed,
    /// Connecting or I/O failed below this layer.
    Io(std::io::Error),
    /// The remote presented a certificate the caller did not accept.
    CertificateRejected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::CertificateRejected => write!(f, "remote certificate rejected"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Frame-level decode errors.
///
/// A frame that fails to decode is dropped and logged; the connection and the
/// receive buffer stay intact.
#[derive(Debug)]
pub enum ProtocolError {
    /// The frame is not a valid JSON document.
    Malformed(serde_json::Error),
    /// The frame is valid JSON but neither a reply nor a notification.
    UnknownShape,
    /// A method string without the `Namespace.Method` form.
    BadMethod(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::UnknownShape => write!(f, "frame is neither a reply nor a notification"),
            Self::BadMethod(m) => write!(f, "method {m:?} is not of the form Namespace.Method"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e)
    }
}

/// What a pending call resolves with.
pub type CallResult = Result<serde_json::Value, CallError>;

/// Why a call did not produce a success reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The connection went away while the call was outstanding.
    ConnectionLost,
    /// The hub answered with an error reply; the string is verbatim.
    Rejected(String),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Rejected(e) => write!(f, "rejected by hub: {e}"),
        }
    }
}

impl std::error::Error for CallError {}
