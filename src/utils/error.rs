//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Graphyne. Variants classify the root cause so
/// that the superstep controller can route failure handling; all of them
/// carry a human-readable description.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GraphyneError {
    /// A reader or user-supplied input produced malformed graph data.
    InvalidInput(String),

    /// A request or persisted payload could not be decoded.
    Deserialization(String),

    /// Disk or network I/O failure.
    Io(String),

    /// Uncaught fault inside a user compute function, with the offending
    /// vertex id rendered into the message.
    UserCompute(String),

    /// Unknown request type, out-of-order frame, or peer misbehavior.
    ProtocolViolation(String),

    /// The external coordination service became unreachable.
    CoordinationLost(String),

    /// Catch-all for internal errors that do not fit the kinds above.
    Internal(String),
}

impl GraphyneError {
    /// Creates an `Internal` error out of anything printable.
    pub fn msg(m: impl ToString) -> Self {
        GraphyneError::Internal(m.to_string())
    }

    /// Whether this error kind is retried locally inside the RPC layer
    /// rather than bubbled up to the superstep controller.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GraphyneError::Io(_))
    }
}

impl fmt::Display for GraphyneError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // do not display literal quotes
        match self {
            GraphyneError::InvalidInput(m) => write!(f, "invalid input: {}", m),
            GraphyneError::Deserialization(m) => {
                write!(f, "deserialization: {}", m)
            }
            GraphyneError::Io(m) => write!(f, "io: {}", m),
            GraphyneError::UserCompute(m) => write!(f, "user compute: {}", m),
            GraphyneError::ProtocolViolation(m) => {
                write!(f, "protocol violation: {}", m)
            }
            GraphyneError::CoordinationLost(m) => {
                write!(f, "coordination lost: {}", m)
            }
            GraphyneError::Internal(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for GraphyneError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `GraphyneError`, mapped to
// the appropriate kind.
macro_rules! impl_from_error {
    ($error:ty, $variant:path) => {
        impl From<$error> for GraphyneError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                $variant(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error, GraphyneError::Io);
impl_from_error!(net::AddrParseError, GraphyneError::Internal);
impl_from_error!(rmp_serde::encode::Error, GraphyneError::Internal);
impl_from_error!(rmp_serde::decode::Error, GraphyneError::Deserialization);
impl_from_error!(toml::ser::Error, GraphyneError::Internal);
impl_from_error!(toml::de::Error, GraphyneError::Internal);
impl_from_error!(std::string::FromUtf8Error, GraphyneError::Deserialization);
impl_from_error!(
    tokio::sync::mpsc::error::TryRecvError,
    GraphyneError::Internal
);
impl_from_error!(tokio::sync::AcquireError, GraphyneError::Internal);
impl_from_error!(
    tokio::sync::broadcast::error::RecvError,
    GraphyneError::Internal
);
impl_from_error!(tokio::task::JoinError, GraphyneError::Internal);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GraphyneError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GraphyneError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = GraphyneError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = GraphyneError::from(io_error);
        assert!(matches!(e, GraphyneError::Io(_)));
        assert!(e.to_string().contains("oh no!"));
    }

    #[test]
    fn retriable_kinds() {
        assert!(GraphyneError::Io("conn reset".into()).is_retriable());
        assert!(!GraphyneError::ProtocolViolation("tag 99".into())
            .is_retriable());
    }
}
