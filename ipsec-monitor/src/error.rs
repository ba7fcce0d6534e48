// Control socket error taxonomy

//! Errors raised while talking to the IKE daemon
//!
//! Both variants are recoverable at the refresh boundary: the coordinator logs
//! them and keeps serving the last snapshot it fetched successfully.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single control socket query
#[derive(Debug, Error)]
pub enum ViciError {
    /// Socket unreachable, unreadable, closed early or timed out
    #[error("VICI socket {path:?} unavailable: {source}")]
    Connection {
        /// Socket path the client was talking to
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// Daemon answered, but the payload did not have the expected shape
    #[error("Malformed VICI response: {0}")]
    Protocol(String),
}

impl ViciError {
    pub(crate) fn connection(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Connection {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for transport-level failures
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// True for decode failures
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ViciError::connection(
            "/var/run/charon.vici",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(err.is_connection());
        assert!(!err.is_protocol());

        let err = ViciError::protocol("missing field");
        assert!(err.is_protocol());
        assert!(!err.is_connection());
    }

    #[test]
    fn test_error_display_names_socket() {
        let err = ViciError::connection(
            "/var/run/charon.vici",
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert!(err.to_string().contains("charon.vici"));
    }
}
