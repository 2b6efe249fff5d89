//! Transport error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while moving packets over a TDS connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The peer sent a packet whose header cannot be framed.
    #[error("malformed packet (length {length}): {reason}")]
    MalformedPacket {
        /// Declared or observed length of the offending packet.
        length: usize,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// A packet buffer could not be allocated.
    #[error("out of memory allocating a {requested}-byte packet buffer")]
    OutOfMemory {
        /// Requested capacity in bytes.
        requested: usize,
    },

    /// An operation made no progress within the query timeout and the
    /// error hook chose to abort.
    #[error("session {sid} timed out after {elapsed:?}")]
    Timeout {
        /// Session that was waiting.
        sid: u16,
        /// Time spent without progress.
        elapsed: Duration,
    },

    /// The peer broke the MARS session protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The caller misused the API (for example unbalanced freeze frames).
    #[error("usage error: {0}")]
    Usage(&'static str),

    /// Invalid transport configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The connection has been torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// The session was closed by the peer or by its owner.
    #[error("session {sid} is closed")]
    SessionClosed {
        /// Session identifier.
        sid: u16,
    },

    /// IO error from the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-format error from the protocol layer.
    #[error("protocol error: {0}")]
    Protocol(#[from] tds_protocol::ProtocolError),
}

impl TransportError {
    /// Whether this error leaves the connection unusable.
    ///
    /// Usage errors, allocation failures and per-session closure only affect
    /// the caller; everything else tears the connection down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Usage(_)
                | Self::Config(_)
                | Self::OutOfMemory { .. }
                | Self::SessionClosed { .. }
        )
    }

    pub(crate) fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TransportError::ConnectionClosed.is_fatal());
        assert!(TransportError::violation("SYN from server").is_fatal());
        assert!(
            TransportError::Timeout {
                sid: 1,
                elapsed: Duration::from_secs(1)
            }
            .is_fatal()
        );
        assert!(!TransportError::Usage("unbalanced freeze").is_fatal());
        assert!(!TransportError::SessionClosed { sid: 2 }.is_fatal());
        assert!(!TransportError::OutOfMemory { requested: 64 }.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = TransportError::MalformedPacket {
            length: 4,
            reason: "length shorter than header",
        };
        assert_eq!(
            err.to_string(),
            "malformed packet (length 4): length shorter than header"
        );
    }
}
