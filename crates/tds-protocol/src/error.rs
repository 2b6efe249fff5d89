//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding TDS wire structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Not enough bytes to decode the structure.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown packet type byte.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Status byte carries undefined bits.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// First byte of an SMP sub-header is not the SMP signature.
    #[error("invalid SMP signature: 0x{0:02X}")]
    InvalidSmpSignature(u8),

    /// Unknown SMP sub-frame type.
    #[error("invalid SMP frame type: 0x{0:02X}")]
    InvalidSmpType(u8),
}
