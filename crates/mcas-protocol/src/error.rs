use thiserror::Error;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The buffer ended before the message did.
    #[error("truncated message: needed {needed} bytes, had {remaining}")]
    Truncated {
        /// Bytes the decoder needed.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// Protocol version did not match ours.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// The version this build speaks.
        expected: u16,
        /// The version found in the header.
        got: u16,
    },

    /// Header carried a message type we do not know.
    #[error("unknown message type: 0x{0:04X}")]
    UnknownMsgType(u16),

    /// Body carried an operation code we do not know.
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// A length field exceeded the enclosing message.
    #[error("bad length field: {field} = {value}")]
    BadLength {
        /// Which field was out of range.
        field: &'static str,
        /// The offending value.
        value: u64,
    },

    /// The message was decoded as the wrong type.
    #[error("unexpected message type: expected {expected:?}, got 0x{got:04X}")]
    UnexpectedType {
        /// The type the caller asked for.
        expected: crate::header::MsgType,
        /// The type found in the header.
        got: u16,
    },
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
