use thiserror::Error;

/// Errors produced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed or reset the connection.
    #[error("connection closed by peer")]
    Closed,

    /// A frame exceeded the maximum message size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size found in the frame header.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// A frame could not be decoded.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] mcas_protocol::ProtocolError),

    /// Memory registration failed.
    #[error("memory registration failed: {reason}")]
    RegistrationFailed {
        /// Why the range could not be registered.
        reason: &'static str,
    },

    /// An RDMA access fell outside the registered range.
    #[error("remote access out of bounds: rkey {rkey:#x} addr {addr:#x} len {len}")]
    AccessOutOfBounds {
        /// Remote key presented.
        rkey: u64,
        /// Requested address.
        addr: u64,
        /// Requested length.
        len: usize,
    },

    /// The remote key is unknown (never registered, or deregistered).
    #[error("unknown remote key: {0:#x}")]
    UnknownRkey(u64),

    /// Provider name not recognized.
    #[error("unknown transport provider: {0}")]
    UnknownProvider(String),

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
