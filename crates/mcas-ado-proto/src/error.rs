use thiserror::Error;

/// Errors produced by the ADO IPC layer.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Shared-memory create/open/map failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] std::io::Error),

    /// The segment header did not match this build's layout.
    #[error("channel layout mismatch: {0}")]
    LayoutMismatch(&'static str),

    /// All message buffers are in flight; retry after the peer drains.
    #[error("channel full")]
    Full,

    /// A message did not decode.
    #[error("malformed channel message: {0}")]
    BadMessage(&'static str),

    /// A string or buffer exceeded the fixed message capacity.
    #[error("field too large for channel message: {field} ({len} bytes)")]
    FieldTooLarge {
        /// Field name.
        field: &'static str,
        /// Offending length.
        len: usize,
    },

    /// The peer has marked itself gone.
    #[error("peer has shut down")]
    PeerGone,
}

/// Result alias for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;
