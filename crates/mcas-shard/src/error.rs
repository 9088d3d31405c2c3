use thiserror::Error;

/// Errors surfaced inside the shard.
#[derive(Debug, Error)]
pub enum ShardError {
    /// No send buffer (or other bounded resource) is available right
    /// now. The in-flight request must be left on its queue and retried
    /// on a later tick; it is the one error that does not consume the
    /// request.
    #[error("resource unavailable, retry next tick")]
    ResourceUnavailable,

    /// Backend operation failed.
    #[error(transparent)]
    Backend(#[from] mcas_backend::BackendError),

    /// Transport operation failed.
    #[error(transparent)]
    Transport(#[from] mcas_transport::TransportError),

    /// A message failed to decode.
    #[error(transparent)]
    Protocol(#[from] mcas_protocol::ProtocolError),

    /// ADO IPC failed.
    #[error(transparent)]
    Ipc(#[from] mcas_ado_proto::IpcError),

    /// Launching an ADO process failed.
    #[error("ADO launch failed: {0}")]
    AdoLaunch(std::io::Error),

    /// A loop invariant was violated; the shard cannot safely continue.
    #[error("logic error: {0}")]
    Logic(String),
}

/// Result alias for shard operations.
pub type Result<T> = std::result::Result<T, ShardError>;
