//! Error variants for backend operations.

use mcas_protocol::Status;
use thiserror::Error;

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Error variants for backend operations.
///
/// These are ordinary control-flow outcomes as much as faults; the
/// dispatcher maps each to a wire [`Status`] via [`BackendError::status`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The key does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The key is locked by another holder.
    #[error("key is locked: {0}")]
    Locked(String),

    /// The key already exists (create-only / don't-stomp semantics).
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    /// The pool is still open.
    #[error("pool still open: {0}")]
    AlreadyOpen(String),

    /// The pool handle is not valid.
    #[error("invalid pool handle: {0:#x}")]
    BadPool(u64),

    /// No pool with that name exists.
    #[error("no such pool: {0}")]
    NoSuchPool(String),

    /// The lock handle is not valid (never issued, or already released).
    #[error("invalid lock handle: {0:#x}")]
    BadHandle(u64),

    /// Allocation failed for lack of space.
    #[error("insufficient space in pool: requested {requested} bytes")]
    InsufficientSpace {
        /// Requested allocation size.
        requested: usize,
    },

    /// Value exceeds what the operation can carry.
    #[error("value too large: {len} bytes")]
    TooLarge {
        /// Offending value length.
        len: usize,
    },

    /// An address or offset fell outside pool memory.
    #[error("out of bounds")]
    OutOfBounds,

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    Inval(&'static str),

    /// The backend does not implement this operation.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
}

impl BackendError {
    /// The wire status this error propagates as.
    pub fn status(&self) -> Status {
        match self {
            BackendError::KeyNotFound(_) => Status::KeyNotFound,
            BackendError::Locked(_) => Status::Locked,
            BackendError::AlreadyExists(_) => Status::AlreadyExists,
            BackendError::AlreadyOpen(_) => Status::AlreadyOpen,
            BackendError::BadPool(_) => Status::Inval,
            BackendError::NoSuchPool(_) => Status::PoolError,
            BackendError::BadHandle(_) => Status::Fail,
            BackendError::InsufficientSpace { .. } => Status::InsufficientSpace,
            BackendError::TooLarge { .. } => Status::TooLarge,
            BackendError::OutOfBounds => Status::OutOfBounds,
            BackendError::Inval(_) => Status::Inval,
            BackendError::NotSupported(_) => Status::NotSupported,
        }
    }
}
