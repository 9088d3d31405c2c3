#![warn(missing_docs)]

//! Shard↔ADO IPC.
//!
//! Each ADO process talks to its shard over a named shared-memory
//! segment holding, per direction, a slab of fixed-size message
//! buffers, a data ring carrying slab indices, and a free ring
//! returning consumed indices. All rings are single-producer /
//! single-consumer. An unblock sentinel message wakes a peer that
//! sleeps between polls.

pub mod channel;
pub mod error;
pub mod messages;
pub mod queue;
pub mod shm;

pub use channel::{AdoEndpoint, ChannelConfig, Role};
pub use error::{IpcError, Result};
pub use messages::{
    AdoMessage, AdoOp, FindType, ResponseBuffer, CONFIG_SHARD_DEC_REF, CONFIG_SHARD_INC_REF,
    MAX_RESPONSE_BUFFERS, TABLE_OP_CREATE_ONLY, TABLE_OP_LIFETIME_UNLOCK,
    TABLE_OP_NO_IMPLICIT_UNLOCK,
};
pub use shm::SharedMemory;
