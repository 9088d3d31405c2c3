#![warn(missing_docs)]

//! MCAS wire protocol: binary message framing and codecs.
//!
//! Every client↔shard exchange is a length-delimited message with a fixed
//! 32-byte little-endian header followed by an operation-specific body.
//! Field order is bit-exact; bodies are hand-encoded rather than run
//! through a serializer so the layout is stable across builds.

pub mod error;
pub mod flags;
pub mod header;
pub mod messages;
pub mod status;
mod wire;

pub use error::{ProtocolError, Result};
pub use flags::{AdoFlags, IoFlags, PoolFlags};
pub use header::{MessageHeader, MsgType, HEADER_SIZE, PROTOCOL_VERSION};
pub use messages::{
    AdoRequest, AdoResponse, AdoResponseBuffer, Attribute, InfoRequest, InfoResponse, IoOp,
    IoRequest, IoResponse, PoolOp, PoolRequest, PoolResponse, PutAdoRequest, SgElement,
    ShardStats, StatsResponse, INFO_TYPE_FIND_KEY, INFO_TYPE_GET_STATS,
};
pub use status::Status;

/// Values at or above this length do not travel inline in an IO response;
/// the client is expected to switch to the two-stage (locate/release)
/// protocol. Documented constant shared with clients, not negotiated.
pub const TWO_STAGE_THRESHOLD: usize = 2048;

/// Reserved key-name prefix marking a two-stage write that has not yet
/// been released. Recovery erases orphaned entries carrying this prefix.
pub const PENDING_KEY_PREFIX: &str = "___pending_";
