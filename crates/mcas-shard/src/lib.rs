//! MCAS shard core.
//!
//! A shard is a single-threaded service instance pinned to one CPU
//! core. It terminates one network endpoint, dispatches client
//! requests against a pluggable key-value backend, manages lock
//! lifetimes coupled with remote-access memory registration, and
//! coordinates with a per-pool ADO process over shared-memory IPC.
//! Everything is driven from one cooperative event loop; no call in
//! the loop blocks.

pub mod ado;
pub mod cluster;
pub mod config;
pub mod crc32;
pub mod error;
pub mod index;
pub mod pool_manager;
pub mod registry;
pub mod session;
pub mod sg;
pub mod shard;
pub mod signals;
pub mod tasks;

pub use cluster::{ClusterMessage, ClusterSender};
pub use config::{ConfigFile, ShardConfig};
pub use error::{Result, ShardError};
pub use sg::{offset_to_sg_list, SgResolution};
pub use shard::Shard;
