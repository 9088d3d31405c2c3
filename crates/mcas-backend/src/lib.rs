#![warn(missing_docs)]

//! Key-value backend interface and the DRAM reference backend.
//!
//! The shard talks to storage exclusively through the [`KvStore`] trait:
//! pools of key-value pairs with lock-scoped access to value memory,
//! crash-consistent allocation of raw pool memory, region enumeration
//! for transport registration, and attribute queries. [`MapStore`] is
//! the volatile reference implementation used for development and
//! testing; persistent engines plug in behind the same trait.

pub mod error;
pub mod guard;
pub mod mapstore;
pub mod store;

pub use error::{BackendError, Result};
pub use guard::LockedKey;
pub use mapstore::MapStore;
pub use store::{
    IterEntry, IteratorHandle, KeyHandle, KvStore, LockGrant, LockKind, MemoryRegion, PoolHandle,
    PutOutcome, UnlockFlush, KEY_NONE,
};
