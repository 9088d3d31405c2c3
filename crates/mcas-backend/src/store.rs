//! The backend interface.

use mcas_protocol::Attribute;

use crate::error::Result;

/// Opaque pool handle. Unique per pool within one backend instance.
pub type PoolHandle = u64;

/// Opaque lock handle naming one locked key-value pair. Invalid after
/// unlock; distinct instances for distinct lock holders.
pub type KeyHandle = u64;

/// The "no key handle" sentinel.
pub const KEY_NONE: KeyHandle = 0;

/// Opaque pool iterator handle.
pub type IteratorHandle = u64;

/// Lock kind requested on a key-value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared reader lock.
    Read,
    /// Exclusive writer lock.
    Write,
}

/// Whether an unlock flushes value memory to the persistence domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockFlush {
    /// No flush.
    None,
    /// Flush the value range before releasing.
    Flush,
}

/// A granted lock: the stable address and length of the value storage
/// plus the handle that must be presented to unlock.
#[derive(Debug, Clone, Copy)]
pub struct LockGrant {
    /// Lock handle.
    pub handle: KeyHandle,
    /// Virtual address of the value storage. Stable for the lifetime of
    /// the lock.
    pub addr: u64,
    /// Value length in bytes.
    pub len: usize,
    /// True when the lock created the pair on demand.
    pub created: bool,
}

/// Outcome of a successful put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// True when the put created the key.
    pub created: bool,
}

/// One contiguous region of pool virtual memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Region base address.
    pub base: u64,
    /// Region length in bytes.
    pub len: usize,
}

/// One dereferenced pool-iterator position.
#[derive(Debug, Clone)]
pub struct IterEntry {
    /// The key.
    pub key: String,
    /// Value storage address.
    pub value_addr: u64,
    /// Value length in bytes.
    pub value_len: usize,
    /// Write timestamp, seconds since the epoch.
    pub timestamp: u64,
    /// True when the entry falls inside the requested time window.
    pub time_match: bool,
}

/// Pluggable key-value engine behind the shard.
///
/// All operations are bounded and non-blocking; the shard calls them
/// from its event loop. Implementations must keep a locked value's
/// storage address stable until the lock is released.
pub trait KvStore: Send {
    /// Create a pool. Fails with `AlreadyExists` if the name is taken.
    fn create_pool(
        &mut self,
        name: &str,
        size: u64,
        flags: u32,
        expected_obj_count: u64,
    ) -> Result<PoolHandle>;

    /// Open an existing pool by name.
    fn open_pool(&mut self, name: &str) -> Result<PoolHandle>;

    /// Close a pool handle. Storage persists until deleted.
    fn close_pool(&mut self, pool: PoolHandle) -> Result<()>;

    /// Delete a pool by name. The pool must be closed.
    fn delete_pool(&mut self, name: &str) -> Result<()>;

    /// Number of objects in the pool.
    fn count(&self, pool: PoolHandle) -> Result<u64>;

    /// Copy a value into the pool under `key`.
    fn put(&mut self, pool: PoolHandle, key: &str, value: &[u8], dont_stomp: bool)
        -> Result<PutOutcome>;

    /// Lock a key-value pair.
    ///
    /// A write lock with `requested_len > 0` creates the pair on demand
    /// (zero-filled, `created` set in the grant). `requested_len` is
    /// ignored for existing pairs; the grant reports the actual length.
    fn lock(
        &mut self,
        pool: PoolHandle,
        key: &str,
        kind: LockKind,
        requested_len: usize,
    ) -> Result<LockGrant>;

    /// Release a lock.
    fn unlock(&mut self, pool: PoolHandle, handle: KeyHandle, flush: UnlockFlush) -> Result<()>;

    /// Erase a key-value pair. Fails with `Locked` while any lock is held.
    fn erase(&mut self, pool: PoolHandle, key: &str) -> Result<()>;

    /// Atomically exchange the values of two keys. Neither may be locked.
    fn swap_keys(&mut self, pool: PoolHandle, a: &str, b: &str) -> Result<()>;

    /// Resize a value in place. The pair must be unlocked.
    fn resize_value(&mut self, pool: PoolHandle, key: &str, new_len: usize, align: usize)
        -> Result<()>;

    /// Allocate raw pool memory; returns its address.
    fn allocate_pool_memory(&mut self, pool: PoolHandle, len: usize, align: usize) -> Result<u64>;

    /// Free raw pool memory previously allocated.
    fn free_pool_memory(&mut self, pool: PoolHandle, addr: u64, len: usize) -> Result<()>;

    /// Flush a range of pool memory to the persistence domain.
    fn flush_pool_memory(&mut self, pool: PoolHandle, addr: u64, len: usize) -> Result<()>;

    /// Enumerate the pool's contiguous memory regions.
    fn pool_regions(&self, pool: PoolHandle) -> Result<Vec<MemoryRegion>>;

    /// Visit every pair, optionally restricted to a `[t_begin, t_end)`
    /// write-time window (seconds since the epoch; `None` = unbounded).
    fn map(
        &self,
        pool: PoolHandle,
        window: (Option<u64>, Option<u64>),
        f: &mut dyn FnMut(&str, u64, usize, u64),
    ) -> Result<()>;

    /// Visit every key.
    fn map_keys(&self, pool: PoolHandle, f: &mut dyn FnMut(&str)) -> Result<()>;

    /// Open a pool iterator.
    fn open_pool_iterator(&mut self, pool: PoolHandle) -> Result<IteratorHandle>;

    /// Dereference and advance a pool iterator.
    ///
    /// Returns `OutOfBounds` past the last entry. `time_match` reports
    /// whether the entry falls inside the window.
    fn deref_pool_iterator(
        &mut self,
        pool: PoolHandle,
        iter: IteratorHandle,
        window: (Option<u64>, Option<u64>),
    ) -> Result<IterEntry>;

    /// Close a pool iterator.
    fn close_pool_iterator(&mut self, pool: PoolHandle, iter: IteratorHandle) -> Result<()>;

    /// Query a numeric attribute, optionally key-scoped.
    fn get_attribute(&self, pool: PoolHandle, attr: Attribute, key: Option<&str>) -> Result<u64>;
}
