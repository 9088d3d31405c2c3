//! Volatile DRAM backend.
//!
//! Each value lives in its own boxed allocation so the address handed
//! out by `lock` stays stable while the map grows. Raw pool memory for
//! offset-based access is an arena of fixed-size region chunks, which
//! also gives region enumeration a realistic multi-region shape.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use mcas_protocol::Attribute;
use tracing::debug;

use crate::error::{BackendError, Result};
use crate::store::{
    IterEntry, IteratorHandle, KeyHandle, KvStore, LockGrant, LockKind, MemoryRegion, PoolHandle,
    PutOutcome, UnlockFlush,
};

/// Size of one pool memory region chunk.
pub const REGION_SIZE: usize = 8 << 20;

/// Memory-type attribute value reported by this backend (DRAM).
pub const MEMORY_TYPE_DRAM: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotLock {
    Unlocked,
    Shared(u32),
    Exclusive,
}

struct Slot {
    data: Box<[u8]>,
    lock: SlotLock,
    timestamp: u64,
}

impl Slot {
    fn new(data: Box<[u8]>) -> Self {
        Self {
            data,
            lock: SlotLock::Unlocked,
            timestamp: now_secs(),
        }
    }

    fn addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }
}

struct Pool {
    name: String,
    size: u64,
    flags: u32,
    expected_obj_count: u64,
    map: HashMap<String, Slot>,
    regions: Vec<Box<[u8]>>,
    allocations: HashMap<u64, Box<[u8]>>,
    iterators: HashMap<IteratorHandle, IterState>,
}

struct IterState {
    keys: Vec<String>,
    pos: usize,
}

struct LockRecord {
    pool: PoolHandle,
    key: String,
    kind: LockKind,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn in_window(ts: u64, window: (Option<u64>, Option<u64>)) -> bool {
    let (begin, end) = window;
    begin.map_or(true, |b| ts >= b) && end.map_or(true, |e| ts < e)
}

/// Volatile DRAM key-value backend.
pub struct MapStore {
    pools: HashMap<PoolHandle, Pool>,
    names: HashMap<String, PoolHandle>,
    locks: HashMap<KeyHandle, LockRecord>,
    next_pool: PoolHandle,
    next_handle: KeyHandle,
    next_iter: IteratorHandle,
}

impl MapStore {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
            names: HashMap::new(),
            locks: HashMap::new(),
            next_pool: 1,
            next_handle: 1,
            next_iter: 1,
        }
    }

    fn pool(&self, pool: PoolHandle) -> Result<&Pool> {
        self.pools.get(&pool).ok_or(BackendError::BadPool(pool))
    }

    fn pool_mut(&mut self, pool: PoolHandle) -> Result<&mut Pool> {
        self.pools.get_mut(&pool).ok_or(BackendError::BadPool(pool))
    }

    fn fresh_handle(&mut self) -> KeyHandle {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }
}

impl Default for MapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MapStore {
    fn create_pool(
        &mut self,
        name: &str,
        size: u64,
        flags: u32,
        expected_obj_count: u64,
    ) -> Result<PoolHandle> {
        if self.names.contains_key(name) {
            return Err(BackendError::AlreadyExists(name.to_string()));
        }
        let region_count = (size as usize).div_ceil(REGION_SIZE).max(1);
        let regions = (0..region_count)
            .map(|_| vec![0u8; REGION_SIZE].into_boxed_slice())
            .collect();
        let handle = self.next_pool;
        self.next_pool += 1;
        self.pools.insert(
            handle,
            Pool {
                name: name.to_string(),
                size,
                flags,
                expected_obj_count,
                map: HashMap::new(),
                regions,
                allocations: HashMap::new(),
                iterators: HashMap::new(),
            },
        );
        self.names.insert(name.to_string(), handle);
        debug!(pool = handle, name, size, "created pool");
        Ok(handle)
    }

    fn open_pool(&mut self, name: &str) -> Result<PoolHandle> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| BackendError::NoSuchPool(name.to_string()))
    }

    fn close_pool(&mut self, pool: PoolHandle) -> Result<()> {
        self.pool(pool).map(|_| ())
    }

    fn delete_pool(&mut self, name: &str) -> Result<()> {
        let handle = self
            .names
            .remove(name)
            .ok_or_else(|| BackendError::NoSuchPool(name.to_string()))?;
        self.pools.remove(&handle);
        self.locks.retain(|_, rec| rec.pool != handle);
        debug!(pool = handle, name, "deleted pool");
        Ok(())
    }

    fn count(&self, pool: PoolHandle) -> Result<u64> {
        Ok(self.pool(pool)?.map.len() as u64)
    }

    fn put(
        &mut self,
        pool: PoolHandle,
        key: &str,
        value: &[u8],
        dont_stomp: bool,
    ) -> Result<PutOutcome> {
        let p = self.pool_mut(pool)?;
        match p.map.get_mut(key) {
            Some(slot) => {
                if dont_stomp {
                    return Err(BackendError::AlreadyExists(key.to_string()));
                }
                if slot.lock != SlotLock::Unlocked {
                    return Err(BackendError::Locked(key.to_string()));
                }
                slot.data = value.to_vec().into_boxed_slice();
                slot.timestamp = now_secs();
                Ok(PutOutcome { created: false })
            }
            None => {
                p.map
                    .insert(key.to_string(), Slot::new(value.to_vec().into_boxed_slice()));
                Ok(PutOutcome { created: true })
            }
        }
    }

    fn lock(
        &mut self,
        pool: PoolHandle,
        key: &str,
        kind: LockKind,
        requested_len: usize,
    ) -> Result<LockGrant> {
        let handle = self.fresh_handle();
        let p = self.pool_mut(pool)?;

        let created = if !p.map.contains_key(key) {
            if kind == LockKind::Write && requested_len > 0 {
                p.map.insert(
                    key.to_string(),
                    Slot::new(vec![0u8; requested_len].into_boxed_slice()),
                );
                true
            } else {
                return Err(BackendError::KeyNotFound(key.to_string()));
            }
        } else {
            false
        };

        let slot = p.map.get_mut(key).ok_or_else(|| {
            // just inserted or checked above
            BackendError::KeyNotFound(key.to_string())
        })?;

        match (kind, slot.lock) {
            (LockKind::Read, SlotLock::Unlocked) => slot.lock = SlotLock::Shared(1),
            (LockKind::Read, SlotLock::Shared(n)) => slot.lock = SlotLock::Shared(n + 1),
            (LockKind::Write, SlotLock::Unlocked) => slot.lock = SlotLock::Exclusive,
            _ => return Err(BackendError::Locked(key.to_string())),
        }

        let grant = LockGrant {
            handle,
            addr: slot.addr(),
            len: slot.data.len(),
            created,
        };
        self.locks.insert(
            handle,
            LockRecord {
                pool,
                key: key.to_string(),
                kind,
            },
        );
        Ok(grant)
    }

    fn unlock(&mut self, pool: PoolHandle, handle: KeyHandle, _flush: UnlockFlush) -> Result<()> {
        let rec = self
            .locks
            .remove(&handle)
            .ok_or(BackendError::BadHandle(handle))?;
        if rec.pool != pool {
            self.locks.insert(handle, rec);
            return Err(BackendError::BadHandle(handle));
        }
        let p = self.pool_mut(pool)?;
        let slot = p
            .map
            .get_mut(&rec.key)
            .ok_or_else(|| BackendError::KeyNotFound(rec.key.clone()))?;
        slot.lock = match (rec.kind, slot.lock) {
            (LockKind::Read, SlotLock::Shared(1)) => SlotLock::Unlocked,
            (LockKind::Read, SlotLock::Shared(n)) => SlotLock::Shared(n - 1),
            (LockKind::Write, SlotLock::Exclusive) => SlotLock::Unlocked,
            _ => return Err(BackendError::BadHandle(handle)),
        };
        Ok(())
    }

    fn erase(&mut self, pool: PoolHandle, key: &str) -> Result<()> {
        let p = self.pool_mut(pool)?;
        match p.map.get(key) {
            Some(slot) if slot.lock != SlotLock::Unlocked => {
                Err(BackendError::Locked(key.to_string()))
            }
            Some(_) => {
                p.map.remove(key);
                Ok(())
            }
            None => Err(BackendError::KeyNotFound(key.to_string())),
        }
    }

    fn swap_keys(&mut self, pool: PoolHandle, a: &str, b: &str) -> Result<()> {
        let p = self.pool_mut(pool)?;
        for k in [a, b] {
            match p.map.get(k) {
                Some(slot) if slot.lock != SlotLock::Unlocked => {
                    return Err(BackendError::Locked(k.to_string()))
                }
                Some(_) => {}
                None => return Err(BackendError::KeyNotFound(k.to_string())),
            }
        }
        let mut slot_a = p.map.remove(a).ok_or_else(|| BackendError::KeyNotFound(a.into()))?;
        let mut slot_b = p.map.remove(b).ok_or_else(|| BackendError::KeyNotFound(b.into()))?;
        std::mem::swap(&mut slot_a.data, &mut slot_b.data);
        std::mem::swap(&mut slot_a.timestamp, &mut slot_b.timestamp);
        p.map.insert(a.to_string(), slot_a);
        p.map.insert(b.to_string(), slot_b);
        Ok(())
    }

    fn resize_value(
        &mut self,
        pool: PoolHandle,
        key: &str,
        new_len: usize,
        _align: usize,
    ) -> Result<()> {
        let p = self.pool_mut(pool)?;
        let slot = p
            .map
            .get_mut(key)
            .ok_or_else(|| BackendError::KeyNotFound(key.to_string()))?;
        if slot.lock != SlotLock::Unlocked {
            return Err(BackendError::Locked(key.to_string()));
        }
        let mut data = vec![0u8; new_len];
        let n = new_len.min(slot.data.len());
        data[..n].copy_from_slice(&slot.data[..n]);
        slot.data = data.into_boxed_slice();
        slot.timestamp = now_secs();
        Ok(())
    }

    fn allocate_pool_memory(&mut self, pool: PoolHandle, len: usize, _align: usize) -> Result<u64> {
        if len == 0 {
            return Err(BackendError::Inval("zero-length allocation"));
        }
        let p = self.pool_mut(pool)?;
        let buf = vec![0u8; len].into_boxed_slice();
        let addr = buf.as_ptr() as u64;
        p.allocations.insert(addr, buf);
        Ok(addr)
    }

    fn free_pool_memory(&mut self, pool: PoolHandle, addr: u64, _len: usize) -> Result<()> {
        let p = self.pool_mut(pool)?;
        p.allocations
            .remove(&addr)
            .map(|_| ())
            .ok_or(BackendError::OutOfBounds)
    }

    fn flush_pool_memory(&mut self, pool: PoolHandle, _addr: u64, _len: usize) -> Result<()> {
        // DRAM backend: nothing to persist
        self.pool(pool).map(|_| ())
    }

    fn pool_regions(&self, pool: PoolHandle) -> Result<Vec<MemoryRegion>> {
        let p = self.pool(pool)?;
        Ok(p.regions
            .iter()
            .map(|r| MemoryRegion {
                base: r.as_ptr() as u64,
                len: r.len(),
            })
            .collect())
    }

    fn map(
        &self,
        pool: PoolHandle,
        window: (Option<u64>, Option<u64>),
        f: &mut dyn FnMut(&str, u64, usize, u64),
    ) -> Result<()> {
        let p = self.pool(pool)?;
        for (key, slot) in &p.map {
            if in_window(slot.timestamp, window) {
                f(key, slot.addr(), slot.data.len(), slot.timestamp);
            }
        }
        Ok(())
    }

    fn map_keys(&self, pool: PoolHandle, f: &mut dyn FnMut(&str)) -> Result<()> {
        let p = self.pool(pool)?;
        for key in p.map.keys() {
            f(key);
        }
        Ok(())
    }

    fn open_pool_iterator(&mut self, pool: PoolHandle) -> Result<IteratorHandle> {
        let iter = self.next_iter;
        self.next_iter += 1;
        let p = self.pool_mut(pool)?;
        let mut keys: Vec<String> = p.map.keys().cloned().collect();
        keys.sort();
        p.iterators.insert(iter, IterState { keys, pos: 0 });
        Ok(iter)
    }

    fn deref_pool_iterator(
        &mut self,
        pool: PoolHandle,
        iter: IteratorHandle,
        window: (Option<u64>, Option<u64>),
    ) -> Result<IterEntry> {
        let p = self.pool_mut(pool)?;
        let state = p
            .iterators
            .get_mut(&iter)
            .ok_or(BackendError::Inval("unknown iterator"))?;
        // skip keys erased since the snapshot
        while state.pos < state.keys.len() {
            let key = state.keys[state.pos].clone();
            state.pos += 1;
            if let Some(slot) = p.map.get(&key) {
                return Ok(IterEntry {
                    key,
                    value_addr: slot.addr(),
                    value_len: slot.data.len(),
                    timestamp: slot.timestamp,
                    time_match: in_window(slot.timestamp, window),
                });
            }
        }
        Err(BackendError::OutOfBounds)
    }

    fn close_pool_iterator(&mut self, pool: PoolHandle, iter: IteratorHandle) -> Result<()> {
        let p = self.pool_mut(pool)?;
        p.iterators
            .remove(&iter)
            .map(|_| ())
            .ok_or(BackendError::Inval("unknown iterator"))
    }

    fn get_attribute(&self, pool: PoolHandle, attr: Attribute, key: Option<&str>) -> Result<u64> {
        let p = self.pool(pool)?;
        match attr {
            Attribute::Count => Ok(p.map.len() as u64),
            Attribute::ValueLen => {
                let key = key.ok_or(BackendError::Inval("VALUE_LEN requires a key"))?;
                p.map
                    .get(key)
                    .map(|s| s.data.len() as u64)
                    .ok_or_else(|| BackendError::KeyNotFound(key.to_string()))
            }
            Attribute::MemoryType => Ok(MEMORY_TYPE_DRAM),
            Attribute::PercentUsed => {
                let used: usize = p.map.values().map(|s| s.data.len()).sum::<usize>()
                    + p.allocations.values().map(|a| a.len()).sum::<usize>();
                if p.size == 0 {
                    return Ok(0);
                }
                Ok(((used as u64).saturating_mul(100) / p.size).min(100))
            }
            Attribute::Crc32 => Err(BackendError::NotSupported("CRC32 is computed by the shard")),
        }
    }
}

impl MapStore {
    /// Pool metadata recorded at create time: `(expected_obj_count, size, flags)`.
    pub fn pool_info(&self, pool: PoolHandle) -> Result<(u64, u64, u32)> {
        let p = self.pool(pool)?;
        Ok((p.expected_obj_count, p.size, p.flags))
    }

    /// Name of an open pool.
    pub fn pool_name(&self, pool: PoolHandle) -> Result<&str> {
        Ok(self.pool(pool)?.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_pool() -> (MapStore, PoolHandle) {
        let mut s = MapStore::new();
        let p = s.create_pool("p", 16 << 20, 0, 100).unwrap();
        (s, p)
    }

    #[test]
    fn test_put_get_via_lock() {
        let (mut s, p) = store_with_pool();
        s.put(p, "alpha", b"one", false).unwrap();
        let grant = s.lock(p, "alpha", LockKind::Read, 0).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(grant.addr as *const u8, grant.len) };
        assert_eq!(bytes, b"one");
        s.unlock(p, grant.handle, UnlockFlush::Flush).unwrap();
    }

    #[test]
    fn test_put_dont_stomp() {
        let (mut s, p) = store_with_pool();
        s.put(p, "k", b"v", false).unwrap();
        assert!(matches!(
            s.put(p, "k", b"v2", true),
            Err(BackendError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_write_lock_creates_on_demand() {
        let (mut s, p) = store_with_pool();
        let grant = s.lock(p, "new", LockKind::Write, 64).unwrap();
        assert!(grant.created);
        assert_eq!(grant.len, 64);
        let bytes = unsafe { std::slice::from_raw_parts(grant.addr as *const u8, grant.len) };
        assert!(bytes.iter().all(|&b| b == 0));
        s.unlock(p, grant.handle, UnlockFlush::None).unwrap();
    }

    #[test]
    fn test_shared_locks_stack_and_exclude_writer() {
        let (mut s, p) = store_with_pool();
        s.put(p, "k", b"v", false).unwrap();
        let g1 = s.lock(p, "k", LockKind::Read, 0).unwrap();
        let g2 = s.lock(p, "k", LockKind::Read, 0).unwrap();
        assert_eq!(g1.addr, g2.addr);
        assert!(matches!(
            s.lock(p, "k", LockKind::Write, 0),
            Err(BackendError::Locked(_))
        ));
        s.unlock(p, g1.handle, UnlockFlush::None).unwrap();
        s.unlock(p, g2.handle, UnlockFlush::None).unwrap();
        let g3 = s.lock(p, "k", LockKind::Write, 0).unwrap();
        s.unlock(p, g3.handle, UnlockFlush::None).unwrap();
    }

    #[test]
    fn test_erase_locked_fails() {
        let (mut s, p) = store_with_pool();
        s.put(p, "k", b"v", false).unwrap();
        let g = s.lock(p, "k", LockKind::Read, 0).unwrap();
        assert!(matches!(s.erase(p, "k"), Err(BackendError::Locked(_))));
        s.unlock(p, g.handle, UnlockFlush::None).unwrap();
        s.erase(p, "k").unwrap();
        assert!(matches!(s.erase(p, "k"), Err(BackendError::KeyNotFound(_))));
    }

    #[test]
    fn test_swap_keys() {
        let (mut s, p) = store_with_pool();
        s.put(p, "a", b"aaa", false).unwrap();
        s.put(p, "b", b"bb", false).unwrap();
        s.swap_keys(p, "a", "b").unwrap();
        let ga = s.lock(p, "a", LockKind::Read, 0).unwrap();
        assert_eq!(ga.len, 2);
        s.unlock(p, ga.handle, UnlockFlush::None).unwrap();
    }

    #[test]
    fn test_pool_regions_cover_requested_size() {
        let (s, p) = store_with_pool();
        let regions = s.pool_regions(p).unwrap();
        assert_eq!(regions.len(), 2);
        assert!(regions.iter().all(|r| r.len == REGION_SIZE));
    }

    #[test]
    fn test_pool_lifecycle() {
        let mut s = MapStore::new();
        let p = s.create_pool("p", 1 << 20, 0, 0).unwrap();
        assert_eq!(s.open_pool("p").unwrap(), p);
        assert!(matches!(
            s.create_pool("p", 1 << 20, 0, 0),
            Err(BackendError::AlreadyExists(_))
        ));
        s.close_pool(p).unwrap();
        s.delete_pool("p").unwrap();
        assert!(matches!(s.open_pool("p"), Err(BackendError::NoSuchPool(_))));
    }

    #[test]
    fn test_iterator_walks_sorted_snapshot() {
        let (mut s, p) = store_with_pool();
        s.put(p, "b", b"2", false).unwrap();
        s.put(p, "a", b"1", false).unwrap();
        let it = s.open_pool_iterator(p).unwrap();
        let e1 = s.deref_pool_iterator(p, it, (None, None)).unwrap();
        assert_eq!(e1.key, "a");
        assert!(e1.time_match);
        let e2 = s.deref_pool_iterator(p, it, (None, None)).unwrap();
        assert_eq!(e2.key, "b");
        assert!(matches!(
            s.deref_pool_iterator(p, it, (None, None)),
            Err(BackendError::OutOfBounds)
        ));
        s.close_pool_iterator(p, it).unwrap();
    }

    #[test]
    fn test_attributes() {
        let (mut s, p) = store_with_pool();
        s.put(p, "k", b"hello", false).unwrap();
        assert_eq!(s.get_attribute(p, Attribute::Count, None).unwrap(), 1);
        assert_eq!(
            s.get_attribute(p, Attribute::ValueLen, Some("k")).unwrap(),
            5
        );
        assert_eq!(
            s.get_attribute(p, Attribute::MemoryType, None).unwrap(),
            MEMORY_TYPE_DRAM
        );
    }

    #[test]
    fn test_alloc_free_pool_memory() {
        let (mut s, p) = store_with_pool();
        let addr = s.allocate_pool_memory(p, 4096, 8).unwrap();
        assert_ne!(addr, 0);
        s.free_pool_memory(p, addr, 4096).unwrap();
        assert!(matches!(
            s.free_pool_memory(p, addr, 4096),
            Err(BackendError::OutOfBounds)
        ));
    }
}
