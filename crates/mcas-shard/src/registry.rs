//! Shard-global lock registries.
//!
//! All four registries are keyed by *target address* (or byte range for
//! reserved spaces), not by key: one physical storage location may back
//! several concurrent readers, and the transport reports completions by
//! address. A target address is present in at most one of
//! {shared, exclusive, reserved-space} at any time.

use std::collections::HashMap;

use mcas_backend::{KeyHandle, PoolHandle};
use mcas_transport::RegisteredMemory;
use tracing::debug;

/// One locked value: the backend lock it consolidates plus the
/// registered memory that keeps the transport able to reach it.
pub struct LockedValue {
    /// Owning pool.
    pub pool: PoolHandle,
    /// The backend lock handle (one per registry entry, regardless of
    /// how many holders share it).
    pub key_handle: KeyHandle,
    /// Value length.
    pub len: usize,
    /// Registration; dropping the entry deregisters.
    pub mr: RegisteredMemory,
    /// Holder count.
    pub count: u32,
}

/// A rename deferred until the exclusive lock at its target releases.
#[derive(Debug, Clone)]
pub struct PendingRename {
    /// Owning pool.
    pub pool: PoolHandle,
    /// Sentinel key currently holding the value.
    pub from: String,
    /// Key the value becomes visible under.
    pub to: String,
}

/// A reserved byte-range of pool virtual memory (offset-based locate).
pub struct ReservedSpace {
    /// Registration covering the enclosing range.
    pub mr: RegisteredMemory,
    /// Holder count.
    pub count: u32,
}

/// The registries, owned by the shard thread.
#[derive(Default)]
pub struct LockRegistry {
    shared: HashMap<u64, LockedValue>,
    exclusive: HashMap<u64, LockedValue>,
    spaces: HashMap<(u64, u64), ReservedSpace>,
    renames: HashMap<u64, PendingRename>,
}

/// Outcome of a release: whether the last holder just left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Holders remain; nothing to unlock yet.
    StillHeld,
    /// Last holder released; the backend lock must be dropped.
    FullyReleased {
        /// Pool owning the value.
        pool: PoolHandle,
        /// Backend lock to release.
        key_handle: KeyHandle,
    },
}

impl LockRegistry {
    /// Fresh, empty registry set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared entry at `target`, if any.
    pub fn shared(&self, target: u64) -> Option<&LockedValue> {
        self.shared.get(&target)
    }

    /// Exclusive entry at `target`, if any.
    pub fn exclusive(&self, target: u64) -> Option<&LockedValue> {
        self.exclusive.get(&target)
    }

    /// Add a reader on an already shared-locked target. Returns `false`
    /// if there is no entry (caller must insert one).
    pub fn add_shared_reference(&mut self, target: u64) -> bool {
        match self.shared.get_mut(&target) {
            Some(entry) => {
                entry.count += 1;
                true
            }
            None => false,
        }
    }

    /// Insert a new shared entry with one holder.
    pub fn insert_shared(
        &mut self,
        target: u64,
        pool: PoolHandle,
        key_handle: KeyHandle,
        len: usize,
        mr: RegisteredMemory,
    ) {
        debug_assert!(!self.exclusive.contains_key(&target));
        debug_assert!(!self.shared.contains_key(&target));
        self.shared.insert(
            target,
            LockedValue {
                pool,
                key_handle,
                len,
                mr,
                count: 1,
            },
        );
    }

    /// Insert a new exclusive entry with one holder.
    pub fn insert_exclusive(
        &mut self,
        target: u64,
        pool: PoolHandle,
        key_handle: KeyHandle,
        len: usize,
        mr: RegisteredMemory,
    ) {
        debug_assert!(!self.shared.contains_key(&target));
        debug_assert!(!self.exclusive.contains_key(&target));
        self.exclusive.insert(
            target,
            LockedValue {
                pool,
                key_handle,
                len,
                mr,
                count: 1,
            },
        );
    }

    /// Add a holder on an exclusive entry (the ADO path re-references a
    /// writer).
    pub fn add_exclusive_reference(&mut self, target: u64) -> bool {
        match self.exclusive.get_mut(&target) {
            Some(entry) => {
                entry.count += 1;
                true
            }
            None => false,
        }
    }

    /// Release one shared holder. `None` when the target was never
    /// shared-locked (a protocol error).
    pub fn release_shared(&mut self, target: u64) -> Option<ReleaseOutcome> {
        let entry = self.shared.get_mut(&target)?;
        if entry.count > 1 {
            entry.count -= 1;
            return Some(ReleaseOutcome::StillHeld);
        }
        let entry = self.shared.remove(&target)?;
        Some(ReleaseOutcome::FullyReleased {
            pool: entry.pool,
            key_handle: entry.key_handle,
        })
    }

    /// Release one exclusive holder.
    pub fn release_exclusive(&mut self, target: u64) -> Option<ReleaseOutcome> {
        let entry = self.exclusive.get_mut(&target)?;
        if entry.count > 1 {
            entry.count -= 1;
            return Some(ReleaseOutcome::StillHeld);
        }
        let entry = self.exclusive.remove(&target)?;
        Some(ReleaseOutcome::FullyReleased {
            pool: entry.pool,
            key_handle: entry.key_handle,
        })
    }

    /// Record a pending rename at `target`. At most one may exist.
    pub fn add_pending_rename(&mut self, target: u64, pool: PoolHandle, from: String, to: String) {
        debug_assert!(!self.renames.contains_key(&target));
        debug!(target = format_args!("{target:#x}"), %from, %to, "pending rename");
        self.renames.insert(target, PendingRename { pool, from, to });
    }

    /// Take the pending rename at `target`, if any.
    pub fn take_pending_rename(&mut self, target: u64) -> Option<PendingRename> {
        self.renames.remove(&target)
    }

    /// True when a pending rename exists for `target`.
    pub fn has_pending_rename(&self, target: u64) -> bool {
        self.renames.contains_key(&target)
    }

    /// Add a holder on a reserved space, inserting it if new.
    pub fn add_space(&mut self, range: (u64, u64), mr: RegisteredMemory) {
        let entry = self.spaces.entry(range).or_insert(ReservedSpace { mr, count: 0 });
        entry.count += 1;
        debug!(lo = range.0, hi = range.1, count = entry.count, "space reserved");
    }

    /// Release one holder of a reserved space. `None` when the range
    /// was never located.
    pub fn release_space(&mut self, range: (u64, u64)) -> Option<()> {
        let entry = self.spaces.get_mut(&range)?;
        entry.count -= 1;
        if entry.count == 0 {
            self.spaces.remove(&range);
        }
        Some(())
    }

    /// Drain every entry, returning the backend locks that must be
    /// released. Used at shutdown.
    pub fn drain_all(&mut self) -> Vec<(PoolHandle, KeyHandle)> {
        let mut locks = Vec::new();
        for (_, entry) in self.shared.drain() {
            locks.push((entry.pool, entry.key_handle));
        }
        for (_, entry) in self.exclusive.drain() {
            locks.push((entry.pool, entry.key_handle));
        }
        self.spaces.clear();
        self.renames.clear();
        locks
    }

    /// Number of live entries across all registries (diagnostics).
    pub fn live_entries(&self) -> usize {
        self.shared.len() + self.exclusive.len() + self.spaces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcas_transport::MrTable;

    fn mr_for(table: &std::sync::Arc<MrTable>, buf: &[u8]) -> RegisteredMemory {
        table.register(buf.as_ptr() as u64, buf.len()).unwrap()
    }

    #[test]
    fn test_shared_refcount_consolidation() {
        let table = MrTable::new();
        let buf = vec![0u8; 64];
        let target = buf.as_ptr() as u64;
        let mut reg = LockRegistry::new();

        assert!(!reg.add_shared_reference(target));
        reg.insert_shared(target, 1, 10, 64, mr_for(&table, &buf));
        assert!(reg.add_shared_reference(target));

        assert_eq!(reg.release_shared(target), Some(ReleaseOutcome::StillHeld));
        assert_eq!(
            reg.release_shared(target),
            Some(ReleaseOutcome::FullyReleased { pool: 1, key_handle: 10 })
        );
        assert_eq!(reg.release_shared(target), None);
        // registration dropped with the entry
        assert!(table.is_empty());
    }

    #[test]
    fn test_exclusive_release_and_rename() {
        let table = MrTable::new();
        let buf = vec![0u8; 64];
        let target = buf.as_ptr() as u64;
        let mut reg = LockRegistry::new();

        reg.insert_exclusive(target, 1, 11, 64, mr_for(&table, &buf));
        reg.add_pending_rename(target, 1, "___pending_k".into(), "k".into());
        assert!(reg.has_pending_rename(target));

        assert_eq!(
            reg.release_exclusive(target),
            Some(ReleaseOutcome::FullyReleased { pool: 1, key_handle: 11 })
        );
        let rename = reg.take_pending_rename(target).unwrap();
        assert_eq!(rename.to, "k");
        assert!(!reg.has_pending_rename(target));
    }

    #[test]
    fn test_space_refcounting() {
        let table = MrTable::new();
        let buf = vec![0u8; 128];
        let mut reg = LockRegistry::new();
        reg.add_space((0, 128), mr_for(&table, &buf));
        // second locate over the same range re-registers; entry keeps
        // the first registration
        reg.add_space((0, 128), mr_for(&table, &buf));
        assert!(reg.release_space((0, 128)).is_some());
        assert!(reg.release_space((0, 128)).is_some());
        assert!(reg.release_space((0, 128)).is_none());
    }
}
