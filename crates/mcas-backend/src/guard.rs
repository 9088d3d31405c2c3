//! Scoped backend-lock ownership.

use crate::error::Result;
use crate::store::{KeyHandle, KvStore, PoolHandle, UnlockFlush};

/// Unlocks a key when dropped, unless responsibility has been released.
///
/// Handlers take a lock, then may hand the lock over to a registry that
/// releases it later (on a transport completion or an ADO completion).
/// Until that handoff the guard guarantees the lock is not leaked by an
/// early return; [`release`](LockedKey::release) nulls the guard's store
/// reference and forfeits ownership.
pub struct LockedKey<'a> {
    store: Option<&'a mut dyn KvStore>,
    pool: PoolHandle,
    handle: KeyHandle,
}

impl<'a> LockedKey<'a> {
    /// Take ownership of a held lock.
    pub fn new(store: &'a mut dyn KvStore, pool: PoolHandle, handle: KeyHandle) -> Self {
        Self {
            store: Some(store),
            pool,
            handle,
        }
    }

    /// The lock handle.
    pub fn handle(&self) -> KeyHandle {
        self.handle
    }

    /// Forfeit ownership; the caller (or a registry) becomes responsible
    /// for the eventual unlock.
    pub fn release(mut self) -> KeyHandle {
        self.store = None;
        self.handle
    }

    /// Unlock now, flushing value memory first.
    pub fn unlock_flush(mut self) -> Result<()> {
        match self.store.take() {
            Some(store) => store.unlock(self.pool, self.handle, UnlockFlush::Flush),
            None => Ok(()),
        }
    }
}

impl Drop for LockedKey<'_> {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(e) = store.unlock(self.pool, self.handle, UnlockFlush::None) {
                tracing::warn!(handle = self.handle, "unlock on guard drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapstore::MapStore;
    use crate::store::LockKind;

    #[test]
    fn test_guard_unlocks_on_drop() {
        let mut store = MapStore::new();
        let pool = store.create_pool("p", 1 << 20, 0, 0).unwrap();
        store.put(pool, "k", b"v", false).unwrap();
        let grant = store.lock(pool, "k", LockKind::Write, 0).unwrap();
        {
            let _guard = LockedKey::new(&mut store, pool, grant.handle);
        }
        // lock released by the guard: a second write lock succeeds
        let grant2 = store.lock(pool, "k", LockKind::Write, 0).unwrap();
        store.unlock(pool, grant2.handle, UnlockFlush::None).unwrap();
    }

    #[test]
    fn test_guard_release_forfeits_ownership() {
        let mut store = MapStore::new();
        let pool = store.create_pool("p", 1 << 20, 0, 0).unwrap();
        store.put(pool, "k", b"v", false).unwrap();
        let grant = store.lock(pool, "k", LockKind::Write, 0).unwrap();
        let handle = {
            let guard = LockedKey::new(&mut store, pool, grant.handle);
            guard.release()
        };
        // still locked; explicit unlock required
        assert!(store.lock(pool, "k", LockKind::Write, 0).is_err());
        store.unlock(pool, handle, UnlockFlush::None).unwrap();
    }
}
