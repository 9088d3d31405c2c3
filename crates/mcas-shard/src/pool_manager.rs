//! Per-session table of opened pools.

use std::collections::HashMap;

use mcas_backend::PoolHandle;

/// What the session recorded about one open pool.
#[derive(Debug, Clone)]
pub struct PoolRecord {
    /// Pool name.
    pub name: String,
    /// Reference count of opens by this session.
    pub ref_count: u32,
    /// Expected object count given at create.
    pub expected_obj_count: u64,
    /// Pool size given at create.
    pub size: u64,
    /// Pool flags given at create/open.
    pub flags: u32,
}

/// Tracks which pools a session has open, with reference counts and a
/// name↔handle index.
#[derive(Debug, Default)]
pub struct PoolManager {
    pools: HashMap<PoolHandle, PoolRecord>,
    names: HashMap<String, PoolHandle>,
}

impl PoolManager {
    /// New, empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an open pool by name.
    pub fn check_for_open_pool(&self, name: &str) -> Option<PoolHandle> {
        self.names.get(name).copied()
    }

    /// True when `pool` is open in this session.
    pub fn is_pool_open(&self, pool: PoolHandle) -> bool {
        self.pools.contains_key(&pool)
    }

    /// Record a newly opened pool with a reference count of one.
    pub fn register_pool(
        &mut self,
        name: &str,
        pool: PoolHandle,
        expected_obj_count: u64,
        size: u64,
        flags: u32,
    ) {
        self.names.insert(name.to_string(), pool);
        self.pools.insert(
            pool,
            PoolRecord {
                name: name.to_string(),
                ref_count: 1,
                expected_obj_count,
                size,
                flags,
            },
        );
    }

    /// Add a reference to an already-open pool.
    pub fn add_reference(&mut self, pool: PoolHandle) {
        if let Some(rec) = self.pools.get_mut(&pool) {
            rec.ref_count += 1;
        }
    }

    /// Drop a reference. Returns `true` when the count reached zero and
    /// a real backend close is warranted (the record is removed).
    pub fn release_pool_reference(&mut self, pool: PoolHandle) -> bool {
        let Some(rec) = self.pools.get_mut(&pool) else {
            return false;
        };
        rec.ref_count -= 1;
        if rec.ref_count == 0 {
            let name = rec.name.clone();
            self.pools.remove(&pool);
            self.names.remove(&name);
            true
        } else {
            false
        }
    }

    /// Current reference count, 0 if not open.
    pub fn pool_reference_count(&self, pool: PoolHandle) -> u32 {
        self.pools.get(&pool).map(|r| r.ref_count).unwrap_or(0)
    }

    /// Name of an open pool.
    pub fn pool_name(&self, pool: PoolHandle) -> Option<&str> {
        self.pools.get(&pool).map(|r| r.name.as_str())
    }

    /// `(expected_obj_count, size, flags)` recorded at open.
    pub fn get_pool_info(&self, pool: PoolHandle) -> Option<(u64, u64, u32)> {
        self.pools
            .get(&pool)
            .map(|r| (r.expected_obj_count, r.size, r.flags))
    }

    /// Iterate the open pool set.
    pub fn open_pool_set(&self) -> impl Iterator<Item = (PoolHandle, &PoolRecord)> {
        self.pools.iter().map(|(h, r)| (*h, r))
    }

    /// Handles of every open pool.
    pub fn open_pool_handles(&self) -> Vec<PoolHandle> {
        self.pools.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_reference_counting() {
        let mut mgr = PoolManager::new();
        mgr.register_pool("p", 7, 100, 4096, 0);
        assert_eq!(mgr.check_for_open_pool("p"), Some(7));
        assert_eq!(mgr.pool_reference_count(7), 1);

        mgr.add_reference(7);
        assert_eq!(mgr.pool_reference_count(7), 2);

        assert!(!mgr.release_pool_reference(7));
        assert!(mgr.release_pool_reference(7));
        assert!(!mgr.is_pool_open(7));
        assert_eq!(mgr.check_for_open_pool("p"), None);
    }

    #[test]
    fn test_pool_info_round_trip() {
        let mut mgr = PoolManager::new();
        mgr.register_pool("p", 7, 42, 1 << 20, 3);
        assert_eq!(mgr.get_pool_info(7), Some((42, 1 << 20, 3)));
        assert_eq!(mgr.pool_name(7), Some("p"));
    }
}
