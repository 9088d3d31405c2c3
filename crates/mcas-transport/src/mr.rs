//! Memory registration.
//!
//! Registering a range yields an opaque remote key a peer can present
//! to access the range. Registrations are tracked in a table shared
//! with the peer-facing side of the provider; dropping the
//! [`RegisteredMemory`] deregisters the range.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, TransportError};

static RKEY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Shared table of registered ranges, keyed by remote key.
#[derive(Default)]
pub struct MrTable {
    ranges: Mutex<HashMap<u64, (u64, usize)>>,
}

impl MrTable {
    /// Create an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `[addr, addr+len)` and mint a remote key for it.
    pub fn register(self: &Arc<Self>, addr: u64, len: usize) -> Result<RegisteredMemory> {
        if addr == 0 || len == 0 {
            return Err(TransportError::RegistrationFailed {
                reason: "null or empty range",
            });
        }
        let rkey = RKEY_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.ranges
            .lock()
            .map_err(|_| TransportError::RegistrationFailed {
                reason: "registration table poisoned",
            })?
            .insert(rkey, (addr, len));
        Ok(RegisteredMemory {
            addr,
            len,
            rkey,
            table: Arc::clone(self),
        })
    }

    /// Resolve an rkey-scoped access to a raw address, bounds-checked.
    pub fn resolve(&self, rkey: u64, addr: u64, len: usize) -> Result<u64> {
        let ranges = self.ranges.lock().map_err(|_| TransportError::UnknownRkey(rkey))?;
        let (base, range_len) = *ranges.get(&rkey).ok_or(TransportError::UnknownRkey(rkey))?;
        let end = base + range_len as u64;
        if addr < base || addr.saturating_add(len as u64) > end {
            return Err(TransportError::AccessOutOfBounds { rkey, addr, len });
        }
        Ok(addr)
    }

    fn deregister(&self, rkey: u64) {
        if let Ok(mut ranges) = self.ranges.lock() {
            ranges.remove(&rkey);
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.ranges.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// True when no registrations are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered memory range; deregisters on drop.
pub struct RegisteredMemory {
    addr: u64,
    len: usize,
    rkey: u64,
    table: Arc<MrTable>,
}

impl RegisteredMemory {
    /// Base address of the registered range.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Length of the registered range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty range (never constructed in practice).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The remote key authorizing peer access.
    pub fn rkey(&self) -> u64 {
        self.rkey
    }
}

impl std::fmt::Debug for RegisteredMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMemory")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("rkey", &format_args!("{:#x}", self.rkey))
            .finish()
    }
}

impl Drop for RegisteredMemory {
    fn drop(&mut self) {
        self.table.deregister(self.rkey);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_resolve_deregister() {
        let table = MrTable::new();
        let buf = vec![0u8; 4096];
        let mr = table.register(buf.as_ptr() as u64, buf.len()).unwrap();
        let rkey = mr.rkey();
        assert_eq!(table.resolve(rkey, mr.addr(), 4096).unwrap(), mr.addr());
        assert!(table.resolve(rkey, mr.addr() + 1, 4096).is_err());
        drop(mr);
        assert!(matches!(
            table.resolve(rkey, buf.as_ptr() as u64, 1),
            Err(TransportError::UnknownRkey(_))
        ));
    }

    #[test]
    fn test_register_rejects_empty_range() {
        let table = MrTable::new();
        assert!(table.register(0, 16).is_err());
        assert!(table.register(0x1000, 0).is_err());
    }
}
