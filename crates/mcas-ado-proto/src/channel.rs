//! The bidirectional shard↔ADO channel.
//!
//! Segment layout, in order:
//!
//! ```text
//! [header 128B]
//! [s2a data ring] [s2a free ring] [a2s data ring] [a2s free ring]
//! [s2a slab: entry_count * entry_size]
//! [a2s slab: entry_count * entry_size]
//! ```
//!
//! Each slab entry starts with a `u32` payload length. The sender
//! allocates an entry index from its free ring, writes the message,
//! and publishes the index on its data ring; the receiver reads the
//! entry and returns the index on the free ring.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::error::{IpcError, Result};
use crate::messages::AdoMessage;
use crate::queue::{ring_bytes, SpscRing};
use crate::shm::SharedMemory;

const MAGIC: u64 = 0x4D43_4153_4144_4F21; // "MCASADO!"
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 128;

/// Sizing of one channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Bytes per slab entry (bounds one message).
    pub entry_size: u32,
    /// Entries per direction. The ring capacity is the next power of
    /// two at or above this.
    pub entry_count: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            entry_size: 4096,
            entry_count: 64,
        }
    }
}

impl ChannelConfig {
    fn ring_capacity(&self) -> u32 {
        self.entry_count.next_power_of_two()
    }

    fn segment_size(&self) -> usize {
        HEADER_SIZE
            + 4 * ring_bytes(self.ring_capacity())
            + 2 * (self.entry_count as usize * self.entry_size as usize)
    }
}

#[repr(C)]
struct Header {
    magic: u64,
    version: u32,
    entry_size: u32,
    entry_count: u32,
    _pad0: u32,
    shard_alive: AtomicU32,
    ado_alive: AtomicU32,
}

/// Which end of the channel this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The shard side (creates the segment).
    Shard,
    /// The ADO process side (opens the segment).
    Ado,
}

/// One end of a shard↔ADO channel.
pub struct AdoEndpoint {
    shm: SharedMemory,
    role: Role,
    tx_data: SpscRing,
    tx_free: SpscRing,
    rx_data: SpscRing,
    rx_free: SpscRing,
    tx_slab: *mut u8,
    rx_slab: *mut u8,
    entry_size: usize,
}

// SAFETY: all shared state is accessed through the SPSC rings and
// atomics; an endpoint is used from one thread at a time.
unsafe impl Send for AdoEndpoint {}

impl AdoEndpoint {
    /// Create the channel segment (shard side).
    pub fn create(name: &str, config: ChannelConfig) -> Result<Self> {
        let shm = SharedMemory::create(name, config.segment_size())?;
        let base = shm.as_ptr();
        // SAFETY: fresh zeroed mapping of segment_size bytes.
        unsafe {
            let header = base as *mut Header;
            std::ptr::write(
                header,
                Header {
                    magic: MAGIC,
                    version: VERSION,
                    entry_size: config.entry_size,
                    entry_count: config.entry_count,
                    _pad0: 0,
                    shard_alive: AtomicU32::new(1),
                    ado_alive: AtomicU32::new(0),
                },
            );
        }
        let mut endpoint = Self::attach(shm, Role::Shard, config, true)?;
        // pre-fill both free rings with every slab index
        for i in 0..config.entry_count {
            if !endpoint.tx_free.push(i) || !endpoint.rx_free.push(i) {
                return Err(IpcError::LayoutMismatch("free ring smaller than slab"));
            }
        }
        debug!(name, "created ADO channel");
        Ok(endpoint)
    }

    /// Open an existing channel segment (ADO side).
    pub fn open(name: &str) -> Result<Self> {
        // map the header alone to learn the sizing, then remap in full
        let probe = SharedMemory::open(name, HEADER_SIZE)?;
        let config = {
            // SAFETY: the creator wrote a Header at the segment base.
            let header = unsafe { &*(probe.as_ptr() as *const Header) };
            if header.magic != MAGIC {
                return Err(IpcError::LayoutMismatch("bad magic"));
            }
            if header.version != VERSION {
                return Err(IpcError::LayoutMismatch("version mismatch"));
            }
            ChannelConfig {
                entry_size: header.entry_size,
                entry_count: header.entry_count,
            }
        };
        drop(probe);
        let shm = SharedMemory::open(name, config.segment_size())?;
        let endpoint = Self::attach(shm, Role::Ado, config, false)?;
        // SAFETY: header lives for the mapping's lifetime.
        let header = unsafe { &*(endpoint.shm.as_ptr() as *const Header) };
        header.ado_alive.store(1, Ordering::Release);
        Ok(endpoint)
    }

    fn attach(shm: SharedMemory, role: Role, config: ChannelConfig, init: bool) -> Result<Self> {
        let capacity = config.ring_capacity();
        let rb = ring_bytes(capacity);
        let base = shm.as_ptr();
        let slab_len = config.entry_count as usize * config.entry_size as usize;
        // SAFETY: offsets are within segment_size by construction.
        let (s2a_data, s2a_free, a2s_data, a2s_free, s2a_slab, a2s_slab) = unsafe {
            let r0 = base.add(HEADER_SIZE);
            let r1 = r0.add(rb);
            let r2 = r1.add(rb);
            let r3 = r2.add(rb);
            let s0 = r3.add(rb);
            let s1 = s0.add(slab_len);
            if init {
                (
                    SpscRing::init(r0, capacity),
                    SpscRing::init(r1, capacity),
                    SpscRing::init(r2, capacity),
                    SpscRing::init(r3, capacity),
                    s0,
                    s1,
                )
            } else {
                (
                    SpscRing::attach(r0, capacity),
                    SpscRing::attach(r1, capacity),
                    SpscRing::attach(r2, capacity),
                    SpscRing::attach(r3, capacity),
                    s0,
                    s1,
                )
            }
        };
        let (tx_data, tx_free, rx_data, rx_free, tx_slab, rx_slab) = match role {
            Role::Shard => (s2a_data, s2a_free, a2s_data, a2s_free, s2a_slab, a2s_slab),
            Role::Ado => (a2s_data, a2s_free, s2a_data, s2a_free, a2s_slab, s2a_slab),
        };
        Ok(Self {
            shm,
            role,
            tx_data,
            tx_free,
            rx_data,
            rx_free,
            tx_slab,
            rx_slab,
            entry_size: config.entry_size as usize,
        })
    }

    fn header(&self) -> &Header {
        // SAFETY: the creator wrote a Header at the segment base and the
        // mapping outlives self.
        unsafe { &*(self.shm.as_ptr() as *const Header) }
    }

    /// Send a message; `Full` when all buffers are in flight.
    pub fn send(&mut self, msg: &AdoMessage) -> Result<()> {
        let bytes = msg.encode()?;
        if bytes.len() + 4 > self.entry_size {
            return Err(IpcError::FieldTooLarge {
                field: "message",
                len: bytes.len(),
            });
        }
        let idx = self.tx_free.pop().ok_or(IpcError::Full)?;
        // SAFETY: idx < entry_count, so the slot is within the slab; the
        // slot is exclusively ours until published on the data ring.
        unsafe {
            let slot = self.tx_slab.add(idx as usize * self.entry_size);
            slot.cast::<u32>().write_unaligned(bytes.len() as u32);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.add(4), bytes.len());
        }
        if !self.tx_data.push(idx) {
            // data ring capacity >= entry_count, so this cannot happen
            // unless the segment is corrupt
            self.tx_free.push(idx);
            return Err(IpcError::Full);
        }
        Ok(())
    }

    /// Receive the next message, if any. Unblock sentinels are
    /// swallowed.
    pub fn try_recv(&mut self) -> Result<Option<AdoMessage>> {
        loop {
            let idx = match self.rx_data.pop() {
                Some(idx) => idx,
                None => return Ok(None),
            };
            // SAFETY: the sender published this slot on the data ring and
            // will not touch it until it returns via the free ring.
            let msg = unsafe {
                let slot = self.rx_slab.add(idx as usize * self.entry_size);
                let len = slot.cast::<u32>().read_unaligned() as usize;
                if len + 4 > self.entry_size {
                    self.rx_free.push(idx);
                    return Err(IpcError::BadMessage("entry length out of range"));
                }
                let bytes = std::slice::from_raw_parts(slot.add(4), len);
                AdoMessage::decode(bytes)
            };
            self.rx_free.push(idx);
            match msg? {
                AdoMessage::Unblock => continue,
                other => return Ok(Some(other)),
            }
        }
    }

    /// Post an unblock sentinel to wake a sleeping peer. Best effort.
    pub fn unblock(&mut self) {
        let _ = self.send(&AdoMessage::Unblock);
    }

    /// True while the peer end is attached and running.
    pub fn peer_alive(&self) -> bool {
        let h = self.header();
        match self.role {
            Role::Shard => h.ado_alive.load(Ordering::Acquire) == 1,
            Role::Ado => h.shard_alive.load(Ordering::Acquire) == 1,
        }
    }

    /// Mark this end gone; the peer observes it via
    /// [`peer_alive`](Self::peer_alive).
    pub fn mark_shutdown(&self) {
        let h = self.header();
        match self.role {
            Role::Shard => h.shard_alive.store(0, Ordering::Release),
            Role::Ado => h.ado_alive.store(0, Ordering::Release),
        }
    }
}

impl Drop for AdoEndpoint {
    fn drop(&mut self) {
        self.mark_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::AtomicU32;
        static N: AtomicU32 = AtomicU32::new(0);
        format!(
            "mcas-ado-test-{tag}-{}-{}",
            std::process::id(),
            N.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_channel_bidirectional() {
        let name = unique_name("bidi");
        let mut shard = AdoEndpoint::create(&name, ChannelConfig::default()).unwrap();
        let mut ado = AdoEndpoint::open(&name).unwrap();
        assert!(shard.peer_alive());
        assert!(ado.peer_alive());

        shard
            .send(&AdoMessage::OpEvent {
                op: crate::messages::AdoOp::PoolDelete,
            })
            .unwrap();
        let got = ado.try_recv().unwrap().unwrap();
        assert!(matches!(got, AdoMessage::OpEvent { .. }));

        ado.send(&AdoMessage::ConfigureRequest { options: 1 }).unwrap();
        let got = shard.try_recv().unwrap().unwrap();
        assert_eq!(got, AdoMessage::ConfigureRequest { options: 1 });
    }

    #[test]
    fn test_channel_backpressure_and_recycle() {
        let name = unique_name("full");
        let config = ChannelConfig {
            entry_size: 512,
            entry_count: 4,
        };
        let mut shard = AdoEndpoint::create(&name, config).unwrap();
        let mut ado = AdoEndpoint::open(&name).unwrap();

        for _ in 0..4 {
            shard.send(&AdoMessage::PoolInfoRequest).unwrap();
        }
        assert!(matches!(
            shard.send(&AdoMessage::PoolInfoRequest),
            Err(IpcError::Full)
        ));
        // draining one frees a slot
        assert!(ado.try_recv().unwrap().is_some());
        shard.send(&AdoMessage::PoolInfoRequest).unwrap();
    }

    #[test]
    fn test_unblock_is_swallowed() {
        let name = unique_name("unblock");
        let mut shard = AdoEndpoint::create(&name, ChannelConfig::default()).unwrap();
        let mut ado = AdoEndpoint::open(&name).unwrap();
        shard.unblock();
        shard.send(&AdoMessage::Shutdown).unwrap();
        assert_eq!(ado.try_recv().unwrap(), Some(AdoMessage::Shutdown));
    }

    #[test]
    fn test_shutdown_visibility() {
        let name = unique_name("down");
        let shard = AdoEndpoint::create(&name, ChannelConfig::default()).unwrap();
        let ado = AdoEndpoint::open(&name).unwrap();
        shard.mark_shutdown();
        assert!(!ado.peer_alive());
    }
}
