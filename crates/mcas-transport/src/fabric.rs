//! In-process loopback fabric with RDMA semantics.
//!
//! A connected pair shares two message queues and a registration table.
//! The client side can `rdma_write`/`rdma_read` directly against
//! registered ranges, which makes the two-stage transfer protocol
//! exercisable without hardware. Both ends must live in one process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::buffer::{BufferPool, BufferPoolConfig, PooledBuffer};
use crate::channel::{Action, Channel, Listener, MemorySlice, TickOutcome};
use crate::error::{Result, TransportError};
use crate::mr::{MrTable, RegisteredMemory};

struct Shared {
    c2s: Mutex<VecDeque<Vec<u8>>>,
    s2c: Mutex<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
    mr: Arc<MrTable>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            c2s: Mutex::new(VecDeque::new()),
            s2c: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            mr: MrTable::new(),
        })
    }
}

/// Create a loopback endpoint: a listener for the shard and a connector
/// handle for clients.
pub fn loopback_endpoint() -> (LoopbackListener, LoopbackConnector) {
    let pending = Arc::new(Mutex::new(VecDeque::new()));
    (
        LoopbackListener {
            pending: Arc::clone(&pending),
            buffer_config: BufferPoolConfig::default(),
        },
        LoopbackConnector { pending },
    )
}

/// Client-side connector; cloneable, usable from any thread.
#[derive(Clone)]
pub struct LoopbackConnector {
    pending: Arc<Mutex<VecDeque<Arc<Shared>>>>,
}

impl LoopbackConnector {
    /// Open a new connection to the listener.
    pub fn connect(&self) -> LoopbackClient {
        let shared = Shared::new();
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(Arc::clone(&shared));
        }
        LoopbackClient { shared }
    }
}

/// Shard-side listener for loopback connections.
pub struct LoopbackListener {
    pending: Arc<Mutex<VecDeque<Arc<Shared>>>>,
    buffer_config: BufferPoolConfig,
}

impl LoopbackListener {
    /// Override the send-buffer pool configuration for new channels.
    pub fn with_buffer_config(mut self, config: BufferPoolConfig) -> Self {
        self.buffer_config = config;
        self
    }
}

impl Listener for LoopbackListener {
    fn poll_accept(&mut self) -> Result<Option<Box<dyn Channel>>> {
        let shared = match self.pending.lock() {
            Ok(mut pending) => pending.pop_front(),
            Err(_) => None,
        };
        Ok(shared.map(|s| {
            Box::new(LoopbackChannel {
                shared: s,
                pool: BufferPool::new(self.buffer_config.clone()),
                actions: VecDeque::new(),
            }) as Box<dyn Channel>
        }))
    }

    fn local_addr(&self) -> String {
        "loopback".to_string()
    }
}

struct LoopbackChannel {
    shared: Arc<Shared>,
    pool: Arc<BufferPool>,
    actions: VecDeque<Action>,
}

impl Channel for LoopbackChannel {
    fn tick(&mut self) -> Result<TickOutcome> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(TickOutcome::Close);
        }
        let pending = self
            .shared
            .c2s
            .lock()
            .map(|q| !q.is_empty())
            .unwrap_or(false);
        if pending || !self.actions.is_empty() {
            Ok(TickOutcome::Progress)
        } else {
            Ok(TickOutcome::Idle)
        }
    }

    fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.shared.c2s.lock().ok()?.pop_front()
    }

    fn requeue_message(&mut self, msg: Vec<u8>) {
        if let Ok(mut q) = self.shared.c2s.lock() {
            q.push_front(msg);
        }
    }

    fn allocate_send(&mut self) -> Option<PooledBuffer> {
        self.pool.get()
    }

    fn send_buffer_size(&self) -> usize {
        self.pool.buffer_size()
    }

    fn post_response(&mut self, buf: PooledBuffer) -> Result<()> {
        let bytes = buf.take_bytes();
        self.shared
            .s2c
            .lock()
            .map_err(|_| TransportError::Closed)?
            .push_back(bytes);
        Ok(())
    }

    fn post_response_with_payload(
        &mut self,
        buf: PooledBuffer,
        payload: MemorySlice,
        action: Action,
    ) -> Result<()> {
        let mut bytes = buf.take_bytes();
        // SAFETY: the caller holds the backend lock and the registration
        // for this range until `action` is delivered, so the memory is
        // live and not concurrently resized.
        let payload_bytes =
            unsafe { std::slice::from_raw_parts(payload.addr as *const u8, payload.len) };
        bytes.extend_from_slice(payload_bytes);
        mcas_protocol::MessageHeader::patch_length(&mut bytes);
        self.shared
            .s2c
            .lock()
            .map_err(|_| TransportError::Closed)?
            .push_back(bytes);
        // loopback delivery is immediate; complete the send now
        self.actions.push_back(action);
        Ok(())
    }

    fn register_memory(&mut self, addr: u64, len: usize) -> Result<RegisteredMemory> {
        self.shared.mr.register(addr, len)
    }

    fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    fn peer(&self) -> String {
        "loopback-client".to_string()
    }
}

/// Client half of a loopback connection. Test drivers and co-located
/// clients use this directly.
pub struct LoopbackClient {
    shared: Arc<Shared>,
}

impl LoopbackClient {
    /// Send an encoded request to the shard.
    pub fn send(&self, msg: Vec<u8>) {
        if let Ok(mut q) = self.shared.c2s.lock() {
            q.push_back(msg);
        }
    }

    /// Take the next response, if one has arrived.
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.shared.s2c.lock().ok()?.pop_front()
    }

    /// Poll for a response until `timeout` elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.try_recv() {
                return Some(msg);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// RDMA-write `data` to `addr` under `rkey`.
    pub fn rdma_write(&self, rkey: u64, addr: u64, data: &[u8]) -> Result<()> {
        let dst = self.shared.mr.resolve(rkey, addr, data.len())?;
        // SAFETY: resolve bounds-checked the range against a live
        // registration; the registration holder keeps the memory alive.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len());
        }
        Ok(())
    }

    /// RDMA-read `len` bytes from `addr` under `rkey`.
    pub fn rdma_read(&self, rkey: u64, addr: u64, len: usize) -> Result<Vec<u8>> {
        let src = self.shared.mr.resolve(rkey, addr, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: as above.
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Close the connection; the shard sees `Close` on its next tick.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_message_round_trip() {
        let (mut listener, connector) = loopback_endpoint();
        let client = connector.connect();
        let mut channel = listener.poll_accept().unwrap().unwrap();

        client.send(b"ping".to_vec());
        assert_eq!(channel.tick().unwrap(), TickOutcome::Progress);
        assert_eq!(channel.pop_message().unwrap(), b"ping");

        let mut buf = channel.allocate_send().unwrap();
        buf.vec_mut().extend_from_slice(b"pong");
        channel.post_response(buf).unwrap();
        assert_eq!(client.try_recv().unwrap(), b"pong");
    }

    #[test]
    fn test_loopback_requeue_preserves_order() {
        let (mut listener, connector) = loopback_endpoint();
        let client = connector.connect();
        let mut channel = listener.poll_accept().unwrap().unwrap();
        client.send(b"first".to_vec());
        client.send(b"second".to_vec());
        let m = channel.pop_message().unwrap();
        channel.requeue_message(m);
        assert_eq!(channel.pop_message().unwrap(), b"first");
        assert_eq!(channel.pop_message().unwrap(), b"second");
    }

    #[test]
    fn test_loopback_rdma_write_and_read() {
        let (mut listener, connector) = loopback_endpoint();
        let client = connector.connect();
        let mut channel = listener.poll_accept().unwrap().unwrap();

        let mut target = vec![0u8; 64];
        let mr = channel
            .register_memory(target.as_mut_ptr() as u64, target.len())
            .unwrap();
        client.rdma_write(mr.rkey(), mr.addr(), b"written").unwrap();
        assert_eq!(&target[..7], b"written");
        let back = client.rdma_read(mr.rkey(), mr.addr(), 7).unwrap();
        assert_eq!(back, b"written");

        // out-of-bounds and stale-key accesses fail
        assert!(client.rdma_write(mr.rkey(), mr.addr() + 60, b"xxxxx").is_err());
        let rkey = mr.rkey();
        drop(mr);
        assert!(client.rdma_write(rkey, target.as_ptr() as u64, b"x").is_err());
    }

    #[test]
    fn test_loopback_close_surfaces_on_tick() {
        let (mut listener, connector) = loopback_endpoint();
        let client = connector.connect();
        let mut channel = listener.poll_accept().unwrap().unwrap();
        client.close();
        assert_eq!(channel.tick().unwrap(), TickOutcome::Close);
    }
}
