//! Send-buffer pool.
//!
//! Response envelopes are always carved from a bounded pool of recycled
//! buffers; exhaustion returns `None` and is the dispatcher's
//! backpressure signal. Buffers return to the pool on drop.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Capacity of each buffer in bytes.
    pub buffer_size: usize,
    /// Number of buffers pre-allocated at construction.
    pub initial_count: usize,
    /// Maximum number of buffers the pool may grow to.
    pub max_count: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            initial_count: 8,
            max_count: 64,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolStats {
    /// Buffers ever allocated by this pool.
    pub total_allocated: usize,
    /// Buffers currently available.
    pub available: usize,
    /// Buffers currently checked out.
    pub in_use: usize,
}

/// A bounded pool of reusable byte buffers.
pub struct BufferPool {
    config: BufferPoolConfig,
    buffers: Mutex<VecDeque<Vec<u8>>>,
    total_allocated: AtomicUsize,
    in_use: AtomicUsize,
}

impl BufferPool {
    /// Create a pool, pre-allocating `initial_count` buffers.
    pub fn new(config: BufferPoolConfig) -> Arc<Self> {
        let mut buffers = VecDeque::with_capacity(config.initial_count);
        for _ in 0..config.initial_count {
            buffers.push_back(Vec::with_capacity(config.buffer_size));
        }
        let initial = buffers.len();
        Arc::new(BufferPool {
            config,
            buffers: Mutex::new(buffers),
            total_allocated: AtomicUsize::new(initial),
            in_use: AtomicUsize::new(0),
        })
    }

    /// Capacity of each pooled buffer.
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Take a buffer; grows up to `max_count`, then returns `None`.
    pub fn get(self: &Arc<Self>) -> Option<PooledBuffer> {
        let recycled = {
            let mut buffers = self.buffers.lock().ok()?;
            buffers.pop_front()
        };
        let buf = match recycled {
            Some(mut b) => {
                b.clear();
                b
            }
            None => {
                let total = self.total_allocated.load(Ordering::Relaxed);
                if total >= self.config.max_count {
                    return None;
                }
                self.total_allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.config.buffer_size)
            }
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    fn return_buffer(&self, buf: Vec<u8>) {
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.push_back(buf);
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        let available = self.buffers.lock().map(|b| b.len()).unwrap_or(0);
        BufferPoolStats {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            available,
            in_use: self.in_use.load(Ordering::Relaxed),
        }
    }
}

/// A buffer borrowed from the pool; returns to the pool on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Mutable access to the underlying vector for encoding into.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().unwrap_or_else(|| unreachable!("buffer taken"))
    }

    /// Encoded length.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// True when nothing has been encoded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach the bytes, leaving the allocation owed to the pool.
    pub(crate) fn take_bytes(mut self) -> Vec<u8> {
        let bytes = self.buf.take().unwrap_or_default();
        // account the checkout back in; the channel owns the bytes now
        self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
        self.pool.total_allocated.fetch_sub(1, Ordering::Relaxed);
        bytes
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_buffer(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_recycles_buffers() {
        let pool = BufferPool::new(BufferPoolConfig {
            buffer_size: 1024,
            initial_count: 2,
            max_count: 4,
        });
        let mut b = pool.get().unwrap();
        b.vec_mut().extend_from_slice(b"hello");
        assert_eq!(&b[..], b"hello");
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 2);
    }

    #[test]
    fn test_pool_exhaustion_returns_none() {
        let pool = BufferPool::new(BufferPoolConfig {
            buffer_size: 64,
            initial_count: 1,
            max_count: 2,
        });
        let b1 = pool.get().unwrap();
        let b2 = pool.get().unwrap();
        assert!(pool.get().is_none());
        drop(b1);
        assert!(pool.get().is_some());
        drop(b2);
    }

    #[test]
    fn test_pool_stats_track_use() {
        let pool = BufferPool::new(BufferPoolConfig {
            buffer_size: 64,
            initial_count: 3,
            max_count: 8,
        });
        let b1 = pool.get().unwrap();
        let b2 = pool.get().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.available, 1);
        drop(b1);
        drop(b2);
    }
}
