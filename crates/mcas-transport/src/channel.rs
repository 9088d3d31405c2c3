//! Provider-neutral channel and listener traits.

use crate::buffer::PooledBuffer;
use crate::error::Result;
use crate::mr::RegisteredMemory;

/// Verdict of one channel tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing happened.
    Idle,
    /// I/O or completions were processed.
    Progress,
    /// The peer is gone; the session must be shut down.
    Close,
}

/// A deferred action bound to a transport completion, keyed by the
/// target address of a locked value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Release a shared value lock.
    ReleaseSharedValueLock(u64),
    /// Release an exclusive value lock and resolve its pending rename.
    ReleaseExclusiveValueLock(u64),
}

/// A raw `{addr, len}` slice of registered memory posted as a payload.
#[derive(Debug, Clone, Copy)]
pub struct MemorySlice {
    /// Payload base address.
    pub addr: u64,
    /// Payload length.
    pub len: usize,
}

/// One client connection, driven entirely by polling.
pub trait Channel: Send {
    /// Advance I/O and completion processing.
    fn tick(&mut self) -> Result<TickOutcome>;

    /// Take the oldest pending inbound message, if any.
    fn pop_message(&mut self) -> Option<Vec<u8>>;

    /// Put a message back at the head of the queue. Used when a handler
    /// cannot obtain resources and the message must be retried on a
    /// later tick.
    fn requeue_message(&mut self, msg: Vec<u8>);

    /// Allocate a send buffer. `None` signals backpressure: the caller
    /// must not consume the request it is serving.
    fn allocate_send(&mut self) -> Option<PooledBuffer>;

    /// Capacity of one send buffer, for inline-vs-two-stage decisions.
    fn send_buffer_size(&self) -> usize;

    /// Post an encoded response.
    fn post_response(&mut self, buf: PooledBuffer) -> Result<()>;

    /// Post a response header paired with a payload read from registered
    /// memory. `action` fires when transmission of the payload completes.
    ///
    /// The caller must keep the payload range locked and registered
    /// until the action is delivered back via [`poll_action`].
    ///
    /// [`poll_action`]: Channel::poll_action
    fn post_response_with_payload(
        &mut self,
        buf: PooledBuffer,
        payload: MemorySlice,
        action: Action,
    ) -> Result<()>;

    /// Register a memory range for remote access.
    fn register_memory(&mut self, addr: u64, len: usize) -> Result<RegisteredMemory>;

    /// Take the next completion-driven deferred action, if any.
    fn poll_action(&mut self) -> Option<Action>;

    /// Human-readable peer description for logging.
    fn peer(&self) -> String;
}

/// Accepts new connections without blocking.
pub trait Listener: Send {
    /// Poll for one new connection.
    fn poll_accept(&mut self) -> Result<Option<Box<dyn Channel>>>;

    /// Local endpoint description for logging.
    fn local_addr(&self) -> String;
}
