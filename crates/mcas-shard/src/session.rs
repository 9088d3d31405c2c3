//! One client session: a channel plus the per-session pool table.

use mcas_transport::{Channel, RegisteredMemory};

use crate::pool_manager::PoolManager;

/// A connected client.
pub struct Session {
    /// Stable session id; tasks and ADO work requests refer to sessions
    /// by id so a disconnect cannot dangle.
    pub id: u64,
    /// The transport connection.
    pub channel: Box<dyn Channel>,
    /// Pools this session has open.
    pub pools: PoolManager,
    /// Authentication id from the most recent request; stamped into
    /// responses generated outside a request context (task and ADO
    /// completions fall back to the originating request's id instead).
    pub auth_id: u64,
    /// Pool regions pre-registered at pool create/open so two-stage
    /// transfers skip on-demand registration.
    pub premapped: Vec<RegisteredMemory>,
}

impl Session {
    /// Wrap a freshly accepted channel.
    pub fn new(id: u64, channel: Box<dyn Channel>) -> Self {
        Self {
            id,
            channel,
            pools: PoolManager::new(),
            auth_id: 0,
            premapped: Vec::new(),
        }
    }
}
