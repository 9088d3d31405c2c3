//! The shard: dispatcher state and the cooperative event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcas_backend::{BackendError, KvStore, LockKind, PoolHandle, UnlockFlush};
use mcas_protocol::{
    Attribute, InfoRequest, InfoResponse, IoFlags, IoOp, IoRequest, IoResponse, MessageHeader,
    MsgType, PoolFlags, PoolOp, PoolRequest, PoolResponse, PutAdoRequest, ShardStats,
    StatsResponse, Status, AdoRequest, HEADER_SIZE, PENDING_KEY_PREFIX, TWO_STAGE_THRESHOLD,
};
use mcas_transport::{Action, Listener, MemorySlice, PooledBuffer, TickOutcome};
use tracing::{debug, error, info, warn};

use crate::ado::{AdoCoordinator, PoolDesc};
use crate::cluster::ClusterSignalQueue;
use crate::config::ShardConfig;
use crate::crc32::crc32;
use crate::error::{Result, ShardError};
use crate::index::IndexMap;
use crate::registry::{LockRegistry, ReleaseOutcome};
use crate::session::Session;
use crate::signals;
use crate::tasks::{KeyFindTask, TaskStep};

/// Ticks between polls for new connections.
pub const CONNECTION_CHECK_INTERVAL: u64 = 1000;
/// Ticks between cluster-signal drains.
pub const CLUSTER_SIGNAL_INTERVAL: u64 = 10_000;
/// Sleep when no session is connected.
pub const SESSIONS_EMPTY_SLEEP: Duration = Duration::from_millis(50);

/// Fixed bytes of an IO response ahead of any payload.
const IO_RESPONSE_OVERHEAD: usize = HEADER_SIZE + 24;

struct TaskEntry {
    task: KeyFindTask,
    /// A completed step waiting for a send buffer.
    pending: Option<TaskStep>,
}

/// Dispatcher state: everything the shard owns besides its sessions.
pub struct ShardState {
    pub(crate) config: ShardConfig,
    pub(crate) store: Box<dyn KvStore>,
    pub(crate) registry: LockRegistry,
    pub(crate) indices: IndexMap,
    pub(crate) ado: AdoCoordinator,
    pub(crate) stats: ShardStats,
    /// Failed asynchronous ADO requests: `(request_id, status)`.
    pub(crate) failed_async: Vec<(u64, Status)>,
    tasks: Vec<TaskEntry>,
}

impl ShardState {
    fn new(config: ShardConfig, store: Box<dyn KvStore>) -> Self {
        Self {
            config,
            store,
            registry: LockRegistry::new(),
            indices: IndexMap::new(),
            ado: AdoCoordinator::new(),
            stats: ShardStats::default(),
            failed_async: Vec::new(),
            tasks: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // dispatch

    /// Process one inbound message. `ResourceUnavailable` means the
    /// message was not consumed and must be requeued by the caller.
    pub fn process_message(&mut self, session: &mut Session, buf: &[u8]) -> Result<()> {
        let msg_type = MessageHeader::peek_type(buf)?;
        let outcome = match msg_type {
            MsgType::PoolRequest => match PoolRequest::decode(buf) {
                Ok(msg) => {
                    session.auth_id = msg.auth_id;
                    self.process_pool_request(session, &msg)
                }
                Err(e) => self.respond_decode_error(session, buf, msg_type, e),
            },
            MsgType::IoRequest => match IoRequest::decode(buf) {
                Ok(msg) => {
                    session.auth_id = msg.auth_id;
                    self.process_io_request(session, &msg)
                }
                Err(e) => self.respond_decode_error(session, buf, msg_type, e),
            },
            MsgType::AdoRequest => match AdoRequest::decode(buf) {
                Ok(msg) => {
                    session.auth_id = msg.auth_id;
                    self.process_ado_request(session, &msg)
                }
                Err(e) => self.respond_decode_error(session, buf, msg_type, e),
            },
            MsgType::PutAdoRequest => match PutAdoRequest::decode(buf) {
                Ok(msg) => {
                    session.auth_id = msg.auth_id;
                    self.process_put_ado_request(session, &msg)
                }
                Err(e) => self.respond_decode_error(session, buf, msg_type, e),
            },
            MsgType::InfoRequest => match InfoRequest::decode(buf) {
                Ok(msg) => {
                    session.auth_id = msg.auth_id;
                    self.process_info_request(session, &msg)
                }
                Err(e) => self.respond_decode_error(session, buf, msg_type, e),
            },
            other => {
                // inbound traffic must be a request type
                warn!(?other, "unexpected inbound message type");
                Err(ShardError::Protocol(
                    mcas_protocol::ProtocolError::UnknownMsgType(other as u16),
                ))
            }
        };
        // a requeued message is the same logical request; count it only
        // on the attempt that consumes it
        if !matches!(outcome, Err(ShardError::ResourceUnavailable)) {
            self.stats.op_request_count += 1;
            if matches!(msg_type, MsgType::AdoRequest | MsgType::PutAdoRequest) {
                self.stats.op_ado_count += 1;
            }
        }
        match outcome {
            Err(ShardError::Backend(e)) => {
                // a handler let a backend error escape; the shard carries on
                warn!("backend error escaped a handler: {e}");
                self.stats.op_failed_request_count += 1;
                Ok(())
            }
            other => other,
        }
    }

    /// Malformed body: reply `Inval`, keyed off the header if readable.
    fn respond_decode_error(
        &mut self,
        session: &mut Session,
        buf: &[u8],
        msg_type: MsgType,
        err: mcas_protocol::ProtocolError,
    ) -> Result<()> {
        let Ok(header) = MessageHeader::decode(buf) else {
            warn!(?msg_type, "malformed request with unreadable header: {err}");
            self.stats.op_failed_request_count += 1;
            return Ok(()); // not even a header to answer to
        };
        let mut iob = session
            .channel
            .allocate_send()
            .ok_or(ShardError::ResourceUnavailable)?;
        warn!(?msg_type, "malformed request: {err}");
        self.stats.op_failed_request_count += 1;
        match msg_type {
            MsgType::PoolRequest => PoolResponse {
                auth_id: header.auth_id,
                request_id: header.request_id,
                status: Status::Inval,
                pool_id: 0,
            }
            .encode(iob.vec_mut()),
            MsgType::InfoRequest => {
                InfoResponse::status_only(header.auth_id, header.request_id, Status::Inval)
                    .encode(iob.vec_mut())
            }
            _ => IoResponse::status_only(header.auth_id, header.request_id, Status::Inval)
                .encode(iob.vec_mut()),
        }
        session.channel.post_response(iob)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // pool operations

    fn process_pool_request(&mut self, session: &mut Session, msg: &PoolRequest) -> Result<()> {
        let iob = session
            .channel
            .allocate_send()
            .ok_or(ShardError::ResourceUnavailable)?;
        match msg.op {
            PoolOp::Create => self.pool_create(session, msg, iob),
            PoolOp::Open => self.pool_open(session, msg, iob),
            PoolOp::Close => self.pool_close(session, msg, iob),
            PoolOp::Delete => self.pool_delete(session, msg, iob),
        }
    }

    fn respond_pool(
        &mut self,
        session: &mut Session,
        msg: &PoolRequest,
        mut iob: PooledBuffer,
        status: Status,
        pool_id: PoolHandle,
    ) -> Result<()> {
        if !status.is_ok() {
            self.stats.op_failed_request_count += 1;
        }
        PoolResponse {
            auth_id: msg.auth_id,
            request_id: msg.request_id,
            status,
            pool_id,
        }
        .encode(iob.vec_mut());
        session.channel.post_response(iob)?;
        Ok(())
    }

    fn premap_pool_regions(&mut self, session: &mut Session, pool: PoolHandle) {
        match self.store.pool_regions(pool) {
            Ok(regions) => {
                for r in &regions {
                    match session.channel.register_memory(r.base, r.len) {
                        Ok(mr) => session.premapped.push(mr),
                        Err(e) => debug!("region pre-registration failed: {e}"),
                    }
                }
            }
            Err(_) => debug!(pool, "pool region query not supported, using on-demand"),
        }
    }

    /// Erase sentinels left behind by an interrupted two-stage write.
    fn recover_pending_keys(&mut self, pool: PoolHandle) {
        let mut orphans = Vec::new();
        let _ = self.store.map_keys(pool, &mut |k| {
            if k.starts_with(PENDING_KEY_PREFIX) {
                orphans.push(k.to_string());
            }
        });
        for key in orphans {
            warn!(pool, %key, "erasing orphaned two-stage sentinel");
            if let Err(e) = self.store.erase(pool, &key) {
                warn!(pool, %key, "sentinel erase failed: {e}");
            }
        }
    }

    fn pool_create(
        &mut self,
        session: &mut Session,
        msg: &PoolRequest,
        iob: PooledBuffer,
    ) -> Result<()> {
        let flags = PoolFlags::from_bits_truncate(msg.flags);
        debug!(name = %msg.name, size = msg.pool_size, "POOL CREATE");

        if let Some(pool) = session.pools.check_for_open_pool(&msg.name) {
            if flags.contains(PoolFlags::CREATE_ONLY) {
                warn!(name = %msg.name, "create denied: create-only on an open pool");
                return self.respond_pool(session, msg, iob, Status::Fail, 0);
            }
            session.pools.add_reference(pool);
            return self.respond_pool(session, msg, iob, Status::Ok, pool);
        }

        let mut opened_existing = false;
        let pool = match self.store.create_pool(
            &msg.name,
            msg.pool_size,
            msg.flags,
            msg.expected_obj_count,
        ) {
            Ok(pool) => pool,
            Err(BackendError::AlreadyExists(_)) => {
                if flags.contains(PoolFlags::CREATE_ONLY) {
                    return self.respond_pool(session, msg, iob, Status::Fail, 0);
                }
                opened_existing = true;
                match self.store.open_pool(&msg.name) {
                    Ok(pool) => pool,
                    Err(e) => {
                        warn!(name = %msg.name, "unable to open existing pool: {e}");
                        return self.respond_pool(session, msg, iob, Status::PoolError, 0);
                    }
                }
            }
            Err(e) => {
                warn!(name = %msg.name, "unable to create pool: {e}");
                return self.respond_pool(session, msg, iob, Status::PoolError, 0);
            }
        };

        session
            .pools
            .register_pool(&msg.name, pool, msg.expected_obj_count, msg.pool_size, msg.flags);
        self.premap_pool_regions(session, pool);
        if opened_existing {
            self.recover_pending_keys(pool);
        }

        if self.ado_enabled() {
            let desc = PoolDesc {
                name: msg.name.clone(),
                size: msg.pool_size,
                flags: msg.flags,
                expected_obj_count: msg.expected_obj_count,
                opened_existing,
            };
            if let Err(e) = self.conditional_bootstrap_ado(session, pool, desc) {
                warn!(name = %msg.name, "ADO bootstrap failed: {e}");
            }
        }
        debug!(name = %msg.name, pool = format_args!("{pool:#x}"), "POOL CREATE ok");
        self.respond_pool(session, msg, iob, Status::Ok, pool)
    }

    fn pool_open(
        &mut self,
        session: &mut Session,
        msg: &PoolRequest,
        iob: PooledBuffer,
    ) -> Result<()> {
        debug!(name = %msg.name, "POOL OPEN");
        if let Some(pool) = session.pools.check_for_open_pool(&msg.name) {
            session.pools.add_reference(pool);
            return self.respond_pool(session, msg, iob, Status::Ok, pool);
        }
        let pool = match self.store.open_pool(&msg.name) {
            Ok(pool) => pool,
            Err(e) => {
                debug!(name = %msg.name, "open failed: {e}");
                return self.respond_pool(session, msg, iob, Status::Inval, 0);
            }
        };
        session.pools.register_pool(&msg.name, pool, 0, 0, msg.flags);
        self.premap_pool_regions(session, pool);
        self.recover_pending_keys(pool);
        if self.ado_enabled() {
            let desc = PoolDesc {
                name: msg.name.clone(),
                size: msg.pool_size,
                flags: msg.flags,
                expected_obj_count: msg.expected_obj_count,
                opened_existing: true,
            };
            if let Err(e) = self.conditional_bootstrap_ado(session, pool, desc) {
                warn!(name = %msg.name, "ADO bootstrap failed: {e}");
            }
        }
        self.respond_pool(session, msg, iob, Status::Ok, pool)
    }

    fn pool_close(
        &mut self,
        session: &mut Session,
        msg: &PoolRequest,
        iob: PooledBuffer,
    ) -> Result<()> {
        debug!(pool = format_args!("{:#x}", msg.pool_id), "POOL CLOSE");
        if !session.pools.is_pool_open(msg.pool_id) {
            return self.respond_pool(session, msg, iob, Status::Inval, 0);
        }
        if session.pools.release_pool_reference(msg.pool_id) {
            debug!(pool = format_args!("{:#x}", msg.pool_id), "pool reference now zero");
            if self.ado_enabled() {
                self.release_ado_for_pool(msg.pool_id);
            }
            let status = match self.store.close_pool(msg.pool_id) {
                Ok(()) => Status::Ok,
                Err(e) => {
                    warn!("close_pool failed: {e}");
                    e.status()
                }
            };
            self.respond_pool(session, msg, iob, status, 0)
        } else {
            self.respond_pool(session, msg, iob, Status::Ok, 0)
        }
    }

    fn pool_delete(
        &mut self,
        session: &mut Session,
        msg: &PoolRequest,
        iob: PooledBuffer,
    ) -> Result<()> {
        info!(pool = format_args!("{:#x}", msg.pool_id), name = %msg.name, "POOL DELETE");
        if msg.pool_id > 0 && session.pools.is_pool_open(msg.pool_id) {
            if session.pools.pool_reference_count(msg.pool_id) != 1 {
                return self.respond_pool(session, msg, iob, Status::Busy, 0);
            }
            let Some(name) = session.pools.pool_name(msg.pool_id).map(str::to_string) else {
                return self.respond_pool(session, msg, iob, Status::Inval, 0);
            };
            if !session.pools.release_pool_reference(msg.pool_id) {
                return Err(ShardError::Logic("unexpected pool reference count".into()));
            }
            if self.ado_enabled() && self.ado.slot_for_pool(msg.pool_id).is_some() {
                // deletion completes when the ADO acknowledges the event;
                // the shard thread must not block waiting for it
                if let Some(proxy) = self.ado.proxy_for_pool(msg.pool_id) {
                    proxy
                        .endpoint
                        .send(&mcas_ado_proto::AdoMessage::OpEvent {
                            op: mcas_ado_proto::AdoOp::PoolDelete,
                        })?;
                }
                return self.respond_pool(session, msg, iob, Status::Ok, 0);
            }
            self.store.close_pool(msg.pool_id)?;
            let status = match self.store.delete_pool(&name) {
                Ok(()) => Status::Ok,
                Err(e) => {
                    warn!("pool delete failed: {e}");
                    Status::Fail
                }
            };
            return self.respond_pool(session, msg, iob, status, 0);
        }

        // delete by name
        if session.pools.check_for_open_pool(&msg.name).is_some() {
            debug!(name = %msg.name, "delete on pool that is still open");
            return self.respond_pool(session, msg, iob, Status::AlreadyOpen, 0);
        }
        let status = match self.store.delete_pool(&msg.name) {
            Ok(()) => Status::Ok,
            Err(e) => e.status(),
        };
        self.respond_pool(session, msg, iob, status, 0)
    }

    // ------------------------------------------------------------------
    // IO operations

    fn process_io_request(&mut self, session: &mut Session, msg: &IoRequest) -> Result<()> {
        // the envelope comes out of the pool before any work so that
        // backpressure has one clear failure site
        let iob = session
            .channel
            .allocate_send()
            .ok_or(ShardError::ResourceUnavailable)?;
        match msg.op {
            IoOp::Put => self.io_put(session, msg, iob),
            IoOp::Get => self.io_get(session, msg, iob),
            IoOp::Erase => self.io_erase(session, msg, iob),
            IoOp::Configure => {
                let status = self.process_configure(msg);
                self.respond_io(session, msg, iob, status)
            }
            IoOp::PutAdvance | IoOp::PutLocate => self.io_put_locate(session, msg, iob),
            IoOp::PutRelease => self.io_put_release(session, msg, iob),
            IoOp::GetLocate => self.io_get_locate(session, msg, iob),
            IoOp::GetRelease => self.io_get_release(session, msg, iob),
            IoOp::Locate => self.io_locate(session, msg, iob),
            IoOp::Release => self.io_release(session, msg, iob),
            IoOp::ReleaseWithFlush => self.io_release_with_flush(session, msg, iob),
        }
    }

    fn respond_io(
        &mut self,
        session: &mut Session,
        msg: &IoRequest,
        mut iob: PooledBuffer,
        status: Status,
    ) -> Result<()> {
        if !status.is_ok() {
            self.stats.op_failed_request_count += 1;
        }
        IoResponse::status_only(msg.auth_id, msg.request_id, status).encode(iob.vec_mut());
        session.channel.post_response(iob)?;
        Ok(())
    }

    fn io_put(&mut self, session: &mut Session, msg: &IoRequest, iob: PooledBuffer) -> Result<()> {
        let flags = IoFlags::from_bits_truncate(msg.flags);
        debug!(key = %msg.key, len = msg.value.len(), "PUT");
        let status = match self
            .store
            .put(msg.pool_id, &msg.key, &msg.value, flags.contains(IoFlags::DONT_STOMP))
        {
            Ok(_) => {
                self.indices.add_key(msg.pool_id, &msg.key);
                Status::Ok
            }
            Err(e) => {
                debug!(key = %msg.key, "put failed: {e}");
                e.status()
            }
        };
        self.stats.op_put_count += 1;
        self.respond_io(session, msg, iob, status)
    }

    fn io_get(&mut self, session: &mut Session, msg: &IoRequest, mut iob: PooledBuffer) -> Result<()> {
        debug!(key = %msg.key, request = msg.request_id, "GET");
        let grant = match self.store.lock(msg.pool_id, &msg.key, LockKind::Read, 0) {
            Ok(g) => g,
            Err(e) => {
                debug!(key = %msg.key, "lock for GET failed: {e}");
                return self.respond_io(session, msg, iob, e.status());
            }
        };
        let is_direct = IoFlags::from_bits_truncate(msg.flags).contains(IoFlags::DIRECT);

        if !is_direct && grant.len < TWO_STAGE_THRESHOLD {
            // small value: copy adjoining the response header
            // SAFETY: the value is locked; its storage is live and stable.
            let data =
                unsafe { std::slice::from_raw_parts(grant.addr as *const u8, grant.len) }.to_vec();
            self.store
                .unlock(msg.pool_id, grant.handle, UnlockFlush::Flush)?;
            let mut resp = IoResponse::status_only(msg.auth_id, msg.request_id, Status::Ok);
            resp.data_len = data.len() as u64;
            resp.data = data;
            resp.encode(iob.vec_mut());
            session.channel.post_response(iob)?;
            self.stats.op_get_count += 1;
            return Ok(());
        }

        let client_capacity = msg.value_len() as usize;
        if client_capacity < grant.len {
            self.store
                .unlock(msg.pool_id, grant.handle, UnlockFlush::None)?;
            warn!(key = %msg.key, "client posted insufficient space");
            return self.respond_io(session, msg, iob, Status::InsufficientSpace);
        }

        if !is_direct && grant.len + IO_RESPONSE_OVERHEAD <= session.channel.send_buffer_size() {
            // header and value as two buffers in one response packet;
            // the shared lock is released on transmission completion
            let mr = match session.channel.register_memory(grant.addr, grant.len) {
                Ok(mr) => mr,
                Err(e) => {
                    warn!("registration for GET failed: {e}");
                    self.store
                        .unlock(msg.pool_id, grant.handle, UnlockFlush::None)?;
                    return self.respond_io(session, msg, iob, Status::Fail);
                }
            };
            if self.registry.add_shared_reference(grant.addr) {
                // address already shared-locked; fold onto that entry
                self.store
                    .unlock(msg.pool_id, grant.handle, UnlockFlush::None)?;
                drop(mr);
            } else {
                self.registry
                    .insert_shared(grant.addr, msg.pool_id, grant.handle, grant.len, mr);
            }
            let rkey = self
                .registry
                .shared(grant.addr)
                .map(|e| e.mr.rkey())
                .unwrap_or(0);
            let mut resp = IoResponse::status_only(msg.auth_id, msg.request_id, Status::Ok);
            resp.addr = grant.addr;
            resp.mr_key = rkey;
            resp.data_len = grant.len as u64;
            resp.encode(iob.vec_mut());
            session.channel.post_response_with_payload(
                iob,
                MemorySlice {
                    addr: grant.addr,
                    len: grant.len,
                },
                Action::ReleaseSharedValueLock(grant.addr),
            )?;
            self.stats.op_get_twostage_count += 1;
            return Ok(());
        }

        // client should use GET_LOCATE
        self.store
            .unlock(msg.pool_id, grant.handle, UnlockFlush::None)?;
        self.respond_io(session, msg, iob, Status::TooLarge)
    }

    fn io_erase(&mut self, session: &mut Session, msg: &IoRequest, iob: PooledBuffer) -> Result<()> {
        let status = match self.store.erase(msg.pool_id, &msg.key) {
            Ok(()) => {
                self.indices.remove_key(msg.pool_id, &msg.key);
                Status::Ok
            }
            Err(e) => e.status(),
        };
        self.stats.op_erase_count += 1;
        self.respond_io(session, msg, iob, status)
    }

    fn io_put_locate(
        &mut self,
        session: &mut Session,
        msg: &IoRequest,
        mut iob: PooledBuffer,
    ) -> Result<()> {
        debug!(key = %msg.key, value_len = msg.value_len(), "PUT_LOCATE");
        let flags = IoFlags::from_bits_truncate(msg.flags);
        if flags.contains(IoFlags::DONT_STOMP) {
            warn!("PUT_LOCATE cannot honor DONT_STOMP");
            return self.respond_io(session, msg, iob, Status::Inval);
        }
        let value_len = msg.value_len() as usize;
        if value_len == 0 {
            return self.respond_io(session, msg, iob, Status::Inval);
        }

        // the sentinel embeds the actual key for recovery
        let sentinel = format!("{PENDING_KEY_PREFIX}{}", msg.key);
        let grant = match self
            .store
            .lock(msg.pool_id, &sentinel, LockKind::Write, value_len)
        {
            Ok(g) => g,
            Err(e) => {
                warn!(key = %msg.key, "PUT_LOCATE failed to lock value: {e}");
                return self.respond_io(session, msg, iob, e.status());
            }
        };
        if grant.len != value_len {
            warn!("existing entry length does not equal request length");
            self.store
                .unlock(msg.pool_id, grant.handle, UnlockFlush::None)?;
            return self.respond_io(session, msg, iob, Status::Inval);
        }

        let mr = match session.channel.register_memory(grant.addr, grant.len) {
            Ok(mr) => mr,
            Err(e) => {
                warn!("registration for PUT_LOCATE failed: {e}");
                self.store
                    .unlock(msg.pool_id, grant.handle, UnlockFlush::None)?;
                return self.respond_io(session, msg, iob, Status::Fail);
            }
        };
        let rkey = mr.rkey();
        self.registry
            .insert_exclusive(grant.addr, msg.pool_id, grant.handle, grant.len, mr);
        self.registry
            .add_pending_rename(grant.addr, msg.pool_id, sentinel, msg.key.clone());

        let mut resp = IoResponse::status_only(msg.auth_id, msg.request_id, Status::Ok);
        resp.addr = grant.addr;
        resp.mr_key = rkey;
        resp.encode(iob.vec_mut());
        session.channel.post_response(iob)?;
        self.stats.op_put_direct_count += 1;
        Ok(())
    }

    fn io_put_release(
        &mut self,
        session: &mut Session,
        msg: &IoRequest,
        iob: PooledBuffer,
    ) -> Result<()> {
        debug!(addr = format_args!("{:#x}", msg.addr), "PUT_RELEASE");
        let status = match self.release_exclusive_target(msg.addr) {
            Ok(()) => Status::Ok,
            Err(e) => {
                debug!("PUT_RELEASE failed: {e}");
                Status::Inval
            }
        };
        self.stats.op_put_count += 1;
        self.respond_io(session, msg, iob, status)
    }

    /// Release one exclusive holder of `target`; when the last holder
    /// leaves, drop the backend lock and resolve the pending rename.
    pub(crate) fn release_exclusive_target(&mut self, target: u64) -> Result<()> {
        match self.registry.release_exclusive(target) {
            None => Err(ShardError::Logic(format!(
                "bad target; value never locked? ({target:#x})"
            ))),
            Some(ReleaseOutcome::StillHeld) => Ok(()),
            Some(ReleaseOutcome::FullyReleased { pool, key_handle }) => {
                self.store.unlock(pool, key_handle, UnlockFlush::Flush)?;
                self.release_pending_rename(target)
            }
        }
    }

    /// Make the renamed key visible: create the destination on demand,
    /// swap the values, erase the sentinel, index the destination.
    fn release_pending_rename(&mut self, target: u64) -> Result<()> {
        let Some(rename) = self.registry.take_pending_rename(target) else {
            // no rename for this target (release came from a direct get)
            return Ok(());
        };
        debug!(from = %rename.from, to = %rename.to, "resolving rename");
        let grant = self
            .store
            .lock(rename.pool, &rename.to, LockKind::Write, 8)
            .map_err(|e| ShardError::Logic(format!("rename lock failed: {e}")))?;
        self.store
            .unlock(rename.pool, grant.handle, UnlockFlush::None)
            .map_err(|e| ShardError::Logic(format!("rename unlock failed: {e}")))?;
        self.store
            .swap_keys(rename.pool, &rename.from, &rename.to)
            .map_err(|e| ShardError::Logic(format!("swap_keys failed: {e}")))?;
        self.store
            .erase(rename.pool, &rename.from)
            .map_err(|e| ShardError::Logic(format!("sentinel erase failed: {e}")))?;
        self.indices.add_key(rename.pool, &rename.to);
        Ok(())
    }

    fn io_get_locate(
        &mut self,
        session: &mut Session,
        msg: &IoRequest,
        mut iob: PooledBuffer,
    ) -> Result<()> {
        debug!(key = %msg.key, "GET_LOCATE");
        let grant = match self.store.lock(msg.pool_id, &msg.key, LockKind::Read, 0) {
            Ok(g) => g,
            Err(e) => {
                debug!(key = %msg.key, "lock for GET_LOCATE failed: {e}");
                return self.respond_io(session, msg, iob, e.status());
            }
        };
        if self.registry.add_shared_reference(grant.addr) {
            // concurrent readers consolidate onto one backend lock
            self.store
                .unlock(msg.pool_id, grant.handle, UnlockFlush::None)?;
        } else {
            let mr = match session.channel.register_memory(grant.addr, grant.len) {
                Ok(mr) => mr,
                Err(e) => {
                    warn!("registration for GET_LOCATE failed: {e}");
                    self.store
                        .unlock(msg.pool_id, grant.handle, UnlockFlush::None)?;
                    return self.respond_io(session, msg, iob, Status::Fail);
                }
            };
            self.registry
                .insert_shared(grant.addr, msg.pool_id, grant.handle, grant.len, mr);
        }
        let rkey = self
            .registry
            .shared(grant.addr)
            .map(|e| e.mr.rkey())
            .unwrap_or(0);

        let mut resp = IoResponse::status_only(msg.auth_id, msg.request_id, Status::Ok);
        resp.addr = grant.addr;
        resp.mr_key = rkey;
        resp.data_len = grant.len as u64;
        resp.encode(iob.vec_mut());
        session.channel.post_response(iob)?;
        self.stats.op_get_direct_count += 1;
        Ok(())
    }

    fn io_get_release(
        &mut self,
        session: &mut Session,
        msg: &IoRequest,
        iob: PooledBuffer,
    ) -> Result<()> {
        debug!(addr = format_args!("{:#x}", msg.addr), "GET_RELEASE");
        let status = match self.registry.release_shared(msg.addr) {
            None => Status::Inval,
            Some(ReleaseOutcome::StillHeld) => Status::Ok,
            Some(ReleaseOutcome::FullyReleased { pool, key_handle }) => {
                self.store.unlock(pool, key_handle, UnlockFlush::Flush)?;
                Status::Ok
            }
        };
        self.stats.op_get_count += 1;
        self.respond_io(session, msg, iob, status)
    }

    fn io_locate(
        &mut self,
        session: &mut Session,
        msg: &IoRequest,
        mut iob: PooledBuffer,
    ) -> Result<()> {
        debug!(offset = msg.offset, size = msg.size, "LOCATE");
        let regions = match self.store.pool_regions(msg.pool_id) {
            Ok(r) => r,
            Err(e) => return self.respond_io(session, msg, iob, e.status()),
        };
        let Some(sgr) = crate::sg::offset_to_sg_list(msg.offset, msg.offset + msg.size, &regions)
        else {
            return self.respond_io(session, msg, iob, Status::Inval);
        };
        let mr = match session
            .channel
            .register_memory(sgr.mr_low, (sgr.mr_high - sgr.mr_low) as usize)
        {
            Ok(mr) => mr,
            Err(e) => {
                warn!("registration for LOCATE failed: {e}");
                return self.respond_io(session, msg, iob, Status::Fail);
            }
        };
        let rkey = mr.rkey();
        self.registry
            .add_space((msg.offset, msg.offset + msg.size - sgr.excess_length), mr);

        let mut resp = IoResponse::status_only(msg.auth_id, msg.request_id, Status::Ok);
        resp.mr_key = rkey;
        resp.set_sg_list(&sgr.sg_list);
        resp.encode(iob.vec_mut());
        session.channel.post_response(iob)?;
        self.stats.op_locate_count += 1;
        Ok(())
    }

    fn io_release(
        &mut self,
        session: &mut Session,
        msg: &IoRequest,
        iob: PooledBuffer,
    ) -> Result<()> {
        debug!(offset = msg.offset, size = msg.size, "RELEASE");
        let status = match self.registry.release_space((msg.offset, msg.offset + msg.size)) {
            Some(()) => Status::Ok,
            None => {
                debug!("release of never-located space");
                Status::Inval
            }
        };
        self.respond_io(session, msg, iob, status)
    }

    fn io_release_with_flush(
        &mut self,
        session: &mut Session,
        msg: &IoRequest,
        iob: PooledBuffer,
    ) -> Result<()> {
        debug!(offset = msg.offset, size = msg.size, "RELEASE_WITH_FLUSH");
        let regions = match self.store.pool_regions(msg.pool_id) {
            Ok(r) => r,
            Err(e) => return self.respond_io(session, msg, iob, e.status()),
        };
        let Some(sgr) = crate::sg::offset_to_sg_list(msg.offset, msg.offset + msg.size, &regions)
        else {
            return self.respond_io(session, msg, iob, Status::Inval);
        };
        let mut status = Status::Ok;
        for e in &sgr.sg_list {
            if let Err(err) = self
                .store
                .flush_pool_memory(msg.pool_id, e.addr, e.len as usize)
            {
                if status == Status::Ok {
                    status = err.status();
                }
            }
        }
        if self
            .registry
            .release_space((msg.offset, msg.offset + msg.size))
            .is_none()
        {
            status = Status::Inval;
        }
        self.respond_io(session, msg, iob, status)
    }

    // ------------------------------------------------------------------
    // configure / info

    fn process_configure(&mut self, msg: &IoRequest) -> Status {
        let command = &msg.key;
        debug!(%command, "CONFIGURE");
        if let Some(index_name) = command.strip_prefix("AddIndex::") {
            if index_name != "VolatileTree" {
                warn!(index_name, "unknown index");
                return Status::Inval;
            }
            let mut keys = Vec::new();
            if self
                .store
                .map_keys(msg.pool_id, &mut |k| keys.push(k.to_string()))
                .is_err()
            {
                return Status::Inval;
            }
            debug!(pool = msg.pool_id, count = keys.len(), "rebuilding volatile index");
            let index = self.indices.install(msg.pool_id);
            for k in &keys {
                index.insert(k);
            }
            Status::Ok
        } else if command == "RemoveIndex::" {
            if self.indices.remove(msg.pool_id) {
                Status::Ok
            } else {
                Status::Inval
            }
        } else {
            warn!(%command, "unknown configure command");
            Status::Inval
        }
    }

    fn process_info_request(&mut self, session: &mut Session, msg: &InfoRequest) -> Result<()> {
        if msg.info_type == mcas_protocol::INFO_TYPE_FIND_KEY {
            debug!(expr = %msg.key, "INFO find-key");
            if self.indices.get(msg.pool_id).is_none() {
                warn!("find-key without an index; configure AddIndex::VolatileTree first");
                let mut iob = session
                    .channel
                    .allocate_send()
                    .ok_or(ShardError::ResourceUnavailable)?;
                InfoResponse::status_only(msg.auth_id, msg.request_id, Status::Inval)
                    .encode(iob.vec_mut());
                session.channel.post_response(iob)?;
                return Ok(());
            }
            // response comes from the background task, not this tick
            self.tasks.push(TaskEntry {
                task: KeyFindTask::new(
                    session.id,
                    msg.auth_id,
                    msg.request_id,
                    msg.pool_id,
                    msg.key.clone(),
                    msg.offset,
                ),
                pending: None,
            });
            return Ok(());
        }

        let mut iob = session
            .channel
            .allocate_send()
            .ok_or(ShardError::ResourceUnavailable)?;

        if msg.info_type == mcas_protocol::INFO_TYPE_GET_STATS {
            StatsResponse {
                auth_id: msg.auth_id,
                request_id: msg.request_id,
                status: Status::Ok,
                stats: self.stats,
            }
            .encode(iob.vec_mut());
            session.channel.post_response(iob)?;
            return Ok(());
        }

        let (status, value) = match Attribute::from_u32(msg.info_type) {
            None => (Status::Inval, 0),
            Some(Attribute::Crc32) => self.crc32_attribute(msg),
            Some(attr) => {
                let key = (!msg.key.is_empty()).then_some(msg.key.as_str());
                match self.store.get_attribute(msg.pool_id, attr, key) {
                    Ok(v) => (Status::Ok, v),
                    Err(e) => {
                        debug!("get_attribute failed: {e}");
                        (e.status(), 0)
                    }
                }
            }
        };
        let mut resp = InfoResponse::status_only(msg.auth_id, msg.request_id, status);
        resp.value = value;
        resp.encode(iob.vec_mut());
        session.channel.post_response(iob)?;
        Ok(())
    }

    fn crc32_attribute(&mut self, msg: &InfoRequest) -> (Status, u64) {
        // the backend may hold a stored checksum; otherwise compute over
        // the locked value
        if let Ok(v) = self
            .store
            .get_attribute(msg.pool_id, Attribute::Crc32, Some(&msg.key))
        {
            return (Status::Ok, v);
        }
        let grant = match self.store.lock(msg.pool_id, &msg.key, LockKind::Read, 0) {
            Ok(g) => g,
            Err(e) => return (e.status(), 0),
        };
        // SAFETY: the value is locked; its storage is live and stable.
        let data = unsafe { std::slice::from_raw_parts(grant.addr as *const u8, grant.len) };
        let crc = crc32(data) as u64;
        if let Err(e) = self.store.unlock(msg.pool_id, grant.handle, UnlockFlush::None) {
            warn!("unlock after CRC32 failed: {e}");
            return (Status::Fail, 0);
        }
        (Status::Ok, crc)
    }

    // ------------------------------------------------------------------
    // deferred actions, tasks, session teardown

    /// Apply one completion-driven deferred action.
    pub fn apply_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::ReleaseExclusiveValueLock(target) => {
                debug!(target = format_args!("{target:#x}"), "deferred exclusive release");
                self.release_exclusive_target(target)
            }
            Action::ReleaseSharedValueLock(target) => match self.registry.release_shared(target) {
                None => Err(ShardError::Logic(format!(
                    "deferred release of unknown shared target ({target:#x})"
                ))),
                Some(ReleaseOutcome::StillHeld) => Ok(()),
                Some(ReleaseOutcome::FullyReleased { pool, key_handle }) => {
                    self.store.unlock(pool, key_handle, UnlockFlush::Flush)?;
                    Ok(())
                }
            },
        }
    }

    /// Run one step of every background task; respond and retire the
    /// finished ones.
    pub fn process_tasks(&mut self, sessions: &mut [Session]) {
        let mut i = 0;
        while i < self.tasks.len() {
            let step = match self.tasks[i].pending.take() {
                Some(step) => step,
                None => self.tasks[i].task.do_work(&self.indices),
            };
            match step {
                TaskStep::More => {
                    i += 1;
                }
                TaskStep::Done {
                    status,
                    position,
                    result,
                } => {
                    let (session_id, auth_id, request_id) = {
                        let t = &self.tasks[i].task;
                        (t.session_id, t.auth_id, t.request_id)
                    };
                    let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) else {
                        self.tasks.remove(i);
                        continue;
                    };
                    let Some(mut iob) = session.channel.allocate_send() else {
                        // keep the finished step until a buffer frees up
                        self.tasks[i].pending = Some(TaskStep::Done {
                            status,
                            position,
                            result,
                        });
                        i += 1;
                        continue;
                    };
                    let mut resp = InfoResponse::status_only(auth_id, request_id, status);
                    resp.offset = position;
                    resp.data = result;
                    resp.encode(iob.vec_mut());
                    if let Err(e) = session.channel.post_response(iob) {
                        warn!("posting task response failed: {e}");
                    }
                    self.tasks.remove(i);
                }
            }
        }
    }

    /// Close every pool a dying session holds open, releasing ADO
    /// references along the way.
    pub fn close_session_pools(&mut self, session: &mut Session) {
        for pool in session.pools.open_pool_handles() {
            if self.ado_enabled() {
                self.release_ado_for_pool(pool);
            }
            if let Err(e) = self.store.close_pool(pool) {
                warn!(pool, "close on session teardown failed: {e}");
            }
            debug!(pool = format_args!("{pool:#x}"), "closed pool for connection close");
        }
        session.premapped.clear();
    }

    /// Number of live lock-registry entries (diagnostics and tests).
    pub fn live_lock_entries(&self) -> usize {
        self.registry.live_entries()
    }

    /// Failed asynchronous ADO requests recorded so far.
    pub fn failed_async_requests(&self) -> &[(u64, Status)] {
        &self.failed_async
    }
}

// ==========================================================================
// the event loop

/// A running shard: dispatcher state plus its sessions and endpoint.
pub struct Shard {
    state: ShardState,
    sessions: Vec<Session>,
    listener: Box<dyn Listener>,
    cluster: ClusterSignalQueue,
    thread_exit: bool,
    exit_flag: Arc<AtomicBool>,
    tick: u64,
    next_session_id: u64,
}

impl Shard {
    /// Assemble a shard from its collaborators.
    pub fn new(
        config: ShardConfig,
        store: Box<dyn KvStore>,
        listener: Box<dyn Listener>,
        cluster: ClusterSignalQueue,
    ) -> Self {
        Self {
            state: ShardState::new(config, store),
            sessions: Vec::new(),
            listener,
            cluster,
            thread_exit: false,
            exit_flag: Arc::new(AtomicBool::new(false)),
            tick: 0,
            next_session_id: 1,
        }
    }

    /// Dispatcher state (diagnostics and tests).
    pub fn state(&self) -> &ShardState {
        &self.state
    }

    /// Handle that requests the same cooperative shutdown SIGINT does,
    /// scoped to this shard instance.
    pub fn exit_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit_flag)
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run until SIGINT (or a forced exit); pins the thread to the
    /// configured core first.
    pub fn run(&mut self) {
        let core = self.state.config.core;
        if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
            warn!(core, "could not pin shard thread");
        }
        info!(
            core,
            addr = %self.state.config.addr,
            port = self.state.config.port,
            backend = %self.state.config.backend,
            "shard entering main loop"
        );
        while self.tick_once() {}
        self.shutdown();
        info!(core, "shard exited");
    }

    /// One loop iteration. Returns `false` once the shard should exit.
    pub fn tick_once(&mut self) -> bool {
        self.tick += 1;

        if (signals::sigint_pending() || self.exit_flag.load(Ordering::Acquire)) && !self.thread_exit
        {
            info!("shutdown requested");
            self.thread_exit = true;
        }
        if self.thread_exit && self.sessions.is_empty() {
            return false;
        }

        if self.sessions.is_empty() {
            std::thread::sleep(SESSIONS_EMPTY_SLEEP);
            self.check_for_new_connections();
            self.service_cluster_signals();
            return !self.thread_exit;
        }

        if self.tick % CONNECTION_CHECK_INTERVAL == 0 {
            self.check_for_new_connections();
        }
        if self.tick % CLUSTER_SIGNAL_INTERVAL == 0 {
            self.service_cluster_signals();
        }

        self.state.stats.client_count = self.sessions.len() as u64;

        let mut pending_close = Vec::new();
        let mut fatal = false;
        let force_close = self.thread_exit;
        {
            let Self {
                sessions, state, ..
            } = self;
            for (idx, session) in sessions.iter_mut().enumerate() {
                let tick_close = match session.channel.tick() {
                    Ok(TickOutcome::Close) => true,
                    Ok(_) => false,
                    Err(e) => {
                        warn!(peer = %session.channel.peer(), "channel tick failed: {e}");
                        true
                    }
                };
                if tick_close {
                    state.close_session_pools(session);
                    pending_close.push(idx);
                    continue;
                }

                // deferred actions first: completions may release locks
                // the next request depends on
                while let Some(action) = session.channel.poll_action() {
                    if let Err(e) = state.apply_action(action) {
                        error!("deferred action failed: {e}");
                        fatal = true;
                    }
                }

                // at most one message per session per tick
                if let Some(msg) = session.channel.pop_message() {
                    match state.process_message(session, &msg) {
                        Ok(()) => {}
                        Err(ShardError::ResourceUnavailable) => {
                            debug!("short of buffers; requeueing request");
                            session.channel.requeue_message(msg);
                        }
                        Err(ShardError::Logic(e)) => {
                            error!("loop invariant violated: {e}");
                            fatal = true;
                        }
                        Err(e) => {
                            warn!("exception in request processing: {e}");
                        }
                    }
                }

                // a requested shutdown still answers the in-flight
                // request above; only then does the session go
                if force_close {
                    state.close_session_pools(session);
                    pending_close.push(idx);
                }
            }

            if let Err(e) = state.process_messages_from_ado(sessions) {
                error!("ADO processing failed: {e}");
                fatal = true;
            }
            state.process_tasks(sessions);
        }

        for idx in pending_close.into_iter().rev() {
            let session = self.sessions.remove(idx);
            info!(peer = %session.channel.peer(), "session closed");
        }
        if self.sessions.is_empty() && self.state.config.forced_exit {
            info!("forcing exit after last session");
            self.thread_exit = true;
        }
        if fatal {
            self.thread_exit = true;
        }
        !(self.thread_exit && self.sessions.is_empty())
    }

    fn check_for_new_connections(&mut self) {
        loop {
            match self.listener.poll_accept() {
                Ok(Some(channel)) => {
                    let id = self.next_session_id;
                    self.next_session_id += 1;
                    info!(peer = %channel.peer(), id, "new session");
                    self.sessions.push(Session::new(id, channel));
                }
                Ok(None) => break,
                Err(e) => {
                    error!("cannot accept new connection: {e}");
                    self.thread_exit = true;
                    break;
                }
            }
        }
    }

    fn service_cluster_signals(&mut self) {
        for msg in self.cluster.drain() {
            debug!(sender = %msg.sender, event = %msg.event_type, "cluster signal");
            self.state.forward_cluster_event(&msg);
        }
    }

    /// Orderly teardown: sessions, then locks and spaces, then ADO.
    fn shutdown(&mut self) {
        info!("shard shutting down");
        let Self {
            sessions, state, ..
        } = self;
        for session in sessions.iter_mut() {
            state.close_session_pools(session);
        }
        sessions.clear();
        for (pool, handle) in state.registry.drain_all() {
            if let Err(e) = state.store.unlock(pool, handle, UnlockFlush::Flush) {
                warn!(pool, "unlock at shutdown failed: {e}");
            }
        }
        state.close_all_ado();
        for (request_id, status) in state.failed_async.drain(..) {
            warn!(request_id, %status, "async ADO request failed");
        }
    }
}
