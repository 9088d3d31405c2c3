//! ADO coordination: per-pool process lifecycle, work-request tracking,
//! and the callback services the shard provides to ADO processes.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use mcas_ado_proto::{
    AdoEndpoint, AdoMessage, AdoOp, ChannelConfig, ResponseBuffer, CONFIG_SHARD_DEC_REF,
    CONFIG_SHARD_INC_REF, TABLE_OP_CREATE_ONLY, TABLE_OP_LIFETIME_UNLOCK,
    TABLE_OP_NO_IMPLICIT_UNLOCK,
};
use mcas_backend::{BackendError, KeyHandle, LockKind, PoolHandle, UnlockFlush, KEY_NONE};
use mcas_protocol::{
    AdoFlags, AdoRequest, AdoResponse, AdoResponseBuffer, Attribute, PutAdoRequest, Status,
};
use tracing::{debug, info, warn};

use crate::error::{Result, ShardError};
use crate::session::Session;
use crate::shard::ShardState;

/// Comparison budget for ADO-side index finds.
pub const MAX_INDEX_COMPARISONS: u32 = 1000;

/// One ADO work request in flight.
#[derive(Debug)]
pub struct WorkRequest {
    /// Session that issued the invocation.
    pub session_id: u64,
    /// Echoed auth id.
    pub auth_id: u64,
    /// Pool the invocation targets.
    pub pool: PoolHandle,
    /// Backend lock taken for the invocation (`KEY_NONE` when key-less).
    pub key_handle: KeyHandle,
    /// The target key.
    pub key: String,
    /// Lock kind held, if any.
    pub lock_kind: Option<LockKind>,
    /// Client request id for the eventual response.
    pub request_id: u64,
    /// Invocation flags.
    pub flags: AdoFlags,
}

/// Proxy for one ADO process.
pub struct AdoProxy {
    /// IPC endpoint (shard side).
    pub endpoint: AdoEndpoint,
    /// References held by open pool handles (and ADO self-references).
    pub refcount: u32,
    /// Pool this process serves.
    pub pool_id: PoolHandle,
    /// Pool name.
    pub pool_name: String,
    /// Session that first bootstrapped the process.
    pub session_id: u64,
    /// Unlocks owed when a given work id completes.
    pub deferred_unlocks: HashMap<u64, Vec<KeyHandle>>,
    /// Unlocks owed at process shutdown.
    pub life_unlocks: Vec<KeyHandle>,
    child: Option<Child>,
}

impl AdoProxy {
    /// Install a deferred unlock for `work_id`.
    pub fn add_deferred_unlock(&mut self, work_id: u64, handle: KeyHandle) {
        self.deferred_unlocks.entry(work_id).or_default().push(handle);
    }

    /// Replace `old` with `new` in the deferred table. Returns whether a
    /// replacement happened.
    pub fn update_deferred_unlock(&mut self, work_id: u64, old: KeyHandle, new: KeyHandle) -> bool {
        if let Some(handles) = self.deferred_unlocks.get_mut(&work_id) {
            for h in handles.iter_mut() {
                if *h == old {
                    *h = new;
                    return true;
                }
            }
        }
        false
    }

    /// True when an implicit (deferred) unlock is still owed on `handle`.
    pub fn has_implicit_unlock(&self, work_id: u64, handle: KeyHandle) -> bool {
        self.deferred_unlocks
            .get(&work_id)
            .is_some_and(|handles| handles.contains(&handle))
    }
}

/// Channel names must be unique across every shard in the process.
static CHANNEL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The shard-global ADO state.
#[derive(Default)]
pub struct AdoCoordinator {
    slots: Vec<Option<AdoProxy>>,
    by_name: HashMap<String, usize>,
    by_pool: HashMap<PoolHandle, usize>,
    /// Outstanding work, keyed by work-request key.
    pub outstanding: HashMap<u64, WorkRequest>,
    next_work_key: u64,
}

impl AdoCoordinator {
    /// Empty coordinator.
    pub fn new() -> Self {
        Self {
            next_work_key: 1,
            ..Self::default()
        }
    }

    /// Proxy slot serving `pool`, if one exists.
    pub fn slot_for_pool(&self, pool: PoolHandle) -> Option<usize> {
        self.by_pool.get(&pool).copied()
    }

    /// Mutable proxy serving `pool`.
    pub fn proxy_for_pool(&mut self, pool: PoolHandle) -> Option<&mut AdoProxy> {
        let slot = self.slot_for_pool(pool)?;
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Mutable proxy by slot.
    pub fn proxy_mut(&mut self, slot: usize) -> Option<&mut AdoProxy> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Slots holding live proxies.
    pub fn live_slots(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].is_some())
            .collect()
    }

    /// Allocate a fresh work-request key and register the request.
    pub fn register_work(&mut self, request: WorkRequest) -> u64 {
        let key = self.next_work_key;
        self.next_work_key += 1;
        self.outstanding.insert(key, request);
        key
    }

    fn channel_name(&mut self) -> String {
        let n = CHANNEL_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("mcas-ado-{}-{}", std::process::id(), n)
    }

    fn insert_proxy(&mut self, proxy: AdoProxy) -> usize {
        let name = proxy.pool_name.clone();
        let pool = proxy.pool_id;
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(proxy);
                free
            }
            None => {
                self.slots.push(Some(proxy));
                self.slots.len() - 1
            }
        };
        self.by_name.insert(name, slot);
        self.by_pool.insert(pool, slot);
        slot
    }

    fn remove_slot(&mut self, slot: usize) -> Option<AdoProxy> {
        let proxy = self.slots.get_mut(slot)?.take()?;
        self.by_name.remove(&proxy.pool_name);
        self.by_pool.remove(&proxy.pool_id);
        Some(proxy)
    }
}

/// Pool identity handed to the bootstrap path.
#[derive(Debug, Clone)]
pub struct PoolDesc {
    /// Pool name.
    pub name: String,
    /// Pool size.
    pub size: u64,
    /// Pool flags.
    pub flags: u32,
    /// Expected object count hint.
    pub expected_obj_count: u64,
    /// Whether this open found an existing pool.
    pub opened_existing: bool,
}

impl ShardState {
    /// True when this shard runs ADO processes.
    pub fn ado_enabled(&self) -> bool {
        self.config.ado_enabled()
    }

    /// Ensure an ADO process serves `pool`, launching and bootstrapping
    /// one on first need.
    pub fn conditional_bootstrap_ado(
        &mut self,
        session: &Session,
        pool: PoolHandle,
        desc: PoolDesc,
    ) -> Result<()> {
        if let Some(proxy) = self.ado.proxy_for_pool(pool) {
            proxy.refcount += 1;
            return Ok(());
        }
        if let Some(&slot) = self.ado.by_name.get(&desc.name) {
            // same pool re-opened under a fresh handle
            if let Some(proxy) = self.ado.proxy_mut(slot) {
                proxy.refcount += 1;
                proxy.pool_id = pool;
            }
            self.ado.by_pool.insert(pool, slot);
            return Ok(());
        }

        let channel = self.ado.channel_name();
        let endpoint = AdoEndpoint::create(&channel, ChannelConfig::default())?;
        let child = self.launch_ado_process(&channel)?;

        let mut proxy = AdoProxy {
            endpoint,
            refcount: 1,
            pool_id: pool,
            pool_name: desc.name.clone(),
            session_id: session.id,
            deferred_unlocks: HashMap::new(),
            life_unlocks: Vec::new(),
            child,
        };

        proxy.endpoint.send(&AdoMessage::Bootstrap {
            pool_name: desc.name.clone(),
            pool_size: desc.size,
            pool_flags: desc.flags,
            expected_obj_count: desc.expected_obj_count,
            opened_existing: desc.opened_existing,
        })?;

        // exchange pool region mappings; the token doubles as the base
        // address for exposed-memory style mappings
        let regions = self.store.pool_regions(pool)?;
        for r in &regions {
            proxy.endpoint.send(&AdoMessage::MemoryMap {
                token: r.base,
                len: r.len as u64,
                base: r.base,
            })?;
        }
        info!(pool, name = %desc.name, regions = regions.len(), "ADO bootstrapped");

        self.ado.insert_proxy(proxy);
        Ok(())
    }

    fn launch_ado_process(&mut self, channel: &str) -> Result<Option<Child>> {
        let Some(path) = self.config.ado_path.clone() else {
            return Ok(None);
        };
        let mut cmd = Command::new(&path);
        cmd.arg("--channel").arg(channel);
        if !self.config.ado_plugins.is_empty() {
            cmd.arg("--plugins");
            for plugin in &self.config.ado_plugins {
                cmd.arg(plugin);
            }
        }
        for (k, v) in &self.config.ado_params {
            cmd.arg("--param").arg(format!("{{{k}:{v}}}"));
        }
        cmd.arg("--param")
            .arg(format!("{{net:{},{}}}", self.config.addr, self.config.port));
        if let Some(cores) = &self.config.ado_cores {
            cmd.arg("--cores").arg(cores);
        }
        let child = cmd
            .stdin(Stdio::null())
            .spawn()
            .map_err(ShardError::AdoLaunch)?;
        info!(path = %path.display(), channel, pid = child.id(), "ADO process launched");
        Ok(Some(child))
    }

    /// Release the ADO reference held by an open pool handle; shuts the
    /// process down when the last reference drops.
    pub fn release_ado_for_pool(&mut self, pool: PoolHandle) {
        let Some(slot) = self.ado.slot_for_pool(pool) else {
            return;
        };
        let last = {
            let Some(proxy) = self.ado.proxy_mut(slot) else {
                return;
            };
            proxy.refcount -= 1;
            proxy.refcount == 0
        };
        if last {
            self.shutdown_ado_slot(slot);
        }
    }

    fn shutdown_ado_slot(&mut self, slot: usize) {
        let Some(mut proxy) = self.ado.remove_slot(slot) else {
            return;
        };
        for handle in proxy.life_unlocks.drain(..) {
            if let Err(e) = self.store.unlock(proxy.pool_id, handle, UnlockFlush::None) {
                warn!(pool = proxy.pool_id, "life unlock at ADO shutdown failed: {e}");
            }
        }
        let _ = proxy.endpoint.send(&AdoMessage::Shutdown);
        proxy.endpoint.unblock();
        proxy.endpoint.mark_shutdown();
        if let Some(mut child) = proxy.child.take() {
            // cooperative exit first, then reap
            std::thread::sleep(std::time::Duration::from_millis(10));
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
        }
        info!(pool = proxy.pool_id, name = %proxy.pool_name, "ADO shut down");
    }

    /// Shut down every ADO process (shard exit).
    pub fn close_all_ado(&mut self) {
        for slot in self.ado.live_slots() {
            self.shutdown_ado_slot(slot);
        }
    }

    /// Forward a cluster event to every live proxy.
    pub fn forward_cluster_event(&mut self, msg: &crate::cluster::ClusterMessage) {
        for slot in self.ado.live_slots() {
            if let Some(proxy) = self.ado.proxy_mut(slot) {
                let _ = proxy.endpoint.send(&AdoMessage::ClusterEvent {
                    sender: msg.sender.clone(),
                    event_type: msg.event_type.clone(),
                    content: msg.content.clone(),
                });
            }
        }
    }

    fn ado_error_response(
        &mut self,
        session: &mut Session,
        auth_id: u64,
        request_id: u64,
        status: Status,
        message: &str,
    ) -> Result<()> {
        let mut iob = session
            .channel
            .allocate_send()
            .ok_or(ShardError::ResourceUnavailable)?;
        AdoResponse {
            auth_id,
            request_id,
            status,
            buffers: vec![AdoResponseBuffer {
                layer_id: 0,
                data: message.as_bytes().to_vec(),
            }],
        }
        .encode(iob.vec_mut());
        session.channel.post_response(iob)?;
        self.stats.op_failed_request_count += 1;
        Ok(())
    }

    /// ADO_REQUEST: invocation without payload.
    pub fn process_ado_request(&mut self, session: &mut Session, msg: &AdoRequest) -> Result<()> {
        let flags = AdoFlags::from_bits_truncate(msg.flags);

        if !self.ado_enabled() {
            return self.ado_error_response(
                session,
                msg.auth_id,
                msg.request_id,
                Status::Inval,
                "ADO!NOT_ENABLED",
            );
        }
        if flags.contains(AdoFlags::DETACHED) {
            // detached payloads only make sense with a value to put
            return self.ado_error_response(
                session,
                msg.auth_id,
                msg.request_id,
                Status::Inval,
                "ADO!INVALID_ARGS",
            );
        }

        // create-only: make the zeroed value, no ADO invocation
        if flags.contains(AdoFlags::CREATE_ONLY) {
            if self
                .store
                .get_attribute(msg.pool_id, Attribute::ValueLen, Some(&msg.key))
                .is_ok()
            {
                return self.ado_error_response(
                    session,
                    msg.auth_id,
                    msg.request_id,
                    Status::AlreadyExists,
                    "ADO!ALREADY_EXISTS",
                );
            }
            let kind = if flags.contains(AdoFlags::READ_ONLY) {
                LockKind::Read
            } else {
                LockKind::Write
            };
            let grant = match self
                .store
                .lock(msg.pool_id, &msg.key, kind, msg.ondemand_val_len as usize)
            {
                Ok(g) => g,
                Err(e) => {
                    return self.ado_error_response(
                        session,
                        msg.auth_id,
                        msg.request_id,
                        e.status(),
                        "ADO!ALREADY_LOCKED",
                    )
                }
            };
            self.store
                .unlock(msg.pool_id, grant.handle, UnlockFlush::Flush)?;
            self.indices.add_key(msg.pool_id, &msg.key);

            let mut iob = session
                .channel
                .allocate_send()
                .ok_or(ShardError::ResourceUnavailable)?;
            AdoResponse {
                auth_id: msg.auth_id,
                request_id: msg.request_id,
                status: Status::Ok,
                buffers: vec![AdoResponseBuffer {
                    layer_id: 0,
                    data: grant.addr.to_le_bytes().to_vec(),
                }],
            }
            .encode(iob.vec_mut());
            session.channel.post_response(iob)?;
            return Ok(());
        }

        if self.ado.slot_for_pool(msg.pool_id).is_none() {
            return self.ado_error_response(
                session,
                msg.auth_id,
                msg.request_id,
                Status::Inval,
                "ADO!NOT_RUNNING",
            );
        }

        // lock the pair when the invocation names a key
        let mut key_handle = KEY_NONE;
        let mut lock_kind = None;
        let mut value_addr = 0u64;
        let mut value_len = 0u64;
        let mut new_root = false;
        if !msg.key.is_empty() {
            let kind = if flags.contains(AdoFlags::READ_ONLY) {
                LockKind::Read
            } else {
                LockKind::Write
            };
            let grant = match self
                .store
                .lock(msg.pool_id, &msg.key, kind, msg.ondemand_val_len as usize)
            {
                Ok(g) => g,
                Err(e) => {
                    return self.ado_error_response(
                        session,
                        msg.auth_id,
                        msg.request_id,
                        e.status(),
                        "ADO!ALREADY_LOCKED",
                    )
                }
            };
            key_handle = grant.handle;
            lock_kind = Some(kind);
            value_addr = grant.addr;
            value_len = grant.len as u64;
            new_root = grant.created;
        }

        let work_key = self.ado.register_work(WorkRequest {
            session_id: session.id,
            auth_id: msg.auth_id,
            pool: msg.pool_id,
            key_handle,
            key: msg.key.clone(),
            lock_kind,
            request_id: msg.request_id,
            flags,
        });
        let request = AdoMessage::WorkRequest {
            work_key,
            key: msg.key.clone(),
            value_addr,
            value_len,
            detached_addr: 0,
            detached_len: 0,
            request: msg.request.clone(),
            new_root,
        };
        self.send_work_or_fail(session, msg.auth_id, msg.request_id, work_key, &request)
    }

    /// PUT_ADO_REQUEST: put a payload, then invoke.
    pub fn process_put_ado_request(
        &mut self,
        session: &mut Session,
        msg: &PutAdoRequest,
    ) -> Result<()> {
        let flags = AdoFlags::from_bits_truncate(msg.flags);

        if !self.ado_enabled() {
            return self.ado_error_response(
                session,
                msg.auth_id,
                msg.request_id,
                Status::Inval,
                "ADO!NOT_ENABLED(put)",
            );
        }
        if msg.value.is_empty() {
            return self.ado_error_response(
                session,
                msg.auth_id,
                msg.request_id,
                Status::Inval,
                "ADO!ZERO_VALUE_LEN",
            );
        }
        if self.ado.slot_for_pool(msg.pool_id).is_none() {
            return self.ado_error_response(
                session,
                msg.auth_id,
                msg.request_id,
                Status::Inval,
                "ADO!NOT_RUNNING",
            );
        }

        let value_already_exists = (flags.contains(AdoFlags::NO_OVERWRITE)
            || flags.contains(AdoFlags::DETACHED))
            && self
                .store
                .get_attribute(msg.pool_id, Attribute::ValueLen, Some(&msg.key))
                .is_ok();

        // detached root: create and hold the root value now
        let mut key_handle = KEY_NONE;
        let mut value_addr = 0u64;
        let mut value_len = 0u64;
        let mut new_root = false;
        if flags.contains(AdoFlags::DETACHED) && msg.root_val_len > 0 {
            let grant = match self.store.lock(
                msg.pool_id,
                &msg.key,
                LockKind::Write,
                msg.root_val_len as usize,
            ) {
                Ok(g) => g,
                Err(e) => {
                    return self.ado_error_response(
                        session,
                        msg.auth_id,
                        msg.request_id,
                        e.status(),
                        "ADO!ALREADY_LOCKED",
                    )
                }
            };
            key_handle = grant.handle;
            value_addr = grant.addr;
            value_len = grant.len as u64;
            new_root = grant.created;
        }

        // place the payload
        let mut detached_addr = 0u64;
        let mut detached_len = 0u64;
        if flags.contains(AdoFlags::DETACHED) {
            let size = msg.value.len().div_ceil(8) * 8;
            let addr = match self.store.allocate_pool_memory(msg.pool_id, size, 8) {
                Ok(a) => a,
                Err(_) => {
                    if key_handle != KEY_NONE {
                        self.store
                            .unlock(msg.pool_id, key_handle, UnlockFlush::None)?;
                    }
                    return self.ado_error_response(
                        session,
                        msg.auth_id,
                        msg.request_id,
                        Status::InsufficientSpace,
                        "ADO!OUT_OF_MEMORY",
                    );
                }
            };
            // SAFETY: addr names `size` bytes just allocated from the pool.
            unsafe {
                std::ptr::copy_nonoverlapping(msg.value.as_ptr(), addr as *mut u8, msg.value.len());
            }
            detached_addr = addr;
            detached_len = size as u64;
            debug!(addr = format_args!("{addr:#x}"), size, "detached payload placed");
        } else if value_already_exists && flags.contains(AdoFlags::NO_OVERWRITE) {
            // leave the existing value untouched
        } else if let Err(e) = self.store.put(msg.pool_id, &msg.key, &msg.value, false) {
            return self.ado_error_response(
                session,
                msg.auth_id,
                msg.request_id,
                e.status(),
                "ADO!PUT_FAILED",
            );
        }

        // take the work lock unless the detached-root path already did
        if key_handle == KEY_NONE {
            let grant = match self.store.lock(msg.pool_id, &msg.key, LockKind::Write, 0) {
                Ok(g) => g,
                Err(e) => {
                    return self.ado_error_response(
                        session,
                        msg.auth_id,
                        msg.request_id,
                        e.status(),
                        "ADO!ALREADY_LOCKED(key)",
                    )
                }
            };
            key_handle = grant.handle;
            value_addr = grant.addr;
            value_len = grant.len as u64;
        }

        let work_key = self.ado.register_work(WorkRequest {
            session_id: session.id,
            auth_id: msg.auth_id,
            pool: msg.pool_id,
            key_handle,
            key: msg.key.clone(),
            lock_kind: Some(LockKind::Write),
            request_id: msg.request_id,
            flags,
        });
        let request = AdoMessage::WorkRequest {
            work_key,
            key: msg.key.clone(),
            value_addr,
            value_len,
            detached_addr,
            detached_len,
            request: msg.request.clone(),
            new_root,
        };
        self.send_work_or_fail(session, msg.auth_id, msg.request_id, work_key, &request)
    }

    fn send_work_or_fail(
        &mut self,
        session: &mut Session,
        auth_id: u64,
        request_id: u64,
        work_key: u64,
        request: &AdoMessage,
    ) -> Result<()> {
        let pool = match self.ado.outstanding.get(&work_key) {
            Some(wr) => wr.pool,
            None => return Err(ShardError::Logic("work request vanished".into())),
        };
        let send_result = match self.ado.proxy_for_pool(pool) {
            Some(proxy) => proxy.endpoint.send(request),
            None => return Err(ShardError::Logic("ADO proxy vanished".into())),
        };
        if let Err(e) = send_result {
            warn!(work_key, "work request send failed: {e}");
            if let Some(wr) = self.ado.outstanding.remove(&work_key) {
                if wr.key_handle != KEY_NONE {
                    self.store.unlock(wr.pool, wr.key_handle, UnlockFlush::None)?;
                }
            }
            return self.ado_error_response(session, auth_id, request_id, Status::Busy, "ADO!BUSY");
        }
        debug!(work_key, "work request sent");
        Ok(())
    }

    /// Drain completions and callbacks from every ADO process.
    pub fn process_messages_from_ado(&mut self, sessions: &mut [Session]) -> Result<()> {
        for slot in self.ado.live_slots() {
            loop {
                let msg = {
                    let Some(proxy) = self.ado.proxy_mut(slot) else {
                        break;
                    };
                    match proxy.endpoint.try_recv() {
                        Ok(Some(m)) => m,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(slot, "ADO channel receive failed: {e}");
                            break;
                        }
                    }
                };
                if let Err(e) = self.handle_ado_message(slot, msg, sessions) {
                    match e {
                        ShardError::Logic(_) => return Err(e),
                        other => warn!(slot, "ADO callback failed: {other}"),
                    }
                }
                // the proxy may have shut down while handling the message
                if self.ado.proxy_mut(slot).is_none() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn ado_send(&mut self, slot: usize, msg: &AdoMessage) -> Result<()> {
        match self.ado.proxy_mut(slot) {
            Some(proxy) => Ok(proxy.endpoint.send(msg)?),
            None => Ok(()),
        }
    }

    fn handle_ado_message(
        &mut self,
        slot: usize,
        msg: AdoMessage,
        sessions: &mut [Session],
    ) -> Result<()> {
        match msg {
            AdoMessage::WorkCompletion {
                work_key,
                status,
                buffers,
            } => self.handle_work_completion(slot, work_key, status, buffers, sessions),
            AdoMessage::TableOp {
                work_id,
                op,
                key,
                value_len,
                align_or_flags,
                addr,
            } => self.handle_table_op(slot, work_id, op, key, value_len, align_or_flags, addr),
            AdoMessage::PoolInfoRequest => self.handle_pool_info(slot, sessions),
            AdoMessage::OpEventResponse { op } => self.handle_op_event_response(slot, op),
            AdoMessage::IterateRequest {
                iterator,
                t_begin,
                t_end,
            } => self.handle_iterate(slot, iterator, t_begin, t_end),
            AdoMessage::VectorRequest { t_begin, t_end } => {
                self.handle_vector(slot, t_begin, t_end)
            }
            AdoMessage::IndexRequest {
                expression,
                begin_pos,
                find_type,
                max_comparisons,
            } => self.handle_index_find(slot, expression, begin_pos, find_type, max_comparisons),
            AdoMessage::UnlockRequest {
                work_id,
                key_handle,
            } => self.handle_unlock_request(slot, work_id, key_handle),
            AdoMessage::ConfigureRequest { options } => self.handle_ado_configure(slot, options),
            other => {
                warn!(slot, "unexpected message from ADO: {other:?}");
                Ok(())
            }
        }
    }

    fn handle_work_completion(
        &mut self,
        slot: usize,
        work_key: u64,
        status: i32,
        buffers: Vec<ResponseBuffer>,
        sessions: &mut [Session],
    ) -> Result<()> {
        let mut status = Status::from_i32(status);
        let Some(record) = self.ado.outstanding.remove(&work_key) else {
            return Err(ShardError::Logic(format!(
                "bad work request key from ADO ({work_key:#x})"
            )));
        };
        debug!(work_key, %status, buffers = buffers.len(), "work completion");

        // release the invocation lock
        if record.key_handle != KEY_NONE {
            self.store
                .unlock(record.pool, record.key_handle, UnlockFlush::Flush)?;
        }

        // deferred unlocks installed by table ops under this work id
        let deferred = self
            .ado
            .proxy_mut(slot)
            .and_then(|p| p.deferred_unlocks.remove(&work_key))
            .unwrap_or_default();
        for handle in deferred {
            self.store.unlock(record.pool, handle, UnlockFlush::Flush)?;
        }

        if status == Status::EraseTarget {
            status = match self.store.erase(record.pool, &record.key) {
                Ok(()) => {
                    self.indices.remove_key(record.pool, &record.key);
                    Status::Ok
                }
                Err(e) => {
                    warn!(key = %record.key, "erase-target failed: {e}");
                    e.status()
                }
            };
        }

        if record.flags.contains(AdoFlags::ASYNC) {
            if !status.is_ok() {
                debug!(work_key, %status, "async ADO failure recorded");
                self.failed_async.push((record.request_id, status));
            }
        } else if let Some(session) = sessions.iter_mut().find(|s| s.id == record.session_id) {
            match session.channel.allocate_send() {
                Some(mut iob) => {
                    let mut response = AdoResponse {
                        auth_id: record.auth_id,
                        request_id: record.request_id,
                        status,
                        buffers: Vec::new(),
                    };
                    for b in &buffers {
                        response.buffers.push(match b {
                            ResponseBuffer::PoolRef { layer_id, addr, len }
                            | ResponseBuffer::PoolRefFree { layer_id, addr, len } => {
                                // SAFETY: the buffer is pool memory the ADO
                                // holds live until this completion is done.
                                let data = unsafe {
                                    std::slice::from_raw_parts(*addr as *const u8, *len as usize)
                                }
                                .to_vec();
                                AdoResponseBuffer {
                                    layer_id: *layer_id,
                                    data,
                                }
                            }
                            ResponseBuffer::Inline { layer_id, data } => AdoResponseBuffer {
                                layer_id: *layer_id,
                                data: data.clone(),
                            },
                        });
                    }
                    response.encode(iob.vec_mut());
                    session.channel.post_response(iob)?;
                }
                None => {
                    warn!(work_key, "no send buffer for ADO completion; response dropped");
                    self.stats.op_failed_request_count += 1;
                }
            }
        }

        // free pool buffers the plugin marked transient
        for b in &buffers {
            if let ResponseBuffer::PoolRefFree { addr, len, .. } = b {
                if let Err(e) = self.store.free_pool_memory(record.pool, *addr, *len as usize) {
                    warn!("freeing ADO response buffer failed: {e}");
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_table_op(
        &mut self,
        slot: usize,
        work_id: u64,
        op: AdoOp,
        key: String,
        value_len: u64,
        align_or_flags: u64,
        addr: u64,
    ) -> Result<()> {
        let pool = match self.ado.proxy_mut(slot) {
            Some(p) => p.pool_id,
            None => return Ok(()),
        };
        match op {
            AdoOp::Create | AdoOp::Open => {
                if op == AdoOp::Create
                    && align_or_flags & TABLE_OP_CREATE_ONLY != 0
                    && self
                        .store
                        .get_attribute(pool, Attribute::ValueLen, Some(&key))
                        .is_ok()
                {
                    return self.ado_send(
                        slot,
                        &AdoMessage::TableOpResponse {
                            status: Status::AlreadyExists.to_i32(),
                            addr: 0,
                            len: 0,
                            key_handle: 0,
                        },
                    );
                }
                let grant =
                    match self
                        .store
                        .lock(pool, &key, LockKind::Write, value_len as usize)
                    {
                        Ok(g) => g,
                        Err(e) => {
                            debug!(%key, "table-op lock failed: {e}");
                            return self.ado_send(
                                slot,
                                &AdoMessage::TableOpResponse {
                                    status: e.status().to_i32(),
                                    addr: 0,
                                    len: 0,
                                    key_handle: 0,
                                },
                            );
                        }
                    };
                self.indices.add_key(pool, &key);

                let mut status = Status::Ok;
                if align_or_flags & TABLE_OP_NO_IMPLICIT_UNLOCK != 0 {
                    debug!(%key, "locked without implicit unlock");
                } else if align_or_flags & TABLE_OP_LIFETIME_UNLOCK != 0 {
                    if let Some(proxy) = self.ado.proxy_mut(slot) {
                        proxy.life_unlocks.push(grant.handle);
                    }
                } else if work_id == 0 {
                    // deferred unlock needs a work id to anchor to
                    self.store.unlock(pool, grant.handle, UnlockFlush::None)?;
                    status = Status::Inval;
                } else if let Some(proxy) = self.ado.proxy_mut(slot) {
                    proxy.add_deferred_unlock(work_id, grant.handle);
                }

                self.ado_send(
                    slot,
                    &AdoMessage::TableOpResponse {
                        status: status.to_i32(),
                        addr: grant.addr,
                        len: grant.len as u64,
                        key_handle: grant.handle,
                    },
                )
            }
            AdoOp::Erase => {
                let status = match self.store.erase(pool, &key) {
                    Ok(()) => {
                        self.indices.remove_key(pool, &key);
                        Status::Ok
                    }
                    Err(e) => e.status(),
                };
                self.ado_send(
                    slot,
                    &AdoMessage::TableOpResponse {
                        status: status.to_i32(),
                        addr: 0,
                        len: 0,
                        key_handle: 0,
                    },
                )
            }
            AdoOp::ValueResize => self.handle_value_resize(slot, pool, work_id, key, value_len),
            AdoOp::AllocatePoolMemory => {
                let response = match self.store.allocate_pool_memory(
                    pool,
                    value_len as usize,
                    align_or_flags as usize,
                ) {
                    Ok(out_addr) => AdoMessage::TableOpResponse {
                        status: Status::Ok.to_i32(),
                        addr: out_addr,
                        len: value_len,
                        key_handle: 0,
                    },
                    Err(e) => AdoMessage::TableOpResponse {
                        status: e.status().to_i32(),
                        addr: 0,
                        len: 0,
                        key_handle: 0,
                    },
                };
                self.ado_send(slot, &response)
            }
            AdoOp::FreePoolMemory => {
                let status = if value_len == 0 {
                    Status::Inval
                } else {
                    match self.store.free_pool_memory(pool, addr, value_len as usize) {
                        Ok(()) => Status::Ok,
                        Err(e) => {
                            warn!("table-op free failed: {e}");
                            e.status()
                        }
                    }
                };
                self.ado_send(
                    slot,
                    &AdoMessage::TableOpResponse {
                        status: status.to_i32(),
                        addr: 0,
                        len: 0,
                        key_handle: 0,
                    },
                )
            }
            AdoOp::PoolDelete | AdoOp::Close => Err(ShardError::Logic(format!(
                "op event code in table op: {op:?}"
            ))),
        }
    }

    fn handle_value_resize(
        &mut self,
        slot: usize,
        pool: PoolHandle,
        work_id: u64,
        key: String,
        value_len: u64,
    ) -> Result<()> {
        // resize requires unlock → resize → relock, updating whichever
        // unlock table holds the old handle
        if !self.ado.outstanding.contains_key(&work_id) {
            return self.ado_send(
                slot,
                &AdoMessage::TableOpResponse {
                    status: Status::Inval.to_i32(),
                    addr: 0,
                    len: 0,
                    key_handle: 0,
                },
            );
        }
        let old_handle = match self.ado.outstanding.get(&work_id) {
            Some(wr) => wr.key_handle,
            None => KEY_NONE,
        };
        if let Err(e) = self.store.unlock(pool, old_handle, UnlockFlush::None) {
            return self.ado_send(
                slot,
                &AdoMessage::TableOpResponse {
                    status: e.status().to_i32(),
                    addr: 0,
                    len: 0,
                    key_handle: 0,
                },
            );
        }
        let resize_status = match self.store.resize_value(pool, &key, value_len as usize, 8) {
            Ok(()) => Status::Ok,
            Err(e) => e.status(),
        };
        let grant = self
            .store
            .lock(pool, &key, LockKind::Write, 0)
            .map_err(|e| ShardError::Logic(format!("relock after resize failed: {e}")))?;
        if let Some(wr) = self.ado.outstanding.get_mut(&work_id) {
            wr.key_handle = grant.handle;
        }
        if let Some(proxy) = self.ado.proxy_mut(slot) {
            if !proxy.update_deferred_unlock(work_id, old_handle, grant.handle) {
                if let Some(pos) = proxy.life_unlocks.iter().position(|&h| h == old_handle) {
                    proxy.life_unlocks[pos] = grant.handle;
                }
            }
        }
        self.ado_send(
            slot,
            &AdoMessage::TableOpResponse {
                status: resize_status.to_i32(),
                addr: grant.addr,
                len: grant.len as u64,
                key_handle: grant.handle,
            },
        )
    }

    fn handle_pool_info(&mut self, slot: usize, sessions: &mut [Session]) -> Result<()> {
        let (pool, session_id) = match self.ado.proxy_mut(slot) {
            Some(p) => (p.pool_id, p.session_id),
            None => return Ok(()),
        };
        let (expected_obj_count, pool_size, pool_flags) = sessions
            .iter()
            .find(|s| s.id == session_id)
            .and_then(|s| s.pools.get_pool_info(pool))
            .unwrap_or((0, 0, 0));

        let memory_type = self
            .store
            .get_attribute(pool, Attribute::MemoryType, None)
            .unwrap_or(0);
        let percent_used = self.store.get_attribute(pool, Attribute::PercentUsed, None).ok();
        let count = self.store.get_attribute(pool, Attribute::Count, None).ok();

        let mut doc = serde_json::json!({
            "pool_size": pool_size,
            "memory_type": memory_type,
            "expected_obj_count": expected_obj_count,
            "pool_flags": pool_flags,
        });
        if let Some(pu) = percent_used {
            doc["percent_used"] = serde_json::json!(pu);
        }
        if let Some(c) = count {
            doc["current_object_count"] = serde_json::json!(c);
        }
        self.ado_send(
            slot,
            &AdoMessage::PoolInfoResponse {
                status: Status::Ok.to_i32(),
                info: doc.to_string(),
            },
        )
    }

    fn handle_op_event_response(&mut self, slot: usize, op: AdoOp) -> Result<()> {
        match op {
            AdoOp::PoolDelete => {
                // the client's delete already got its response; finish the
                // deferred close+delete now that the ADO acknowledged
                let (pool, name) = match self.ado.proxy_mut(slot) {
                    Some(p) => (p.pool_id, p.pool_name.clone()),
                    None => return Ok(()),
                };
                self.shutdown_ado_slot(slot);
                self.store.close_pool(pool)?;
                self.store
                    .delete_pool(&name)
                    .map_err(|e| ShardError::Logic(format!("pool delete after op event: {e}")))?;
                info!(pool, %name, "pool deleted after ADO acknowledgement");
                Ok(())
            }
            AdoOp::Close => {
                warn!("ignoring CLOSE op event from ADO");
                Ok(())
            }
            other => Err(ShardError::Logic(format!("unknown op event: {other:?}"))),
        }
    }

    fn handle_iterate(&mut self, slot: usize, iterator: u64, t_begin: u64, t_end: u64) -> Result<()> {
        let pool = match self.ado.proxy_mut(slot) {
            Some(p) => p.pool_id,
            None => return Ok(()),
        };
        let window = (
            (t_begin != 0).then_some(t_begin),
            (t_end != 0).then_some(t_end),
        );
        let iter = if iterator == 0 {
            match self.store.open_pool_iterator(pool) {
                Ok(it) => it,
                Err(_) => {
                    return self.ado_send(
                        slot,
                        &AdoMessage::IterateResponse {
                            status: Status::NotImpl.to_i32(),
                            iterator: 0,
                            key: String::new(),
                            value_addr: 0,
                            value_len: 0,
                            timestamp: 0,
                        },
                    )
                }
            }
        } else {
            iterator
        };

        // advance until an entry matches the window or the pool ends
        loop {
            match self.store.deref_pool_iterator(pool, iter, window) {
                Ok(entry) if entry.time_match => {
                    return self.ado_send(
                        slot,
                        &AdoMessage::IterateResponse {
                            status: Status::Ok.to_i32(),
                            iterator: iter,
                            key: entry.key,
                            value_addr: entry.value_addr,
                            value_len: entry.value_len as u64,
                            timestamp: entry.timestamp,
                        },
                    );
                }
                Ok(_) => continue,
                Err(BackendError::OutOfBounds) => {
                    let _ = self.store.close_pool_iterator(pool, iter);
                    return self.ado_send(
                        slot,
                        &AdoMessage::IterateResponse {
                            status: Status::OutOfBounds.to_i32(),
                            iterator: iter,
                            key: String::new(),
                            value_addr: 0,
                            value_len: 0,
                            timestamp: 0,
                        },
                    );
                }
                Err(e) => {
                    warn!("iterator deref failed: {e}");
                    return self.ado_send(
                        slot,
                        &AdoMessage::IterateResponse {
                            status: e.status().to_i32(),
                            iterator: iter,
                            key: String::new(),
                            value_addr: 0,
                            value_len: 0,
                            timestamp: 0,
                        },
                    );
                }
            }
        }
    }

    fn handle_vector(&mut self, slot: usize, t_begin: u64, t_end: u64) -> Result<()> {
        let pool = match self.ado.proxy_mut(slot) {
            Some(p) => p.pool_id,
            None => return Ok(()),
        };
        let window = (
            (t_begin != 0).then_some(t_begin),
            (t_end != 0).then_some(t_end),
        );

        // collect {key, key_len, value, value_len} tuples
        let mut entries: Vec<(u64, u64, u64, u64)> = Vec::new();
        self.store.map(pool, window, &mut |key, addr, len, _ts| {
            entries.push((key.as_ptr() as u64, key.len() as u64, addr, len as u64));
        })?;

        let count = entries.len() as u64;
        let buffer_len = 8 + entries.len() * 32;
        let addr = match self.store.allocate_pool_memory(pool, buffer_len, 8) {
            Ok(a) => a,
            Err(e) => {
                return self.ado_send(
                    slot,
                    &AdoMessage::VectorResponse {
                        status: e.status().to_i32(),
                        addr: 0,
                        len: 0,
                        count: 0,
                    },
                )
            }
        };
        // SAFETY: addr names buffer_len bytes just allocated from the pool.
        unsafe {
            let mut p = addr as *mut u8;
            p.cast::<u64>().write_unaligned(count);
            p = p.add(8);
            for (k, kl, v, vl) in &entries {
                for field in [*k, *kl, *v, *vl] {
                    p.cast::<u64>().write_unaligned(field);
                    p = p.add(8);
                }
            }
        }
        self.ado_send(
            slot,
            &AdoMessage::VectorResponse {
                status: Status::Ok.to_i32(),
                addr,
                len: buffer_len as u64,
                count,
            },
        )
    }

    fn handle_index_find(
        &mut self,
        slot: usize,
        expression: String,
        begin_pos: u64,
        find_type: mcas_ado_proto::FindType,
        max_comparisons: u32,
    ) -> Result<()> {
        let pool = match self.ado.proxy_mut(slot) {
            Some(p) => p.pool_id,
            None => return Ok(()),
        };
        let response = match self.indices.get(pool) {
            None => {
                warn!(pool, "ADO index find with no index enabled");
                AdoMessage::IndexResponse {
                    status: Status::Inval.to_i32(),
                    matched_pos: 0,
                    matched_key: "noindex".to_string(),
                }
            }
            Some(index) => {
                let budget = max_comparisons.min(MAX_INDEX_COMPARISONS) as usize;
                match index.find(&expression, begin_pos, find_type, budget) {
                    Ok(crate::index::FindOutcome::Found { position, key }) => {
                        AdoMessage::IndexResponse {
                            status: Status::Ok.to_i32(),
                            matched_pos: position,
                            matched_key: key,
                        }
                    }
                    Ok(crate::index::FindOutcome::Exhausted) => AdoMessage::IndexResponse {
                        status: Status::Fail.to_i32(),
                        matched_pos: 0,
                        matched_key: String::new(),
                    },
                    Ok(crate::index::FindOutcome::More { next_position }) => {
                        AdoMessage::IndexResponse {
                            status: Status::More.to_i32(),
                            matched_pos: next_position,
                            matched_key: String::new(),
                        }
                    }
                    Err(_) => AdoMessage::IndexResponse {
                        status: Status::Inval.to_i32(),
                        matched_pos: 0,
                        matched_key: String::new(),
                    },
                }
            }
        };
        self.ado_send(slot, &response)
    }

    fn handle_unlock_request(&mut self, slot: usize, work_id: u64, key_handle: KeyHandle) -> Result<()> {
        let (pool, implicit) = match self.ado.proxy_mut(slot) {
            Some(p) => (p.pool_id, p.has_implicit_unlock(work_id, key_handle)),
            None => return Ok(()),
        };
        // explicit unlock is only legal for locks taken with
        // NO_IMPLICIT_UNLOCK; refuse while an implicit unlock is owed
        let status = if key_handle == KEY_NONE || implicit {
            Status::Inval
        } else {
            match self.store.unlock(pool, key_handle, UnlockFlush::Flush) {
                Ok(()) => Status::Ok,
                Err(e) => e.status(),
            }
        };
        self.ado_send(slot, &AdoMessage::UnlockResponse { status: status.to_i32() })
    }

    fn handle_ado_configure(&mut self, slot: usize, options: u64) -> Result<()> {
        if let Some(proxy) = self.ado.proxy_mut(slot) {
            if options & CONFIG_SHARD_INC_REF != 0 {
                proxy.refcount += 1;
            }
            if options & CONFIG_SHARD_DEC_REF != 0 {
                proxy.refcount = proxy.refcount.saturating_sub(1);
            }
        }
        self.ado_send(
            slot,
            &AdoMessage::ConfigureResponse {
                status: Status::Ok.to_i32(),
            },
        )
    }
}
