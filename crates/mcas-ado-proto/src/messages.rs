//! The typed shard↔ADO message set.
//!
//! Messages are serialized into fixed-size slab entries; strings and
//! blobs are length-prefixed and bounded by the entry size. Every
//! request kind has a mirrored response kind.

use crate::error::{IpcError, Result};

/// Table-op flag: the lock persists until ADO shutdown.
pub const TABLE_OP_LIFETIME_UNLOCK: u64 = 1 << 60;
/// Table-op flag: the caller will unlock explicitly; no deferred unlock
/// is installed.
pub const TABLE_OP_NO_IMPLICIT_UNLOCK: u64 = 1 << 61;
/// Table-op flag: fail CREATE when the key already exists.
pub const TABLE_OP_CREATE_ONLY: u64 = 1 << 62;

/// Configure-request option: increment the proxy refcount.
pub const CONFIG_SHARD_INC_REF: u64 = 1;
/// Configure-request option: decrement the proxy refcount.
pub const CONFIG_SHARD_DEC_REF: u64 = 2;

/// Maximum response buffers per work completion.
pub const MAX_RESPONSE_BUFFERS: usize = 4;

/// Operation code for table ops and op events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AdoOp {
    /// Create a key-value pair.
    Create = 1,
    /// Open (lock) a key-value pair.
    Open = 2,
    /// Erase a key-value pair.
    Erase = 3,
    /// Resize the current invocation target's value.
    ValueResize = 4,
    /// Allocate raw pool memory.
    AllocatePoolMemory = 5,
    /// Free raw pool memory.
    FreePoolMemory = 6,
    /// Op event: the client requested pool deletion.
    PoolDelete = 10,
    /// Op event: the client closed the pool.
    Close = 11,
}

impl AdoOp {
    fn from_u32(v: u32) -> Result<AdoOp> {
        Ok(match v {
            1 => AdoOp::Create,
            2 => AdoOp::Open,
            3 => AdoOp::Erase,
            4 => AdoOp::ValueResize,
            5 => AdoOp::AllocatePoolMemory,
            6 => AdoOp::FreePoolMemory,
            10 => AdoOp::PoolDelete,
            11 => AdoOp::Close,
            _ => return Err(IpcError::BadMessage("bad ado op")),
        })
    }
}

/// Match mode for index find requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FindType {
    /// Regular-expression match.
    Regex = 1,
    /// Prefix match.
    Prefix = 2,
    /// Exact match.
    Exact = 3,
}

impl FindType {
    fn from_u32(v: u32) -> Result<FindType> {
        Ok(match v {
            1 => FindType::Regex,
            2 => FindType::Prefix,
            3 => FindType::Exact,
            _ => return Err(IpcError::BadMessage("bad find type")),
        })
    }
}

/// One buffer attached to a work completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBuffer {
    /// Reference into pool memory, left allocated.
    PoolRef {
        /// Plugin layer id.
        layer_id: u32,
        /// Buffer address in pool memory.
        addr: u64,
        /// Buffer length.
        len: u64,
    },
    /// Reference into pool memory the shard must free after responding.
    PoolRefFree {
        /// Plugin layer id.
        layer_id: u32,
        /// Buffer address in pool memory.
        addr: u64,
        /// Buffer length.
        len: u64,
    },
    /// Small payload carried inline in the channel message.
    Inline {
        /// Plugin layer id.
        layer_id: u32,
        /// Payload bytes.
        data: Vec<u8>,
    },
}

/// A shard↔ADO channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdoMessage {
    /// Shard→ADO: begin of session, pool identity.
    Bootstrap {
        /// Pool name.
        pool_name: String,
        /// Pool size in bytes.
        pool_size: u64,
        /// Pool flags.
        pool_flags: u32,
        /// Expected object count hint.
        expected_obj_count: u64,
        /// True when the pool existed before this open.
        opened_existing: bool,
    },
    /// Shard→ADO: one pool region mapping `{token, length, base}`.
    MemoryMap {
        /// Mapping token (segment id or exposed-memory token).
        token: u64,
        /// Region length.
        len: u64,
        /// Region base address in the shard.
        base: u64,
    },
    /// Shard→ADO: invoke the plugin chain.
    WorkRequest {
        /// Work-request key; echoed on the completion.
        work_key: u64,
        /// Target key (empty for key-less invocations).
        key: String,
        /// Locked value address (0 when key-less).
        value_addr: u64,
        /// Locked value length.
        value_len: u64,
        /// Detached buffer address (0 when absent).
        detached_addr: u64,
        /// Detached buffer length.
        detached_len: u64,
        /// Opaque invocation blob.
        request: Vec<u8>,
        /// True when the lock created the root value.
        new_root: bool,
    },
    /// ADO→shard: plugin chain finished.
    WorkCompletion {
        /// Echoed work-request key.
        work_key: u64,
        /// Completion status (possibly plugin-defined).
        status: i32,
        /// Response buffers.
        buffers: Vec<ResponseBuffer>,
    },
    /// ADO→shard: table operation.
    TableOp {
        /// Current work id (0 when outside an invocation).
        work_id: u64,
        /// Operation.
        op: AdoOp,
        /// Key operand.
        key: String,
        /// Value length / allocation size operand.
        value_len: u64,
        /// Alignment, or lock-lifetime flags for open/create.
        align_or_flags: u64,
        /// Address operand (free).
        addr: u64,
    },
    /// Shard→ADO: table operation result.
    TableOpResponse {
        /// Status.
        status: i32,
        /// Value / allocation address.
        addr: u64,
        /// Value length.
        len: u64,
        /// Lock handle, when a lock was taken.
        key_handle: u64,
    },
    /// ADO→shard: request aggregate pool attributes.
    PoolInfoRequest,
    /// Shard→ADO: aggregate pool attributes as JSON.
    PoolInfoResponse {
        /// Status.
        status: i32,
        /// JSON blob.
        info: String,
    },
    /// Shard→ADO: lifecycle event needing acknowledgement.
    OpEvent {
        /// Which event.
        op: AdoOp,
    },
    /// ADO→shard: lifecycle event acknowledged.
    OpEventResponse {
        /// Which event.
        op: AdoOp,
    },
    /// ADO→shard: open/advance a pool iterator.
    IterateRequest {
        /// Iterator handle; 0 requests a fresh iterator.
        iterator: u64,
        /// Window begin (seconds since epoch; 0 = unbounded).
        t_begin: u64,
        /// Window end (0 = unbounded).
        t_end: u64,
    },
    /// Shard→ADO: iterator position.
    IterateResponse {
        /// Status (`OutOfBounds` past the end).
        status: i32,
        /// Iterator handle.
        iterator: u64,
        /// Key at the position.
        key: String,
        /// Value address.
        value_addr: u64,
        /// Value length.
        value_len: u64,
        /// Entry timestamp.
        timestamp: u64,
    },
    /// ADO→shard: materialize a key-value reference vector.
    VectorRequest {
        /// Window begin (0 = unbounded).
        t_begin: u64,
        /// Window end (0 = unbounded).
        t_end: u64,
    },
    /// Shard→ADO: reference vector location.
    VectorResponse {
        /// Status.
        status: i32,
        /// Vector address in pool memory.
        addr: u64,
        /// Vector length in bytes.
        len: u64,
        /// Element count.
        count: u64,
    },
    /// ADO→shard: secondary-index find.
    IndexRequest {
        /// Match expression.
        expression: String,
        /// Start position.
        begin_pos: u64,
        /// Match mode.
        find_type: FindType,
        /// Comparison budget.
        max_comparisons: u32,
    },
    /// Shard→ADO: index find result.
    IndexResponse {
        /// Status.
        status: i32,
        /// Matched position.
        matched_pos: u64,
        /// Matched key.
        matched_key: String,
    },
    /// ADO→shard: explicit unlock of a no-implicit-unlock lock.
    UnlockRequest {
        /// Work id the lock was taken under.
        work_id: u64,
        /// The lock handle.
        key_handle: u64,
    },
    /// Shard→ADO: unlock result.
    UnlockResponse {
        /// Status.
        status: i32,
    },
    /// ADO→shard: mutate the proxy refcount.
    ConfigureRequest {
        /// Option bits (`CONFIG_SHARD_*`).
        options: u64,
    },
    /// Shard→ADO: configure result.
    ConfigureResponse {
        /// Status.
        status: i32,
    },
    /// Shard→ADO: forwarded cluster signal.
    ClusterEvent {
        /// Originating member.
        sender: String,
        /// Event type.
        event_type: String,
        /// Event content.
        content: String,
    },
    /// Shard→ADO: shut down the plugin chain and exit.
    Shutdown,
    /// Wake a peer blocked in a poll sleep. Carries nothing.
    Unblock,
}

// --------------------------------------------------------------------------
// codec

struct Enc {
    out: Vec<u8>,
}

impl Enc {
    fn new(kind: u32) -> Self {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&kind.to_le_bytes());
        Self { out }
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.u32(v as u32);
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn b(&mut self, v: bool) {
        self.out.push(v as u8);
    }

    fn bytes(&mut self, field: &'static str, v: &[u8]) -> Result<()> {
        if v.len() > u32::MAX as usize {
            return Err(IpcError::FieldTooLarge { field, len: v.len() });
        }
        self.u32(v.len() as u32);
        self.out.extend_from_slice(v);
        Ok(())
    }

    fn s(&mut self, field: &'static str, v: &str) -> Result<()> {
        self.bytes(field, v.as_bytes())
    }
}

struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(IpcError::BadMessage("truncated"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn b(&mut self) -> Result<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    fn s(&mut self) -> Result<String> {
        let b = self.bytes()?;
        String::from_utf8(b).map_err(|_| IpcError::BadMessage("bad utf-8"))
    }
}

mod kind {
    pub const BOOTSTRAP: u32 = 1;
    pub const MEMORY_MAP: u32 = 2;
    pub const WORK_REQUEST: u32 = 3;
    pub const WORK_COMPLETION: u32 = 4;
    pub const TABLE_OP: u32 = 5;
    pub const TABLE_OP_RESPONSE: u32 = 6;
    pub const POOL_INFO_REQUEST: u32 = 7;
    pub const POOL_INFO_RESPONSE: u32 = 8;
    pub const OP_EVENT: u32 = 9;
    pub const OP_EVENT_RESPONSE: u32 = 10;
    pub const ITERATE_REQUEST: u32 = 11;
    pub const ITERATE_RESPONSE: u32 = 12;
    pub const VECTOR_REQUEST: u32 = 13;
    pub const VECTOR_RESPONSE: u32 = 14;
    pub const INDEX_REQUEST: u32 = 15;
    pub const INDEX_RESPONSE: u32 = 16;
    pub const UNLOCK_REQUEST: u32 = 17;
    pub const UNLOCK_RESPONSE: u32 = 18;
    pub const CONFIGURE_REQUEST: u32 = 19;
    pub const CONFIGURE_RESPONSE: u32 = 20;
    pub const CLUSTER_EVENT: u32 = 21;
    pub const SHUTDOWN: u32 = 22;
    pub const UNBLOCK: u32 = 23;
}

impl AdoMessage {
    /// Serialize to bytes (kind tag + body).
    pub fn encode(&self) -> Result<Vec<u8>> {
        use AdoMessage::*;
        let enc = match self {
            Bootstrap {
                pool_name,
                pool_size,
                pool_flags,
                expected_obj_count,
                opened_existing,
            } => {
                let mut e = Enc::new(kind::BOOTSTRAP);
                e.s("pool_name", pool_name)?;
                e.u64(*pool_size);
                e.u32(*pool_flags);
                e.u64(*expected_obj_count);
                e.b(*opened_existing);
                e
            }
            MemoryMap { token, len, base } => {
                let mut e = Enc::new(kind::MEMORY_MAP);
                e.u64(*token);
                e.u64(*len);
                e.u64(*base);
                e
            }
            WorkRequest {
                work_key,
                key,
                value_addr,
                value_len,
                detached_addr,
                detached_len,
                request,
                new_root,
            } => {
                let mut e = Enc::new(kind::WORK_REQUEST);
                e.u64(*work_key);
                e.s("key", key)?;
                e.u64(*value_addr);
                e.u64(*value_len);
                e.u64(*detached_addr);
                e.u64(*detached_len);
                e.bytes("request", request)?;
                e.b(*new_root);
                e
            }
            WorkCompletion {
                work_key,
                status,
                buffers,
            } => {
                if buffers.len() > MAX_RESPONSE_BUFFERS {
                    return Err(IpcError::FieldTooLarge {
                        field: "response_buffers",
                        len: buffers.len(),
                    });
                }
                let mut e = Enc::new(kind::WORK_COMPLETION);
                e.u64(*work_key);
                e.i32(*status);
                e.u32(buffers.len() as u32);
                for b in buffers {
                    match b {
                        ResponseBuffer::PoolRef { layer_id, addr, len } => {
                            e.u32(0);
                            e.u32(*layer_id);
                            e.u64(*addr);
                            e.u64(*len);
                        }
                        ResponseBuffer::PoolRefFree { layer_id, addr, len } => {
                            e.u32(1);
                            e.u32(*layer_id);
                            e.u64(*addr);
                            e.u64(*len);
                        }
                        ResponseBuffer::Inline { layer_id, data } => {
                            e.u32(2);
                            e.u32(*layer_id);
                            e.bytes("inline_buffer", data)?;
                        }
                    }
                }
                e
            }
            TableOp {
                work_id,
                op,
                key,
                value_len,
                align_or_flags,
                addr,
            } => {
                let mut e = Enc::new(kind::TABLE_OP);
                e.u64(*work_id);
                e.u32(*op as u32);
                e.s("key", key)?;
                e.u64(*value_len);
                e.u64(*align_or_flags);
                e.u64(*addr);
                e
            }
            TableOpResponse {
                status,
                addr,
                len,
                key_handle,
            } => {
                let mut e = Enc::new(kind::TABLE_OP_RESPONSE);
                e.i32(*status);
                e.u64(*addr);
                e.u64(*len);
                e.u64(*key_handle);
                e
            }
            PoolInfoRequest => Enc::new(kind::POOL_INFO_REQUEST),
            PoolInfoResponse { status, info } => {
                let mut e = Enc::new(kind::POOL_INFO_RESPONSE);
                e.i32(*status);
                e.s("info", info)?;
                e
            }
            OpEvent { op } => {
                let mut e = Enc::new(kind::OP_EVENT);
                e.u32(*op as u32);
                e
            }
            OpEventResponse { op } => {
                let mut e = Enc::new(kind::OP_EVENT_RESPONSE);
                e.u32(*op as u32);
                e
            }
            IterateRequest {
                iterator,
                t_begin,
                t_end,
            } => {
                let mut e = Enc::new(kind::ITERATE_REQUEST);
                e.u64(*iterator);
                e.u64(*t_begin);
                e.u64(*t_end);
                e
            }
            IterateResponse {
                status,
                iterator,
                key,
                value_addr,
                value_len,
                timestamp,
            } => {
                let mut e = Enc::new(kind::ITERATE_RESPONSE);
                e.i32(*status);
                e.u64(*iterator);
                e.s("key", key)?;
                e.u64(*value_addr);
                e.u64(*value_len);
                e.u64(*timestamp);
                e
            }
            VectorRequest { t_begin, t_end } => {
                let mut e = Enc::new(kind::VECTOR_REQUEST);
                e.u64(*t_begin);
                e.u64(*t_end);
                e
            }
            VectorResponse {
                status,
                addr,
                len,
                count,
            } => {
                let mut e = Enc::new(kind::VECTOR_RESPONSE);
                e.i32(*status);
                e.u64(*addr);
                e.u64(*len);
                e.u64(*count);
                e
            }
            IndexRequest {
                expression,
                begin_pos,
                find_type,
                max_comparisons,
            } => {
                let mut e = Enc::new(kind::INDEX_REQUEST);
                e.s("expression", expression)?;
                e.u64(*begin_pos);
                e.u32(*find_type as u32);
                e.u32(*max_comparisons);
                e
            }
            IndexResponse {
                status,
                matched_pos,
                matched_key,
            } => {
                let mut e = Enc::new(kind::INDEX_RESPONSE);
                e.i32(*status);
                e.u64(*matched_pos);
                e.s("matched_key", matched_key)?;
                e
            }
            UnlockRequest {
                work_id,
                key_handle,
            } => {
                let mut e = Enc::new(kind::UNLOCK_REQUEST);
                e.u64(*work_id);
                e.u64(*key_handle);
                e
            }
            UnlockResponse { status } => {
                let mut e = Enc::new(kind::UNLOCK_RESPONSE);
                e.i32(*status);
                e
            }
            ConfigureRequest { options } => {
                let mut e = Enc::new(kind::CONFIGURE_REQUEST);
                e.u64(*options);
                e
            }
            ConfigureResponse { status } => {
                let mut e = Enc::new(kind::CONFIGURE_RESPONSE);
                e.i32(*status);
                e
            }
            ClusterEvent {
                sender,
                event_type,
                content,
            } => {
                let mut e = Enc::new(kind::CLUSTER_EVENT);
                e.s("sender", sender)?;
                e.s("event_type", event_type)?;
                e.s("content", content)?;
                e
            }
            Shutdown => Enc::new(kind::SHUTDOWN),
            Unblock => Enc::new(kind::UNBLOCK),
        };
        Ok(enc.out)
    }

    /// Deserialize from bytes.
    pub fn decode(buf: &[u8]) -> Result<AdoMessage> {
        let mut d = Dec::new(buf);
        let k = d.u32()?;
        Ok(match k {
            kind::BOOTSTRAP => AdoMessage::Bootstrap {
                pool_name: d.s()?,
                pool_size: d.u64()?,
                pool_flags: d.u32()?,
                expected_obj_count: d.u64()?,
                opened_existing: d.b()?,
            },
            kind::MEMORY_MAP => AdoMessage::MemoryMap {
                token: d.u64()?,
                len: d.u64()?,
                base: d.u64()?,
            },
            kind::WORK_REQUEST => AdoMessage::WorkRequest {
                work_key: d.u64()?,
                key: d.s()?,
                value_addr: d.u64()?,
                value_len: d.u64()?,
                detached_addr: d.u64()?,
                detached_len: d.u64()?,
                request: d.bytes()?,
                new_root: d.b()?,
            },
            kind::WORK_COMPLETION => {
                let work_key = d.u64()?;
                let status = d.i32()?;
                let count = d.u32()? as usize;
                if count > MAX_RESPONSE_BUFFERS {
                    return Err(IpcError::BadMessage("too many response buffers"));
                }
                let mut buffers = Vec::with_capacity(count);
                for _ in 0..count {
                    let tag = d.u32()?;
                    let layer_id = d.u32()?;
                    buffers.push(match tag {
                        0 => ResponseBuffer::PoolRef {
                            layer_id,
                            addr: d.u64()?,
                            len: d.u64()?,
                        },
                        1 => ResponseBuffer::PoolRefFree {
                            layer_id,
                            addr: d.u64()?,
                            len: d.u64()?,
                        },
                        2 => ResponseBuffer::Inline {
                            layer_id,
                            data: d.bytes()?,
                        },
                        _ => return Err(IpcError::BadMessage("bad buffer tag")),
                    });
                }
                AdoMessage::WorkCompletion {
                    work_key,
                    status,
                    buffers,
                }
            }
            kind::TABLE_OP => AdoMessage::TableOp {
                work_id: d.u64()?,
                op: AdoOp::from_u32(d.u32()?)?,
                key: d.s()?,
                value_len: d.u64()?,
                align_or_flags: d.u64()?,
                addr: d.u64()?,
            },
            kind::TABLE_OP_RESPONSE => AdoMessage::TableOpResponse {
                status: d.i32()?,
                addr: d.u64()?,
                len: d.u64()?,
                key_handle: d.u64()?,
            },
            kind::POOL_INFO_REQUEST => AdoMessage::PoolInfoRequest,
            kind::POOL_INFO_RESPONSE => AdoMessage::PoolInfoResponse {
                status: d.i32()?,
                info: d.s()?,
            },
            kind::OP_EVENT => AdoMessage::OpEvent {
                op: AdoOp::from_u32(d.u32()?)?,
            },
            kind::OP_EVENT_RESPONSE => AdoMessage::OpEventResponse {
                op: AdoOp::from_u32(d.u32()?)?,
            },
            kind::ITERATE_REQUEST => AdoMessage::IterateRequest {
                iterator: d.u64()?,
                t_begin: d.u64()?,
                t_end: d.u64()?,
            },
            kind::ITERATE_RESPONSE => AdoMessage::IterateResponse {
                status: d.i32()?,
                iterator: d.u64()?,
                key: d.s()?,
                value_addr: d.u64()?,
                value_len: d.u64()?,
                timestamp: d.u64()?,
            },
            kind::VECTOR_REQUEST => AdoMessage::VectorRequest {
                t_begin: d.u64()?,
                t_end: d.u64()?,
            },
            kind::VECTOR_RESPONSE => AdoMessage::VectorResponse {
                status: d.i32()?,
                addr: d.u64()?,
                len: d.u64()?,
                count: d.u64()?,
            },
            kind::INDEX_REQUEST => AdoMessage::IndexRequest {
                expression: d.s()?,
                begin_pos: d.u64()?,
                find_type: FindType::from_u32(d.u32()?)?,
                max_comparisons: d.u32()?,
            },
            kind::INDEX_RESPONSE => AdoMessage::IndexResponse {
                status: d.i32()?,
                matched_pos: d.u64()?,
                matched_key: d.s()?,
            },
            kind::UNLOCK_REQUEST => AdoMessage::UnlockRequest {
                work_id: d.u64()?,
                key_handle: d.u64()?,
            },
            kind::UNLOCK_RESPONSE => AdoMessage::UnlockResponse { status: d.i32()? },
            kind::CONFIGURE_REQUEST => AdoMessage::ConfigureRequest { options: d.u64()? },
            kind::CONFIGURE_RESPONSE => AdoMessage::ConfigureResponse { status: d.i32()? },
            kind::CLUSTER_EVENT => AdoMessage::ClusterEvent {
                sender: d.s()?,
                event_type: d.s()?,
                content: d.s()?,
            },
            kind::SHUTDOWN => AdoMessage::Shutdown,
            kind::UNBLOCK => AdoMessage::Unblock,
            _ => return Err(IpcError::BadMessage("unknown kind")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_request_round_trip() {
        let msg = AdoMessage::WorkRequest {
            work_key: 0xDEAD,
            key: "k".to_string(),
            value_addr: 0x1000,
            value_len: 64,
            detached_addr: 0,
            detached_len: 0,
            request: b"do-something".to_vec(),
            new_root: true,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(AdoMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_work_completion_with_buffers_round_trip() {
        let msg = AdoMessage::WorkCompletion {
            work_key: 7,
            status: 0,
            buffers: vec![
                ResponseBuffer::PoolRefFree {
                    layer_id: 0,
                    addr: 0x2000,
                    len: 128,
                },
                ResponseBuffer::Inline {
                    layer_id: 1,
                    data: b"ok".to_vec(),
                },
            ],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(AdoMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_every_plain_kind_round_trips() {
        let msgs = vec![
            AdoMessage::PoolInfoRequest,
            AdoMessage::PoolInfoResponse {
                status: 0,
                info: "{}".to_string(),
            },
            AdoMessage::OpEvent { op: AdoOp::PoolDelete },
            AdoMessage::OpEventResponse { op: AdoOp::PoolDelete },
            AdoMessage::IterateRequest { iterator: 0, t_begin: 0, t_end: 0 },
            AdoMessage::VectorRequest { t_begin: 1, t_end: 2 },
            AdoMessage::IndexRequest {
                expression: "cat/".to_string(),
                begin_pos: 0,
                find_type: FindType::Prefix,
                max_comparisons: 100,
            },
            AdoMessage::UnlockRequest { work_id: 1, key_handle: 2 },
            AdoMessage::ConfigureRequest { options: CONFIG_SHARD_DEC_REF },
            AdoMessage::ClusterEvent {
                sender: "n1".to_string(),
                event_type: "join".to_string(),
                content: "x".to_string(),
            },
            AdoMessage::Shutdown,
            AdoMessage::Unblock,
        ];
        for m in msgs {
            let bytes = m.encode().unwrap();
            assert_eq!(AdoMessage::decode(&bytes).unwrap(), m);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(AdoMessage::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        assert!(AdoMessage::decode(&[]).is_err());
    }
}
