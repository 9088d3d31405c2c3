//! Request and response message codecs, one type per operation class.
//!
//! Encoding convention: the framing header is written first with a zero
//! length, the body follows, and the length field is patched to cover
//! the whole buffer. Decoding validates the header type before touching
//! the body.

use crate::error::{ProtocolError, Result};
use crate::header::{MessageHeader, MsgType, HEADER_SIZE};
use crate::status::Status;
use crate::wire::{Reader, Writer};

fn decode_header(buf: &[u8], expected: MsgType) -> Result<MessageHeader> {
    let header = MessageHeader::decode(buf)?;
    if header.type_id != expected {
        return Err(ProtocolError::UnexpectedType {
            expected,
            got: header.type_id as u16,
        });
    }
    Ok(header)
}

// ============================================================================
// Pool operations
// ============================================================================

/// Pool lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolOp {
    /// Create a pool (open if it exists, unless create-only).
    Create = 1,
    /// Open an existing pool.
    Open = 2,
    /// Close an open pool handle.
    Close = 3,
    /// Delete a pool by handle or name.
    Delete = 4,
}

impl PoolOp {
    fn from_u8(v: u8) -> Result<PoolOp> {
        match v {
            1 => Ok(PoolOp::Create),
            2 => Ok(PoolOp::Open),
            3 => Ok(PoolOp::Close),
            4 => Ok(PoolOp::Delete),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Pool lifecycle request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRequest {
    /// Authentication id, round-tripped into the response.
    pub auth_id: u64,
    /// Request id for correlation.
    pub request_id: u64,
    /// Which lifecycle operation.
    pub op: PoolOp,
    /// Pool flags (create-only etc.).
    pub flags: u32,
    /// Pool handle, for close/delete-by-handle.
    pub pool_id: u64,
    /// Requested pool size in bytes (create).
    pub pool_size: u64,
    /// Expected object count hint (create).
    pub expected_obj_count: u64,
    /// Pool name (create/open/delete-by-name).
    pub name: String,
}

impl PoolRequest {
    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::PoolRequest, self.auth_id, self.request_id, Status::Ok)
            .encode(out);
        let mut w = Writer::new(out);
        w.u8(self.op as u8);
        w.u32(self.flags);
        w.u64(self.pool_id);
        w.u64(self.pool_size);
        w.u64(self.expected_obj_count);
        w.u64(self.name.len() as u64);
        w.bytes(self.name.as_bytes());
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<PoolRequest> {
        let header = decode_header(buf, MsgType::PoolRequest)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        let op = PoolOp::from_u8(r.u8()?)?;
        let flags = r.u32()?;
        let pool_id = r.u64()?;
        let pool_size = r.u64()?;
        let expected_obj_count = r.u64()?;
        let name_len = r.u64()?;
        let name_len = r.checked_len("pool_name_len", name_len)?;
        let name = String::from_utf8_lossy(r.bytes(name_len)?).into_owned();
        Ok(PoolRequest {
            auth_id: header.auth_id,
            request_id: header.request_id,
            op,
            flags,
            pool_id,
            pool_size,
            expected_obj_count,
            name,
        })
    }
}

/// Pool lifecycle response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolResponse {
    /// Echoed authentication id.
    pub auth_id: u64,
    /// Echoed request id.
    pub request_id: u64,
    /// Final status.
    pub status: Status,
    /// Pool handle (0 on failure).
    pub pool_id: u64,
}

impl PoolResponse {
    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::PoolResponse, self.auth_id, self.request_id, self.status)
            .encode(out);
        Writer::new(out).u64(self.pool_id);
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<PoolResponse> {
        let header = decode_header(buf, MsgType::PoolResponse)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        Ok(PoolResponse {
            auth_id: header.auth_id,
            request_id: header.request_id,
            status: header.status,
            pool_id: r.u64()?,
        })
    }
}

// ============================================================================
// IO operations
// ============================================================================

/// IO operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoOp {
    /// Inline put.
    Put = 1,
    /// Get (inline or inline-split).
    Get = 2,
    /// Erase a key.
    Erase = 3,
    /// Pool configure command (index management).
    Configure = 4,
    /// Announce a two-stage write (legacy spelling).
    PutAdvance = 5,
    /// Announce a two-stage write.
    PutLocate = 6,
    /// Complete a two-stage write by target address.
    PutRelease = 7,
    /// Open a two-stage read.
    GetLocate = 8,
    /// Complete a two-stage read by target address.
    GetRelease = 9,
    /// Offset-based locate over raw pool regions.
    Locate = 10,
    /// Release an offset-based locate.
    Release = 11,
    /// Release an offset-based locate, flushing each SG element first.
    ReleaseWithFlush = 12,
}

impl IoOp {
    fn from_u8(v: u8) -> Result<IoOp> {
        Ok(match v {
            1 => IoOp::Put,
            2 => IoOp::Get,
            3 => IoOp::Erase,
            4 => IoOp::Configure,
            5 => IoOp::PutAdvance,
            6 => IoOp::PutLocate,
            7 => IoOp::PutRelease,
            8 => IoOp::GetLocate,
            9 => IoOp::GetRelease,
            10 => IoOp::Locate,
            11 => IoOp::Release,
            12 => IoOp::ReleaseWithFlush,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// IO request. Field order on the wire:
/// op, pool_id, flags, offset, size, addr, mr_key, key_len, value_len,
/// key bytes, value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    /// Authentication id.
    pub auth_id: u64,
    /// Request id.
    pub request_id: u64,
    /// Operation.
    pub op: IoOp,
    /// Target pool handle.
    pub pool_id: u64,
    /// IO flags.
    pub flags: u32,
    /// Byte offset (LOCATE / RELEASE family).
    pub offset: u64,
    /// Byte size: LOCATE range length, announced value length for
    /// two-stage writes, or client buffer capacity on GET.
    pub size: u64,
    /// Target address (PUT_RELEASE / GET_RELEASE).
    pub addr: u64,
    /// Remote-key echo; reserved on most operations.
    pub mr_key: u64,
    /// Key, or configure command for `IoOp::Configure`.
    pub key: String,
    /// Inline value (PUT), or empty.
    pub value: Vec<u8>,
}

impl IoRequest {
    /// Announced value length for two-stage writes; carried in `size`.
    pub fn value_len(&self) -> u64 {
        if self.value.is_empty() {
            self.size
        } else {
            self.value.len() as u64
        }
    }

    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::IoRequest, self.auth_id, self.request_id, Status::Ok)
            .encode(out);
        let mut w = Writer::new(out);
        w.u8(self.op as u8);
        w.u64(self.pool_id);
        w.u32(self.flags);
        w.u64(self.offset);
        w.u64(self.size);
        w.u64(self.addr);
        w.u64(self.mr_key);
        w.u32(self.key.len() as u32);
        w.u32(self.value.len() as u32);
        w.bytes(self.key.as_bytes());
        w.bytes(&self.value);
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<IoRequest> {
        let header = decode_header(buf, MsgType::IoRequest)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        let op = IoOp::from_u8(r.u8()?)?;
        let pool_id = r.u64()?;
        let flags = r.u32()?;
        let offset = r.u64()?;
        let size = r.u64()?;
        let addr = r.u64()?;
        let mr_key = r.u64()?;
        let key_len = r.u32()? as u64;
        let value_len = r.u32()? as u64;
        let key_len = r.checked_len("key_len", key_len)?;
        let key = String::from_utf8_lossy(r.bytes(key_len)?).into_owned();
        let value_len = r.checked_len("value_len", value_len)?;
        let value = r.bytes(value_len)?.to_vec();
        Ok(IoRequest {
            auth_id: header.auth_id,
            request_id: header.request_id,
            op,
            pool_id,
            flags,
            offset,
            size,
            addr,
            mr_key,
            key,
            value,
        })
    }
}

/// One element of a scatter-gather list, as carried in LOCATE responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgElement {
    /// Absolute address of the element.
    pub addr: u64,
    /// Length in bytes.
    pub len: u64,
}

/// IO response.
///
/// `data_len` is the logical value length; `data` holds inline bytes (or
/// an encoded SG list) and may be empty while `data_len` is not: the
/// two-stage GET announces the length without shipping the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoResponse {
    /// Echoed authentication id.
    pub auth_id: u64,
    /// Echoed request id.
    pub request_id: u64,
    /// Final status.
    pub status: Status,
    /// Target address (two-stage paths).
    pub addr: u64,
    /// Remote key authorizing RDMA to the target (two-stage paths).
    pub mr_key: u64,
    /// Logical data length.
    pub data_len: u64,
    /// Inline data or encoded SG list.
    pub data: Vec<u8>,
}

impl IoResponse {
    /// An empty response carrying only a status.
    pub fn status_only(auth_id: u64, request_id: u64, status: Status) -> IoResponse {
        IoResponse {
            auth_id,
            request_id,
            status,
            addr: 0,
            mr_key: 0,
            data_len: 0,
            data: Vec::new(),
        }
    }

    /// Store a scatter-gather list as the response data.
    pub fn set_sg_list(&mut self, list: &[SgElement]) {
        let mut data = Vec::with_capacity(list.len() * 16);
        {
            let mut w = Writer::new(&mut data);
            for e in list {
                w.u64(e.addr);
                w.u64(e.len);
            }
        }
        self.data_len = data.len() as u64;
        self.data = data;
    }

    /// Parse the response data as a scatter-gather list.
    pub fn sg_list(&self) -> Result<Vec<SgElement>> {
        if self.data.len() % 16 != 0 {
            return Err(ProtocolError::BadLength {
                field: "sg_list",
                value: self.data.len() as u64,
            });
        }
        let mut r = Reader::new(&self.data);
        let mut out = Vec::with_capacity(self.data.len() / 16);
        while r.remaining() > 0 {
            out.push(SgElement {
                addr: r.u64()?,
                len: r.u64()?,
            });
        }
        Ok(out)
    }

    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::IoResponse, self.auth_id, self.request_id, self.status)
            .encode(out);
        let mut w = Writer::new(out);
        w.u64(self.addr);
        w.u64(self.mr_key);
        w.u64(self.data_len);
        w.bytes(&self.data);
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<IoResponse> {
        let header = decode_header(buf, MsgType::IoResponse)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        let addr = r.u64()?;
        let mr_key = r.u64()?;
        let data_len = r.u64()?;
        let data = r.bytes(r.remaining())?.to_vec();
        Ok(IoResponse {
            auth_id: header.auth_id,
            request_id: header.request_id,
            status: header.status,
            addr,
            mr_key,
            data_len,
            data,
        })
    }
}

// ============================================================================
// ADO operations
// ============================================================================

/// ADO invocation request (no payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdoRequest {
    /// Authentication id.
    pub auth_id: u64,
    /// Request id.
    pub request_id: u64,
    /// Target pool handle.
    pub pool_id: u64,
    /// ADO flags.
    pub flags: u64,
    /// On-demand value length for create-on-lock.
    pub ondemand_val_len: u64,
    /// Key (empty for key-less invocations).
    pub key: String,
    /// Opaque invocation blob handed to the plugin.
    pub request: Vec<u8>,
}

impl AdoRequest {
    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::AdoRequest, self.auth_id, self.request_id, Status::Ok)
            .encode(out);
        let mut w = Writer::new(out);
        w.u64(self.pool_id);
        w.u64(self.flags);
        w.u32(self.key.len() as u32);
        w.u32(self.request.len() as u32);
        w.u64(self.ondemand_val_len);
        w.bytes(self.key.as_bytes());
        w.bytes(&self.request);
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<AdoRequest> {
        let header = decode_header(buf, MsgType::AdoRequest)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        let pool_id = r.u64()?;
        let flags = r.u64()?;
        let key_len = r.u32()? as u64;
        let request_len = r.u32()? as u64;
        let ondemand_val_len = r.u64()?;
        let key_len = r.checked_len("key_len", key_len)?;
        let key = String::from_utf8_lossy(r.bytes(key_len)?).into_owned();
        let request_len = r.checked_len("request_len", request_len)?;
        let request = r.bytes(request_len)?.to_vec();
        Ok(AdoRequest {
            auth_id: header.auth_id,
            request_id: header.request_id,
            pool_id,
            flags,
            ondemand_val_len,
            key,
            request,
        })
    }
}

/// ADO invocation carrying a value payload to put before invoking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutAdoRequest {
    /// Authentication id.
    pub auth_id: u64,
    /// Request id.
    pub request_id: u64,
    /// Target pool handle.
    pub pool_id: u64,
    /// ADO flags.
    pub flags: u64,
    /// On-demand value length for create-on-lock.
    pub ondemand_val_len: u64,
    /// Root value length for detached puts.
    pub root_val_len: u64,
    /// Key.
    pub key: String,
    /// Opaque invocation blob.
    pub request: Vec<u8>,
    /// Value payload.
    pub value: Vec<u8>,
}

impl PutAdoRequest {
    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::PutAdoRequest, self.auth_id, self.request_id, Status::Ok)
            .encode(out);
        let mut w = Writer::new(out);
        w.u64(self.pool_id);
        w.u64(self.flags);
        w.u32(self.key.len() as u32);
        w.u32(self.request.len() as u32);
        w.u64(self.ondemand_val_len);
        w.u32(self.value.len() as u32);
        w.u64(self.root_val_len);
        w.bytes(self.key.as_bytes());
        w.bytes(&self.request);
        w.bytes(&self.value);
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<PutAdoRequest> {
        let header = decode_header(buf, MsgType::PutAdoRequest)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        let pool_id = r.u64()?;
        let flags = r.u64()?;
        let key_len = r.u32()? as u64;
        let request_len = r.u32()? as u64;
        let ondemand_val_len = r.u64()?;
        let value_len = r.u32()? as u64;
        let root_val_len = r.u64()?;
        let key_len = r.checked_len("key_len", key_len)?;
        let key = String::from_utf8_lossy(r.bytes(key_len)?).into_owned();
        let request_len = r.checked_len("request_len", request_len)?;
        let request = r.bytes(request_len)?.to_vec();
        let value_len = r.checked_len("value_len", value_len)?;
        let value = r.bytes(value_len)?.to_vec();
        Ok(PutAdoRequest {
            auth_id: header.auth_id,
            request_id: header.request_id,
            pool_id,
            flags,
            ondemand_val_len,
            root_val_len,
            key,
            request,
            value,
        })
    }
}

/// One layered buffer in an ADO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdoResponseBuffer {
    /// Plugin layer that produced the buffer.
    pub layer_id: u32,
    /// Buffer contents.
    pub data: Vec<u8>,
}

/// ADO completion response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdoResponse {
    /// Echoed authentication id.
    pub auth_id: u64,
    /// Echoed request id.
    pub request_id: u64,
    /// Final status (possibly plugin-defined).
    pub status: Status,
    /// Response buffers, in plugin order.
    pub buffers: Vec<AdoResponseBuffer>,
}

impl AdoResponse {
    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::AdoResponse, self.auth_id, self.request_id, self.status)
            .encode(out);
        let mut w = Writer::new(out);
        w.u32(self.buffers.len() as u32);
        for b in &self.buffers {
            w.u32(b.layer_id);
            w.u32(b.data.len() as u32);
            w.bytes(&b.data);
        }
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<AdoResponse> {
        let header = decode_header(buf, MsgType::AdoResponse)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        let count = r.u32()?;
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let layer_id = r.u32()?;
            let len = r.u32()? as u64;
            let len = r.checked_len("response_buffer_len", len)?;
            buffers.push(AdoResponseBuffer {
                layer_id,
                data: r.bytes(len)?.to_vec(),
            });
        }
        Ok(AdoResponse {
            auth_id: header.auth_id,
            request_id: header.request_id,
            status: header.status,
            buffers,
        })
    }
}

// ============================================================================
// Info operations
// ============================================================================

/// INFO request type: find the next key matching an expression.
pub const INFO_TYPE_FIND_KEY: u32 = 0xF0;
/// INFO request type: shard statistics.
pub const INFO_TYPE_GET_STATS: u32 = 0xF1;

/// Attribute ids usable as INFO request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Attribute {
    /// Object count in the pool.
    Count = 1,
    /// Length of a given key's value.
    ValueLen = 2,
    /// Memory type backing the pool.
    MemoryType = 3,
    /// Percentage of the pool in use.
    PercentUsed = 4,
    /// CRC32 of a given key's value.
    Crc32 = 5,
}

impl Attribute {
    /// Decode an attribute id.
    pub fn from_u32(v: u32) -> Option<Attribute> {
        match v {
            1 => Some(Attribute::Count),
            2 => Some(Attribute::ValueLen),
            3 => Some(Attribute::MemoryType),
            4 => Some(Attribute::PercentUsed),
            5 => Some(Attribute::Crc32),
            _ => None,
        }
    }
}

/// Attribute / stats / find-key request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Authentication id.
    pub auth_id: u64,
    /// Request id.
    pub request_id: u64,
    /// Request type: an [`Attribute`] id, [`INFO_TYPE_FIND_KEY`], or
    /// [`INFO_TYPE_GET_STATS`].
    pub info_type: u32,
    /// Target pool handle.
    pub pool_id: u64,
    /// Start position for find-key.
    pub offset: u64,
    /// Key for attribute queries; match expression for find-key.
    pub key: String,
}

impl InfoRequest {
    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::InfoRequest, self.auth_id, self.request_id, Status::Ok)
            .encode(out);
        let mut w = Writer::new(out);
        w.u32(self.info_type);
        w.u64(self.pool_id);
        w.u64(self.offset);
        w.u64(self.key.len() as u64);
        w.bytes(self.key.as_bytes());
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<InfoRequest> {
        let header = decode_header(buf, MsgType::InfoRequest)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        let info_type = r.u32()?;
        let pool_id = r.u64()?;
        let offset = r.u64()?;
        let key_len = r.u64()?;
        let key_len = r.checked_len("key_len", key_len)?;
        let key = String::from_utf8_lossy(r.bytes(key_len)?).into_owned();
        Ok(InfoRequest {
            auth_id: header.auth_id,
            request_id: header.request_id,
            info_type,
            pool_id,
            offset,
            key,
        })
    }
}

/// Attribute / find-key response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Echoed authentication id.
    pub auth_id: u64,
    /// Echoed request id.
    pub request_id: u64,
    /// Final status.
    pub status: Status,
    /// Numeric attribute value.
    pub value: u64,
    /// Match position for find-key.
    pub offset: u64,
    /// Matched key bytes for find-key.
    pub data: Vec<u8>,
}

impl InfoResponse {
    /// A response carrying only a status.
    pub fn status_only(auth_id: u64, request_id: u64, status: Status) -> InfoResponse {
        InfoResponse {
            auth_id,
            request_id,
            status,
            value: 0,
            offset: 0,
            data: Vec::new(),
        }
    }

    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::InfoResponse, self.auth_id, self.request_id, self.status)
            .encode(out);
        let mut w = Writer::new(out);
        w.u64(self.value);
        w.u64(self.offset);
        w.u64(self.data.len() as u64);
        w.bytes(&self.data);
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<InfoResponse> {
        let header = decode_header(buf, MsgType::InfoResponse)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        let value = r.u64()?;
        let offset = r.u64()?;
        let data_len = r.u64()?;
        let data_len = r.checked_len("data_len", data_len)?;
        let data = r.bytes(data_len)?.to_vec();
        Ok(InfoResponse {
            auth_id: header.auth_id,
            request_id: header.request_id,
            status: header.status,
            value,
            offset,
            data,
        })
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-shard operation counters, exposed via the stats INFO request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    /// Total requests dispatched.
    pub op_request_count: u64,
    /// Inline puts.
    pub op_put_count: u64,
    /// Inline gets.
    pub op_get_count: u64,
    /// Two-stage put announcements.
    pub op_put_direct_count: u64,
    /// Two-stage get locates.
    pub op_get_direct_count: u64,
    /// Inline-split (two-buffer) gets.
    pub op_get_twostage_count: u64,
    /// Offset-based locates.
    pub op_locate_count: u64,
    /// Erases.
    pub op_erase_count: u64,
    /// ADO invocations.
    pub op_ado_count: u64,
    /// Requests that failed.
    pub op_failed_request_count: u64,
    /// Connected sessions at last tick.
    pub client_count: u64,
}

/// Shard statistics response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsResponse {
    /// Echoed authentication id.
    pub auth_id: u64,
    /// Echoed request id.
    pub request_id: u64,
    /// Final status.
    pub status: Status,
    /// The counters.
    pub stats: ShardStats,
}

impl StatsResponse {
    /// Encode into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(MsgType::StatsResponse, self.auth_id, self.request_id, self.status)
            .encode(out);
        let s = &self.stats;
        let mut w = Writer::new(out);
        for v in [
            s.op_request_count,
            s.op_put_count,
            s.op_get_count,
            s.op_put_direct_count,
            s.op_get_direct_count,
            s.op_get_twostage_count,
            s.op_locate_count,
            s.op_erase_count,
            s.op_ado_count,
            s.op_failed_request_count,
            s.client_count,
        ] {
            w.u64(v);
        }
        MessageHeader::patch_length(out);
    }

    /// Decode from a complete message buffer.
    pub fn decode(buf: &[u8]) -> Result<StatsResponse> {
        let header = decode_header(buf, MsgType::StatsResponse)?;
        let mut r = Reader::new(&buf[HEADER_SIZE..]);
        let stats = ShardStats {
            op_request_count: r.u64()?,
            op_put_count: r.u64()?,
            op_get_count: r.u64()?,
            op_put_direct_count: r.u64()?,
            op_get_direct_count: r.u64()?,
            op_get_twostage_count: r.u64()?,
            op_locate_count: r.u64()?,
            op_erase_count: r.u64()?,
            op_ado_count: r.u64()?,
            op_failed_request_count: r.u64()?,
            client_count: r.u64()?,
        };
        Ok(StatsResponse {
            auth_id: header.auth_id,
            request_id: header.request_id,
            status: header.status,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_request_round_trip() {
        let req = PoolRequest {
            auth_id: 11,
            request_id: 22,
            op: PoolOp::Create,
            flags: 1,
            pool_id: 0,
            pool_size: 16 << 20,
            expected_obj_count: 1000,
            name: "pool0".to_string(),
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        let decoded = PoolRequest::decode(&buf).unwrap();
        assert_eq!(decoded, req);
        let header = MessageHeader::decode(&buf).unwrap();
        assert_eq!(header.length as usize, buf.len());
    }

    #[test]
    fn test_io_request_round_trip_with_value() {
        let req = IoRequest {
            auth_id: 1,
            request_id: 2,
            op: IoOp::Put,
            pool_id: 0xABCD,
            flags: crate::flags::IoFlags::DONT_STOMP.bits(),
            offset: 0,
            size: 0,
            addr: 0,
            mr_key: 0,
            key: "alpha".to_string(),
            value: b"one".to_vec(),
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        assert_eq!(IoRequest::decode(&buf).unwrap(), req);
    }

    #[test]
    fn test_io_response_sg_list_round_trip() {
        let mut resp = IoResponse::status_only(1, 2, Status::Ok);
        resp.set_sg_list(&[
            SgElement { addr: 0x1000, len: 0x800000 },
            SgElement { addr: 0x900000, len: 0x800000 },
        ]);
        let mut buf = Vec::new();
        resp.encode(&mut buf);
        let decoded = IoResponse::decode(&buf).unwrap();
        let sg = decoded.sg_list().unwrap();
        assert_eq!(sg.len(), 2);
        assert_eq!(sg[0].addr, 0x1000);
        assert_eq!(sg[1].len, 0x800000);
    }

    #[test]
    fn test_ado_response_round_trip() {
        let resp = AdoResponse {
            auth_id: 5,
            request_id: 6,
            status: Status::User(crate::status::USER_BASE + 1),
            buffers: vec![
                AdoResponseBuffer { layer_id: 0, data: b"hello".to_vec() },
                AdoResponseBuffer { layer_id: 1, data: vec![] },
            ],
        };
        let mut buf = Vec::new();
        resp.encode(&mut buf);
        assert_eq!(AdoResponse::decode(&buf).unwrap(), resp);
    }

    #[test]
    fn test_put_ado_request_round_trip() {
        let req = PutAdoRequest {
            auth_id: 9,
            request_id: 10,
            pool_id: 77,
            flags: crate::flags::AdoFlags::DETACHED.bits(),
            ondemand_val_len: 4096,
            root_val_len: 64,
            key: "k".to_string(),
            request: b"invoke".to_vec(),
            value: b"payload".to_vec(),
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        assert_eq!(PutAdoRequest::decode(&buf).unwrap(), req);
    }

    #[test]
    fn test_info_round_trip() {
        let req = InfoRequest {
            auth_id: 3,
            request_id: 4,
            info_type: INFO_TYPE_FIND_KEY,
            pool_id: 1,
            offset: 12,
            key: "cat/.*".to_string(),
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        assert_eq!(InfoRequest::decode(&buf).unwrap(), req);

        let resp = InfoResponse {
            auth_id: 3,
            request_id: 4,
            status: Status::Ok,
            value: 0,
            offset: 13,
            data: b"cat/1".to_vec(),
        };
        let mut buf = Vec::new();
        resp.encode(&mut buf);
        assert_eq!(InfoResponse::decode(&buf).unwrap(), resp);
    }

    #[test]
    fn test_stats_round_trip() {
        let mut stats = ShardStats::default();
        stats.op_put_count = 42;
        stats.client_count = 3;
        let resp = StatsResponse { auth_id: 0, request_id: 1, status: Status::Ok, stats };
        let mut buf = Vec::new();
        resp.encode(&mut buf);
        assert_eq!(StatsResponse::decode(&buf).unwrap().stats.op_put_count, 42);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let req = PoolRequest {
            auth_id: 0,
            request_id: 0,
            op: PoolOp::Open,
            flags: 0,
            pool_id: 0,
            pool_size: 0,
            expected_obj_count: 0,
            name: "p".to_string(),
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        buf.truncate(buf.len() - 2);
        assert!(PoolRequest::decode(&buf).is_err());
    }
}
