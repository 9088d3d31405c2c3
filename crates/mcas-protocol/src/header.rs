//! Fixed message framing header.

use crate::error::{ProtocolError, Result};
use crate::status::Status;
use crate::wire::{Reader, Writer};

/// Protocol version this build speaks.
pub const PROTOCOL_VERSION: u16 = 2;

/// Header size in bytes
/// (version:2 + type:2 + status:4 + auth_id:8 + request_id:8 + length:8).
pub const HEADER_SIZE: usize = 32;

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    /// Pool lifecycle request.
    PoolRequest = 0x0001,
    /// Pool lifecycle response.
    PoolResponse = 0x0002,
    /// IO request (put/get/erase/configure/two-stage/locate).
    IoRequest = 0x0003,
    /// IO response.
    IoResponse = 0x0004,
    /// ADO invocation without payload.
    AdoRequest = 0x0005,
    /// ADO invocation with a value payload.
    PutAdoRequest = 0x0006,
    /// ADO completion response.
    AdoResponse = 0x0007,
    /// Attribute / stats / find-key request.
    InfoRequest = 0x0008,
    /// Attribute / find-key response.
    InfoResponse = 0x0009,
    /// Shard statistics response.
    StatsResponse = 0x000A,
}

impl MsgType {
    /// Decode a wire discriminator.
    pub fn from_u16(v: u16) -> Result<MsgType> {
        match v {
            0x0001 => Ok(MsgType::PoolRequest),
            0x0002 => Ok(MsgType::PoolResponse),
            0x0003 => Ok(MsgType::IoRequest),
            0x0004 => Ok(MsgType::IoResponse),
            0x0005 => Ok(MsgType::AdoRequest),
            0x0006 => Ok(MsgType::PutAdoRequest),
            0x0007 => Ok(MsgType::AdoResponse),
            0x0008 => Ok(MsgType::InfoRequest),
            0x0009 => Ok(MsgType::InfoResponse),
            0x000A => Ok(MsgType::StatsResponse),
            other => Err(ProtocolError::UnknownMsgType(other)),
        }
    }
}

/// Fixed little-endian framing header present on every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Protocol version.
    pub version: u16,
    /// Message type.
    pub type_id: MsgType,
    /// Status (meaningful on responses; `Ok` on requests).
    pub status: Status,
    /// Authentication id; echoed verbatim from request to response.
    pub auth_id: u64,
    /// Request id for correlation; echoed on the response.
    pub request_id: u64,
    /// Total message length in bytes, header included.
    pub length: u64,
}

impl MessageHeader {
    /// Build a header for the given type. `length` is patched at encode time.
    pub fn new(type_id: MsgType, auth_id: u64, request_id: u64, status: Status) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            type_id,
            status,
            auth_id,
            request_id,
            length: 0,
        }
    }

    /// Encode into `out`. The length field is written as given; message
    /// codecs call [`patch_length`](Self::patch_length) after the body.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer::new(out);
        w.u16(self.version);
        w.u16(self.type_id as u16);
        w.i32(self.status.to_i32());
        w.u64(self.auth_id);
        w.u64(self.request_id);
        w.u64(self.length);
    }

    /// Rewrite the length field of an already-encoded message so that it
    /// covers the full buffer.
    pub fn patch_length(out: &mut [u8]) {
        let total = out.len() as u64;
        out[24..32].copy_from_slice(&total.to_le_bytes());
    }

    /// Decode a header, validating version.
    pub fn decode(buf: &[u8]) -> Result<MessageHeader> {
        let mut r = Reader::new(buf);
        let version = r.u16()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let type_id = MsgType::from_u16(r.u16()?)?;
        let status = Status::from_i32(r.i32()?);
        let auth_id = r.u64()?;
        let request_id = r.u64()?;
        let length = r.u64()?;
        Ok(MessageHeader {
            version,
            type_id,
            status,
            auth_id,
            request_id,
            length,
        })
    }

    /// Peek only the message type of an encoded message.
    pub fn peek_type(buf: &[u8]) -> Result<MsgType> {
        if buf.len() < 4 {
            return Err(ProtocolError::Truncated {
                needed: 4,
                remaining: buf.len(),
            });
        }
        MsgType::from_u16(u16::from_le_bytes([buf[2], buf[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut h = MessageHeader::new(MsgType::IoRequest, 42, 7, Status::Ok);
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        MessageHeader::patch_length(&mut buf);
        h.length = HEADER_SIZE as u64;
        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let h = MessageHeader::new(MsgType::IoRequest, 0, 0, Status::Ok);
        let mut buf = Vec::new();
        h.encode(&mut buf);
        buf[0] = 0xFF;
        assert!(matches!(
            MessageHeader::decode(&buf),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_peek_type() {
        let h = MessageHeader::new(MsgType::PoolRequest, 0, 0, Status::Ok);
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(MessageHeader::peek_type(&buf).unwrap(), MsgType::PoolRequest);
    }
}
