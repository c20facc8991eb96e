//! Wire protocol framing for OakDB.
//!
//! The scheduler consumes the codec only through the [`WireCodec`] trait, so the
//! framing here is replaceable. [`BinaryCodec`] is the default implementation: a
//! fixed 28-byte header followed by extras, key and value sections, with the
//! operation identifier echoed back by the server as the correlation identifier.
//!
//! Header layout (big-endian):
//!
//! ```text
//! 0      magic        u8   request 0xA4 / response 0xA5
//! 1      opcode       u8
//! 2..4   key length   u16
//! 4      extras len   u8
//! 5      reserved     u8
//! 6..8   status       u16  responses only, zero in requests
//! 8..12  body length  u32  extras + key + value
//! 12..20 correlation  u64
//! 20..28 cas          u64
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::command::{CommandDescriptor, OperationKind};
use crate::registry::OperationId;

/// Request magic byte.
pub const REQUEST_MAGIC: u8 = 0xA4;
/// Response magic byte.
pub const RESPONSE_MAGIC: u8 = 0xA5;
/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 28;
/// Maximum frame body size (16MB).
pub const MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;

pub const OP_FETCH: u8 = 0x01;
pub const OP_UPSERT: u8 = 0x02;
pub const OP_ADD: u8 = 0x03;
pub const OP_REPLACE: u8 = 0x04;
pub const OP_APPEND: u8 = 0x05;
pub const OP_PREPEND: u8 = 0x06;
pub const OP_REMOVE: u8 = 0x07;
pub const OP_TOUCH: u8 = 0x08;
pub const OP_QUERY: u8 = 0x10;
/// Response-only opcode: one query row, more frames follow for the same id.
pub const OP_QUERY_ROW: u8 = 0x11;
pub const OP_ADMIN: u8 = 0x20;

pub fn opcode_for(kind: OperationKind) -> u8 {
  match kind {
    OperationKind::Fetch => OP_FETCH,
    OperationKind::Upsert => OP_UPSERT,
    OperationKind::Add => OP_ADD,
    OperationKind::Replace => OP_REPLACE,
    OperationKind::Append => OP_APPEND,
    OperationKind::Prepend => OP_PREPEND,
    OperationKind::Remove => OP_REMOVE,
    OperationKind::Touch => OP_TOUCH,
    OperationKind::Query => OP_QUERY,
    OperationKind::Admin => OP_ADMIN,
  }
}

/// One decoded response frame.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
  pub correlation_id: u64,
  pub opcode: u8,
  pub status: u16,
  pub cas: u64,
  /// Content-encoding tag from the extras section, zero when absent.
  pub format: u32,
  pub payload: Bytes,
  /// True for row frames: the operation stays pending, more frames follow.
  pub partial: bool,
}

/// Decode outcome for one pass over a read buffer.
#[derive(Debug)]
pub enum Decoded {
  Frame(ResponseFrame),
  /// Not enough buffered bytes for a complete frame.
  Incomplete,
  /// Framing is broken; the connection cannot be trusted further.
  Malformed(String),
}

/// Encoder/decoder consumed by the scheduler. Implementations must consume the
/// decoded frame's bytes from the buffer on `Decoded::Frame`, and leave the
/// buffer untouched on `Incomplete`.
pub trait WireCodec {
  fn encode(&self, id: OperationId, descriptor: &CommandDescriptor, out: &mut BytesMut);
  fn decode(&self, buf: &mut BytesMut) -> Decoded;
}

/// Default binary framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
  fn extras(descriptor: &CommandDescriptor) -> BytesMut {
    let mut extras = BytesMut::new();
    match descriptor.kind() {
      k if k.is_store() => {
        extras.put_u32(descriptor.format());
        extras.put_u32(descriptor.expiry().to_wire());
      }
      OperationKind::Touch => {
        extras.put_u32(descriptor.expiry().to_wire());
      }
      OperationKind::Admin => {
        // Validated at build time; Admin always carries a method.
        if let Some(method) = descriptor.admin_method() {
          extras.put_u8(method.to_wire());
        }
      }
      _ => {}
    }
    extras
  }

  /// Encode a response frame. Server-side helper used by the in-memory stub.
  pub fn encode_response(
    &self,
    correlation_id: u64,
    opcode: u8,
    status: u16,
    cas: u64,
    format: Option<u32>,
    payload: &[u8],
    out: &mut BytesMut,
  ) {
    let extras_len: usize = if format.is_some() { 4 } else { 0 };
    out.put_u8(RESPONSE_MAGIC);
    out.put_u8(opcode);
    out.put_u16(0); // responses carry no key
    out.put_u8(extras_len as u8);
    out.put_u8(0);
    out.put_u16(status);
    out.put_u32((extras_len + payload.len()) as u32);
    out.put_u64(correlation_id);
    out.put_u64(cas);
    if let Some(format) = format {
      out.put_u32(format);
    }
    out.put_slice(payload);
  }

  /// Decode one request frame. Server-side helper used by the in-memory stub.
  pub fn decode_request(&self, buf: &mut BytesMut) -> Option<RequestFrame> {
    if buf.len() < HEADER_LEN {
      return None;
    }
    let key_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let extras_len = buf[4] as usize;
    let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if buf.len() < HEADER_LEN + body_len {
      return None;
    }
    let mut frame = buf.split_to(HEADER_LEN + body_len);
    let magic = frame.get_u8();
    debug_assert_eq!(magic, REQUEST_MAGIC);
    let opcode = frame.get_u8();
    frame.advance(2); // key length, re-read above
    frame.advance(2); // extras length + reserved
    frame.advance(2); // status, unused in requests
    frame.advance(4); // body length
    let correlation_id = frame.get_u64();
    let cas = frame.get_u64();
    let extras = frame.split_to(extras_len).freeze();
    let key = frame.split_to(key_len).freeze();
    let value = frame.freeze();
    Some(RequestFrame {
      opcode,
      correlation_id,
      cas,
      extras,
      key,
      value,
    })
  }
}

impl WireCodec for BinaryCodec {
  fn encode(&self, id: OperationId, descriptor: &CommandDescriptor, out: &mut BytesMut) {
    let extras = Self::extras(descriptor);
    let key = descriptor.key();
    let value_len = descriptor.value().map_or(0, |v| v.len());
    let body_len = extras.len() + key.len() + value_len;

    out.put_u8(REQUEST_MAGIC);
    out.put_u8(opcode_for(descriptor.kind()));
    out.put_u16(key.len() as u16);
    out.put_u8(extras.len() as u8);
    out.put_u8(0);
    out.put_u16(0);
    out.put_u32(body_len as u32);
    out.put_u64(id.raw());
    out.put_u64(descriptor.cas().unwrap_or(0));
    out.put_slice(&extras);
    out.put_slice(key);
    if let Some(value) = descriptor.value() {
      out.put_slice(value);
    }
  }

  fn decode(&self, buf: &mut BytesMut) -> Decoded {
    if buf.len() < HEADER_LEN {
      return Decoded::Incomplete;
    }
    if buf[0] != RESPONSE_MAGIC {
      return Decoded::Malformed(format!("bad response magic 0x{:02x}", buf[0]));
    }
    let extras_len = buf[4] as usize;
    let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if body_len > MAX_BODY_SIZE {
      return Decoded::Malformed(format!("frame body {} exceeds limit", body_len));
    }
    let body_len = body_len as usize;
    if extras_len > body_len {
      return Decoded::Malformed("extras longer than body".to_string());
    }
    if buf.len() < HEADER_LEN + body_len {
      return Decoded::Incomplete;
    }

    let mut frame = buf.split_to(HEADER_LEN + body_len);
    frame.advance(1);
    let opcode = frame.get_u8();
    frame.advance(2); // key length, always zero in responses
    frame.advance(2); // extras length + reserved
    let status = frame.get_u16();
    frame.advance(4); // body length
    let correlation_id = frame.get_u64();
    let cas = frame.get_u64();
    let format = if extras_len >= 4 {
      let f = frame.get_u32();
      frame.advance(extras_len - 4);
      f
    } else {
      frame.advance(extras_len);
      0
    };
    let payload = frame.freeze();

    Decoded::Frame(ResponseFrame {
      correlation_id,
      opcode,
      status,
      cas,
      format,
      payload,
      partial: opcode == OP_QUERY_ROW,
    })
  }
}

/// One decoded request frame, as seen by a server.
#[derive(Debug, Clone)]
pub struct RequestFrame {
  pub opcode: u8,
  pub correlation_id: u64,
  pub cas: u64,
  pub extras: Bytes,
  pub key: Bytes,
  pub value: Bytes,
}

impl RequestFrame {
  /// Format tag from store-request extras, zero when absent.
  pub fn format(&self) -> u32 {
    if self.extras.len() >= 4 {
      u32::from_be_bytes([self.extras[0], self.extras[1], self.extras[2], self.extras[3]])
    } else {
      0
    }
  }

  /// Expiry from store/touch extras, zero when absent.
  pub fn expiry(&self) -> u32 {
    match self.extras.len() {
      4 if self.opcode == OP_TOUCH => {
        u32::from_be_bytes([self.extras[0], self.extras[1], self.extras[2], self.extras[3]])
      }
      8 => u32::from_be_bytes([self.extras[4], self.extras[5], self.extras[6], self.extras[7]]),
      _ => 0,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::command::CommandDescriptor;

  #[test]
  fn test_request_round_trip() {
    let codec = BinaryCodec;
    let d = CommandDescriptor::upsert("hello", "world")
      .format(0x2000)
      .build()
      .unwrap();
    let id = OperationId::from_raw(42);

    let mut wire = BytesMut::new();
    codec.encode(id, &d, &mut wire);
    let req = codec.decode_request(&mut wire).unwrap();

    assert_eq!(req.opcode, OP_UPSERT);
    assert_eq!(req.correlation_id, 42);
    assert_eq!(&req.key[..], b"hello");
    assert_eq!(&req.value[..], b"world");
    assert_eq!(req.format(), 0x2000);
    assert!(wire.is_empty());
  }

  #[test]
  fn test_response_decode_consumes_exactly_one_frame() {
    let codec = BinaryCodec;
    let mut wire = BytesMut::new();
    codec.encode_response(7, OP_FETCH, 0, 99, Some(1), b"abc", &mut wire);
    codec.encode_response(8, OP_FETCH, 0, 100, Some(1), b"def", &mut wire);

    match codec.decode(&mut wire) {
      Decoded::Frame(f) => {
        assert_eq!(f.correlation_id, 7);
        assert_eq!(f.cas, 99);
        assert_eq!(&f.payload[..], b"abc");
        assert!(!f.partial);
      }
      other => panic!("expected frame, got {:?}", other),
    }
    match codec.decode(&mut wire) {
      Decoded::Frame(f) => assert_eq!(f.correlation_id, 8),
      other => panic!("expected frame, got {:?}", other),
    }
    assert!(matches!(codec.decode(&mut wire), Decoded::Incomplete));
  }

  #[test]
  fn test_incomplete_leaves_buffer_untouched() {
    let codec = BinaryCodec;
    let mut wire = BytesMut::new();
    codec.encode_response(7, OP_FETCH, 0, 0, None, b"abcdef", &mut wire);
    let mut truncated = BytesMut::from(&wire[..wire.len() - 2]);
    let before = truncated.len();
    assert!(matches!(codec.decode(&mut truncated), Decoded::Incomplete));
    assert_eq!(truncated.len(), before);
  }

  #[test]
  fn test_bad_magic_is_malformed() {
    let codec = BinaryCodec;
    let mut wire = BytesMut::new();
    codec.encode_response(7, OP_FETCH, 0, 0, None, b"", &mut wire);
    wire[0] = 0x00;
    assert!(matches!(codec.decode(&mut wire), Decoded::Malformed(_)));
  }

  #[test]
  fn test_query_row_frame_is_partial() {
    let codec = BinaryCodec;
    let mut wire = BytesMut::new();
    codec.encode_response(3, OP_QUERY_ROW, 0, 0, None, b"{\"row\":1}", &mut wire);
    match codec.decode(&mut wire) {
      Decoded::Frame(f) => assert!(f.partial),
      other => panic!("expected frame, got {:?}", other),
    }
  }
}
