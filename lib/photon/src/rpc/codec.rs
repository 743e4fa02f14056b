//! Argument codec for calls between independent runtimes.
//!
//! Reference interning encodings are unsafe across unrelated processes, so every message is
//! encoded by a fresh `EncodeSession` and decoded by a fresh `DecodeSession`: no table survives
//! a message boundary. The baseline variant tags every value with a one byte type marker so the
//! hot path (player input) needs no schema lookup. Payloads requesting a variant that was not
//! negotiated are refused outright.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flint::math::Vec2;
use std::io::{Cursor, Read};
use uuid::Uuid;

/// Session-shared binary used between runtime-coupled peers. Recognized on the wire, never
/// negotiated here.
pub const VARIANT_SESSION_SHARED: u8 = 0x00;

/// Isolated baseline variant, mandatory for all peers.
pub const VARIANT_ISOLATED: u8 = 0xFE;

const MARKER_NULL: u8 = 0;
const MARKER_STRING: u8 = 1;
const MARKER_GUID: u8 = 2;
const MARKER_I32: u8 = 3;
const MARKER_BOOL: u8 = 4;
const MARKER_F64: u8 = 5;
const MARKER_DATETIME: u8 = 6;
const MARKER_DECIMAL: u8 = 7;
const MARKER_VEC2: u8 = 8;
const MARKER_OPT_VEC2: u8 = 9;
/// Extension past the mandatory scalar set: an opaque application payload (schema owned by the
/// grain, e.g. entity snapshots).
const MARKER_BLOB: u8 = 10;

const MAX_ARGS: usize = 64;

/// A single argument or return value in the baseline variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Guid(Uuid),
    I32(i32),
    Bool(bool),
    F64(f64),
    /// Tick count of the remote runtime's calendar clock.
    DateTime(i64),
    /// Raw 128 bit scaled decimal, four little endian words.
    Decimal([i32; 4]),
    Vec2(Vec2),
    OptVec2(Option<Vec2>),
    Blob(Vec<u8>),
}

#[derive(Debug, Eq, PartialEq)]
pub enum CodecError {
    /// The payload requested a codec variant that was not negotiated.
    UnsupportedVariant(u8),
    UnknownMarker(u8),
    Truncated,
    TooManyValues,
    BadString,
}

/// One-shot encoder. A session never outlives a single message, so there is no interning state
/// to leak between runtimes.
pub struct EncodeSession {
    out: Vec<u8>,
    count: u8,
}

impl EncodeSession {
    #[inline]
    pub fn new() -> EncodeSession {
        let mut out = Vec::with_capacity(64);
        out.push(VARIANT_ISOLATED);
        out.push(0); // patched by finish()

        EncodeSession { out, count: 0 }
    }

    pub fn value(&mut self, value: &Value) -> Result<(), CodecError> {
        if self.count as usize >= MAX_ARGS {
            return Err(CodecError::TooManyValues);
        }

        match value {
            Value::Null => self.out.push(MARKER_NULL),
            Value::Str(text) => {
                self.out.push(MARKER_STRING);
                self.out
                    .write_u16::<LittleEndian>(text.len() as u16)
                    .expect("Error writing value");
                self.out.extend_from_slice(text.as_bytes());
            }
            Value::Guid(id) => {
                self.out.push(MARKER_GUID);
                self.out.extend_from_slice(id.as_bytes());
            }
            Value::I32(number) => {
                self.out.push(MARKER_I32);
                self.out
                    .write_i32::<LittleEndian>(*number)
                    .expect("Error writing value");
            }
            Value::Bool(flag) => {
                self.out.push(MARKER_BOOL);
                self.out.push(*flag as u8);
            }
            Value::F64(number) => {
                self.out.push(MARKER_F64);
                self.out
                    .write_f64::<LittleEndian>(*number)
                    .expect("Error writing value");
            }
            Value::DateTime(ticks) => {
                self.out.push(MARKER_DATETIME);
                self.out
                    .write_i64::<LittleEndian>(*ticks)
                    .expect("Error writing value");
            }
            Value::Decimal(words) => {
                self.out.push(MARKER_DECIMAL);
                for word in words.iter() {
                    self.out
                        .write_i32::<LittleEndian>(*word)
                        .expect("Error writing value");
                }
            }
            Value::Vec2(vec) => {
                self.out.push(MARKER_VEC2);
                Self::write_vec2(&mut self.out, *vec);
            }
            Value::OptVec2(maybe) => {
                self.out.push(MARKER_OPT_VEC2);
                match maybe {
                    Some(vec) => {
                        self.out.push(1);
                        Self::write_vec2(&mut self.out, *vec);
                    }
                    None => self.out.push(0),
                }
            }
            Value::Blob(bytes) => {
                self.out.push(MARKER_BLOB);
                self.out
                    .write_u32::<LittleEndian>(bytes.len() as u32)
                    .expect("Error writing value");
                self.out.extend_from_slice(bytes);
            }
        }

        self.count += 1;
        Ok(())
    }

    /// Finishes the session, yielding the variant-tagged payload.
    #[inline]
    pub fn finish(mut self) -> Vec<u8> {
        self.out[1] = self.count;
        self.out
    }

    #[inline]
    fn write_vec2(out: &mut Vec<u8>, vec: Vec2) {
        out.write_f32::<LittleEndian>(vec.x).expect("Error writing value");
        out.write_f32::<LittleEndian>(vec.y).expect("Error writing value");
    }
}

/// One-shot decoder over a received payload.
pub struct DecodeSession<'a> {
    cursor: Cursor<&'a [u8]>,
    remaining: u8,
}

impl<'a> DecodeSession<'a> {
    /// Opens a session over the payload, validating the variant marker first.
    pub fn new(payload: &'a [u8]) -> Result<DecodeSession<'a>, CodecError> {
        if payload.len() < 2 {
            return Err(CodecError::Truncated);
        }

        match payload[0] {
            VARIANT_ISOLATED => (),
            other => return Err(CodecError::UnsupportedVariant(other)),
        }

        let mut cursor = Cursor::new(payload);
        cursor.set_position(1);
        let remaining = cursor.read_u8().map_err(|_| CodecError::Truncated)?;

        Ok(DecodeSession { cursor, remaining })
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.remaining as usize
    }

    pub fn value(&mut self) -> Result<Value, CodecError> {
        if self.remaining == 0 {
            return Err(CodecError::Truncated);
        }
        self.remaining -= 1;

        let marker = self.cursor.read_u8().map_err(|_| CodecError::Truncated)?;

        let value = match marker {
            MARKER_NULL => Value::Null,
            MARKER_STRING => {
                let len = self
                    .cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| CodecError::Truncated)? as usize;
                let mut bytes = vec![0u8; len];
                self.cursor.read_exact(&mut bytes).map_err(|_| CodecError::Truncated)?;

                Value::Str(String::from_utf8(bytes).map_err(|_| CodecError::BadString)?)
            }
            MARKER_GUID => {
                let mut bytes = [0u8; 16];
                self.cursor.read_exact(&mut bytes).map_err(|_| CodecError::Truncated)?;
                Value::Guid(Uuid::from_bytes(bytes))
            }
            MARKER_I32 => Value::I32(
                self.cursor
                    .read_i32::<LittleEndian>()
                    .map_err(|_| CodecError::Truncated)?,
            ),
            MARKER_BOOL => Value::Bool(self.cursor.read_u8().map_err(|_| CodecError::Truncated)? != 0),
            MARKER_F64 => Value::F64(
                self.cursor
                    .read_f64::<LittleEndian>()
                    .map_err(|_| CodecError::Truncated)?,
            ),
            MARKER_DATETIME => Value::DateTime(
                self.cursor
                    .read_i64::<LittleEndian>()
                    .map_err(|_| CodecError::Truncated)?,
            ),
            MARKER_DECIMAL => {
                let mut words = [0i32; 4];
                for word in words.iter_mut() {
                    *word = self
                        .cursor
                        .read_i32::<LittleEndian>()
                        .map_err(|_| CodecError::Truncated)?;
                }
                Value::Decimal(words)
            }
            MARKER_VEC2 => Value::Vec2(self.read_vec2()?),
            MARKER_OPT_VEC2 => {
                match self.cursor.read_u8().map_err(|_| CodecError::Truncated)? {
                    0 => Value::OptVec2(None),
                    _ => Value::OptVec2(Some(self.read_vec2()?)),
                }
            }
            MARKER_BLOB => {
                let len = self
                    .cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| CodecError::Truncated)? as usize;

                if len > self.cursor.get_ref().len() {
                    return Err(CodecError::Truncated);
                }

                let mut bytes = vec![0u8; len];
                self.cursor.read_exact(&mut bytes).map_err(|_| CodecError::Truncated)?;
                Value::Blob(bytes)
            }
            other => return Err(CodecError::UnknownMarker(other)),
        };

        Ok(value)
    }

    #[inline]
    fn read_vec2(&mut self) -> Result<Vec2, CodecError> {
        let x = self
            .cursor
            .read_f32::<LittleEndian>()
            .map_err(|_| CodecError::Truncated)?;
        let y = self
            .cursor
            .read_f32::<LittleEndian>()
            .map_err(|_| CodecError::Truncated)?;

        Ok(Vec2::new(x, y))
    }
}

/// Encodes an argument list with a fresh session.
pub fn encode_args(values: &[Value]) -> Vec<u8> {
    let mut session = EncodeSession::new();

    for value in values {
        session.value(value).expect("Argument list over codec limit");
    }

    session.finish()
}

/// Typed argument extractors shared by grain implementations.
pub mod args {
    use super::Value;
    use crate::rpc::RpcError;
    use flint::math::Vec2;
    use uuid::Uuid;

    pub fn want_str(args: &[Value], index: usize) -> Result<String, RpcError> {
        match args.get(index) {
            Some(Value::Str(text)) => Ok(text.clone()),
            _ => Err(RpcError::ArgumentDecode),
        }
    }

    pub fn want_i32(args: &[Value], index: usize) -> Result<i32, RpcError> {
        match args.get(index) {
            Some(Value::I32(number)) => Ok(*number),
            _ => Err(RpcError::ArgumentDecode),
        }
    }

    pub fn want_bool(args: &[Value], index: usize) -> Result<bool, RpcError> {
        match args.get(index) {
            Some(Value::Bool(flag)) => Ok(*flag),
            _ => Err(RpcError::ArgumentDecode),
        }
    }

    pub fn want_f64(args: &[Value], index: usize) -> Result<f64, RpcError> {
        match args.get(index) {
            Some(Value::F64(number)) => Ok(*number),
            _ => Err(RpcError::ArgumentDecode),
        }
    }

    pub fn want_vec2(args: &[Value], index: usize) -> Result<Vec2, RpcError> {
        match args.get(index) {
            Some(Value::Vec2(vec)) => Ok(*vec),
            _ => Err(RpcError::ArgumentDecode),
        }
    }

    pub fn want_opt_vec2(args: &[Value], index: usize) -> Result<Option<Vec2>, RpcError> {
        match args.get(index) {
            Some(Value::OptVec2(maybe)) => Ok(*maybe),
            _ => Err(RpcError::ArgumentDecode),
        }
    }

    pub fn want_guid(args: &[Value], index: usize) -> Result<Uuid, RpcError> {
        match args.get(index) {
            Some(Value::Guid(id)) => Ok(*id),
            _ => Err(RpcError::ArgumentDecode),
        }
    }

    pub fn want_blob(args: &[Value], index: usize) -> Result<Vec<u8>, RpcError> {
        match args.get(index) {
            Some(Value::Blob(bytes)) => Ok(bytes.clone()),
            _ => Err(RpcError::ArgumentDecode),
        }
    }

    pub fn want_datetime(args: &[Value], index: usize) -> Result<i64, RpcError> {
        match args.get(index) {
            Some(Value::DateTime(ticks)) => Ok(*ticks),
            _ => Err(RpcError::ArgumentDecode),
        }
    }
}

/// Decodes an argument list with a fresh session.
pub fn decode_args(payload: &[u8]) -> Result<Vec<Value>, CodecError> {
    let mut session = DecodeSession::new(payload)?;
    let mut values = Vec::with_capacity(session.remaining());

    while session.remaining() > 0 {
        values.push(session.value()?);
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::new_uuid;

    fn all_values() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Str("Alice".into()),
            Value::Guid(new_uuid()),
            Value::I32(-123),
            Value::Bool(true),
            Value::F64(16.625),
            Value::DateTime(637_000_000_000_000_000),
            Value::Decimal([1, -2, 3, -4]),
            Value::Vec2(Vec2::new(499.0, 250.0)),
            Value::OptVec2(Some(Vec2::new(-1.0, 2.5))),
            Value::OptVec2(None),
            Value::Blob(vec![0xde, 0xad, 0xbe, 0xef]),
        ]
    }

    #[test]
    fn test_every_value_type_roundtrips() {
        let values = all_values();
        let payload = encode_args(&values);

        assert_eq!(decode_args(&payload).unwrap(), values);
    }

    #[test]
    fn test_sessions_are_isolated() {
        // Identical strings encode identically: no interning table carries over
        let first = encode_args(&[Value::Str("repeat".into()), Value::Str("repeat".into())]);
        let second = encode_args(&[Value::Str("repeat".into())]);

        assert_eq!(&first[2..], [&second[2..], &second[2..]].concat().as_slice());
    }

    #[test]
    fn test_session_shared_variant_is_refused() {
        let mut payload = encode_args(&[Value::I32(1)]);
        payload[0] = VARIANT_SESSION_SHARED;

        assert_eq!(
            decode_args(&payload).unwrap_err(),
            CodecError::UnsupportedVariant(VARIANT_SESSION_SHARED)
        );
    }

    #[test]
    fn test_unknown_variant_is_refused() {
        assert_eq!(
            decode_args(&[0x7f, 0]).unwrap_err(),
            CodecError::UnsupportedVariant(0x7f)
        );
    }

    #[test]
    fn test_unknown_marker_is_rejected() {
        let payload = vec![VARIANT_ISOLATED, 1, 42];

        assert_eq!(decode_args(&payload).unwrap_err(), CodecError::UnknownMarker(42));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let mut payload = encode_args(&[Value::F64(1.5)]);
        payload.truncate(payload.len() - 2);

        assert_eq!(decode_args(&payload).unwrap_err(), CodecError::Truncated);
    }

    #[test]
    fn test_empty_args() {
        let payload = encode_args(&[]);

        assert_eq!(payload, vec![VARIANT_ISOLATED, 0]);
        assert_eq!(decode_args(&payload).unwrap(), Vec::<Value>::new());
    }
}
