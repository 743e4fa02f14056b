//! RPC message envelopes. Every envelope is `[u8 type][u16 len LE][payload]`; several envelopes
//! may be packed into a single transport payload.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use uuid::Uuid;

pub const MSG_HANDSHAKE: u8 = 0x01;
pub const MSG_MANIFEST: u8 = 0x02;
pub const MSG_REQUEST: u8 = 0x03;
pub const MSG_RESPONSE: u8 = 0x04;
pub const MSG_OBSERVER_NOTIFY: u8 = 0x05;
pub const MSG_HEARTBEAT: u8 = 0x06;

const MAX_ENVELOPE_PAYLOAD: usize = u16::max_value() as usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub client_id: String,
    pub protocol_version: u8,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Manifest {
    pub grains: Vec<GrainEntry>,
}

/// One grain type exposed by a server, with the interfaces and methods it resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct GrainEntry {
    pub grain_type: String,
    pub interface_ids: Vec<u32>,
    pub method_ids: Vec<u32>,
}

impl Manifest {
    /// True when the interface is resolvable on the remote server.
    #[inline]
    pub fn resolves(&self, interface_id: u32) -> bool {
        self.grains
            .iter()
            .any(|grain| grain.interface_ids.contains(&interface_id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub message_id: Uuid,
    pub grain_id: String,
    pub interface_id: u32,
    pub method_id: u32,
    pub timeout_ms: u32,
    /// Variant-tagged codec payload.
    pub args: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub message_id: Uuid,
    pub request_id: Uuid,
    /// Ok carries the variant-tagged result payload, Err the error code and text.
    pub result: Result<Vec<u8>, (u8, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObserverNotify {
    pub subscription_id: Uuid,
    pub event_kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Handshake(Handshake),
    Manifest(Manifest),
    Request(Request),
    Response(Response),
    ObserverNotify(ObserverNotify),
    Heartbeat(Heartbeat),
}

#[derive(Debug, Eq, PartialEq)]
pub enum MessageError {
    Truncated,
    UnknownType(u8),
    BadString,
    Oversized,
}

type MessageResult<T> = Result<T, MessageError>;

impl RpcMessage {
    /// Appends the envelope to the destination buffer.
    pub fn write(&self, out: &mut Vec<u8>) -> MessageResult<()> {
        let mut payload = Vec::with_capacity(64);

        let msg_type = match self {
            RpcMessage::Handshake(handshake) => {
                write_string(&mut payload, &handshake.client_id);
                payload.push(handshake.protocol_version);
                payload.push(handshake.features.len() as u8);
                for feature in &handshake.features {
                    write_string(&mut payload, feature);
                }
                MSG_HANDSHAKE
            }
            RpcMessage::Manifest(manifest) => {
                payload
                    .write_u16::<LittleEndian>(manifest.grains.len() as u16)
                    .expect("Error writing manifest");
                for grain in &manifest.grains {
                    write_string(&mut payload, &grain.grain_type);
                    write_u32_list(&mut payload, &grain.interface_ids);
                    write_u32_list(&mut payload, &grain.method_ids);
                }
                MSG_MANIFEST
            }
            RpcMessage::Request(request) => {
                payload.extend_from_slice(request.message_id.as_bytes());
                write_string(&mut payload, &request.grain_id);
                payload
                    .write_u32::<LittleEndian>(request.interface_id)
                    .expect("Error writing request");
                payload
                    .write_u32::<LittleEndian>(request.method_id)
                    .expect("Error writing request");
                payload
                    .write_u32::<LittleEndian>(request.timeout_ms)
                    .expect("Error writing request");
                write_blob(&mut payload, &request.args)?;
                MSG_REQUEST
            }
            RpcMessage::Response(response) => {
                payload.extend_from_slice(response.message_id.as_bytes());
                payload.extend_from_slice(response.request_id.as_bytes());
                match &response.result {
                    Ok(body) => {
                        payload.push(1);
                        write_blob(&mut payload, body)?;
                    }
                    Err((code, text)) => {
                        payload.push(0);
                        payload.push(*code);
                        write_string(&mut payload, text);
                    }
                }
                MSG_RESPONSE
            }
            RpcMessage::ObserverNotify(notify) => {
                payload.extend_from_slice(notify.subscription_id.as_bytes());
                payload.push(notify.event_kind);
                write_blob(&mut payload, &notify.payload)?;
                MSG_OBSERVER_NOTIFY
            }
            RpcMessage::Heartbeat(heartbeat) => {
                write_string(&mut payload, &heartbeat.source_id);
                MSG_HEARTBEAT
            }
        };

        if payload.len() > MAX_ENVELOPE_PAYLOAD {
            return Err(MessageError::Oversized);
        }

        out.push(msg_type);
        out.write_u16::<LittleEndian>(payload.len() as u16)
            .expect("Error writing envelope");
        out.extend_from_slice(&payload);

        Ok(())
    }

    /// Parses every envelope packed into the supplied transport payload.
    pub fn read_all(buffer: &[u8]) -> MessageResult<Vec<RpcMessage>> {
        let mut messages = Vec::new();
        let mut offset = 0usize;

        while offset < buffer.len() {
            if buffer.len() - offset < 3 {
                return Err(MessageError::Truncated);
            }

            let msg_type = buffer[offset];
            let length = u16::from_le_bytes([buffer[offset + 1], buffer[offset + 2]]) as usize;
            offset += 3;

            if buffer.len() - offset < length {
                return Err(MessageError::Truncated);
            }

            messages.push(Self::read_one(msg_type, &buffer[offset..offset + length])?);
            offset += length;
        }

        Ok(messages)
    }

    fn read_one(msg_type: u8, payload: &[u8]) -> MessageResult<RpcMessage> {
        let mut cursor = Cursor::new(payload);

        let message = match msg_type {
            MSG_HANDSHAKE => {
                let client_id = read_string(&mut cursor)?;
                let protocol_version = read_u8(&mut cursor)?;
                let feature_count = read_u8(&mut cursor)? as usize;

                let mut features = Vec::with_capacity(feature_count);
                for _ in 0..feature_count {
                    features.push(read_string(&mut cursor)?);
                }

                RpcMessage::Handshake(Handshake {
                    client_id,
                    protocol_version,
                    features,
                })
            }
            MSG_MANIFEST => {
                let grain_count = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| MessageError::Truncated)? as usize;

                let mut grains = Vec::with_capacity(grain_count);
                for _ in 0..grain_count {
                    grains.push(GrainEntry {
                        grain_type: read_string(&mut cursor)?,
                        interface_ids: read_u32_list(&mut cursor)?,
                        method_ids: read_u32_list(&mut cursor)?,
                    });
                }

                RpcMessage::Manifest(Manifest { grains })
            }
            MSG_REQUEST => RpcMessage::Request(Request {
                message_id: read_uuid(&mut cursor)?,
                grain_id: read_string(&mut cursor)?,
                interface_id: cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| MessageError::Truncated)?,
                method_id: cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| MessageError::Truncated)?,
                timeout_ms: cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| MessageError::Truncated)?,
                args: read_blob(&mut cursor)?,
            }),
            MSG_RESPONSE => {
                let message_id = read_uuid(&mut cursor)?;
                let request_id = read_uuid(&mut cursor)?;

                let result = match read_u8(&mut cursor)? {
                    1 => Ok(read_blob(&mut cursor)?),
                    _ => {
                        let code = read_u8(&mut cursor)?;
                        let text = read_string(&mut cursor)?;
                        Err((code, text))
                    }
                };

                RpcMessage::Response(Response {
                    message_id,
                    request_id,
                    result,
                })
            }
            MSG_OBSERVER_NOTIFY => RpcMessage::ObserverNotify(ObserverNotify {
                subscription_id: read_uuid(&mut cursor)?,
                event_kind: read_u8(&mut cursor)?,
                payload: read_blob(&mut cursor)?,
            }),
            MSG_HEARTBEAT => RpcMessage::Heartbeat(Heartbeat {
                source_id: read_string(&mut cursor)?,
            }),
            other => return Err(MessageError::UnknownType(other)),
        };

        Ok(message)
    }
}

fn write_string(out: &mut Vec<u8>, text: &str) {
    out.write_u16::<LittleEndian>(text.len() as u16)
        .expect("Error writing string");
    out.extend_from_slice(text.as_bytes());
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> MessageResult<String> {
    let len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| MessageError::Truncated)? as usize;

    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(|_| MessageError::Truncated)?;

    String::from_utf8(bytes).map_err(|_| MessageError::BadString)
}

fn write_blob(out: &mut Vec<u8>, blob: &[u8]) -> MessageResult<()> {
    if blob.len() > MAX_ENVELOPE_PAYLOAD {
        return Err(MessageError::Oversized);
    }

    out.write_u16::<LittleEndian>(blob.len() as u16)
        .expect("Error writing blob");
    out.extend_from_slice(blob);

    Ok(())
}

fn read_blob(cursor: &mut Cursor<&[u8]>) -> MessageResult<Vec<u8>> {
    let len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| MessageError::Truncated)? as usize;

    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(|_| MessageError::Truncated)?;

    Ok(bytes)
}

fn write_u32_list(out: &mut Vec<u8>, list: &[u32]) {
    out.write_u16::<LittleEndian>(list.len() as u16)
        .expect("Error writing list");
    for item in list {
        out.write_u32::<LittleEndian>(*item).expect("Error writing list");
    }
}

fn read_u32_list(cursor: &mut Cursor<&[u8]>) -> MessageResult<Vec<u32>> {
    let len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| MessageError::Truncated)? as usize;

    let mut list = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        list.push(
            cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| MessageError::Truncated)?,
        );
    }

    Ok(list)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> MessageResult<u8> {
    cursor.read_u8().map_err(|_| MessageError::Truncated)
}

fn read_uuid(cursor: &mut Cursor<&[u8]>) -> MessageResult<Uuid> {
    let mut bytes = [0u8; 16];
    cursor.read_exact(&mut bytes).map_err(|_| MessageError::Truncated)?;

    Ok(Uuid::from_bytes(bytes))
}
