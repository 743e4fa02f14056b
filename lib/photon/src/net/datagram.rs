use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Maximum datagram size put on the wire. Kept under the conservative path MTU so a frame never
/// fragments at the IP layer.
pub const MAX_DATAGRAM_SIZE: usize = 1280;

pub const HEADER_SIZE: usize = 11;

/// Largest payload carried by a single unfragmented datagram.
pub const MAX_PAYLOAD_SIZE: usize = 1200;

const FRAGMENT_HEADER_SIZE: usize = 4;

/// Payload room left in a fragment datagram after the fragment sub-header.
pub const FRAGMENT_CHUNK_SIZE: usize = MAX_PAYLOAD_SIZE - FRAGMENT_HEADER_SIZE;

/// Upper bound on a fragmented message, determined by the u16 fragment count.
pub const MAX_MESSAGE_SIZE: usize = 256 * FRAGMENT_CHUNK_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    ConnectRequest = 0,
    ConnectAccept = 1,
    ConnectDeny = 2,
    Disconnect = 3,
    KeepAlive = 4,
    Reliable = 5,
    ReliableFragment = 6,
    Unreliable = 7,
    Ack = 8,
}

impl Kind {
    #[inline]
    pub fn from_u8(raw: u8) -> Option<Kind> {
        match raw {
            0 => Some(Kind::ConnectRequest),
            1 => Some(Kind::ConnectAccept),
            2 => Some(Kind::ConnectDeny),
            3 => Some(Kind::Disconnect),
            4 => Some(Kind::KeepAlive),
            5 => Some(Kind::Reliable),
            6 => Some(Kind::ReliableFragment),
            7 => Some(Kind::Unreliable),
            8 => Some(Kind::Ack),
            _ => None,
        }
    }
}

/// Parsed view of a single datagram: kind, sequence and the payload slice.
#[derive(Debug, Eq, PartialEq)]
pub struct Datagram<'a> {
    pub kind: Kind,
    pub sequence: u64,
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    /// Parses the wire header off the supplied buffer.
    pub fn read(buffer: &'a [u8]) -> NetworkResult<Datagram<'a>> {
        if buffer.len() < HEADER_SIZE {
            return Err(NetworkError::Wait);
        }

        let mut cursor = Cursor::new(buffer);

        let kind = Kind::from_u8(cursor.read_u8()?).ok_or(NetworkError::Fatal(ErrorType::IncorrectKind))?;
        let sequence = cursor.read_u64::<BigEndian>()?;
        let length = cursor.read_u16::<BigEndian>()? as usize;

        if length > buffer.len() - HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        Ok(Datagram {
            kind,
            sequence,
            payload: &buffer[HEADER_SIZE..HEADER_SIZE + length],
        })
    }

    /// Serializes a datagram into a fresh buffer.
    pub fn write(kind: Kind, sequence: u64, payload: &[u8]) -> Vec<u8> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            panic!("Datagram payload too large: {} bytes", payload.len());
        }

        let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());

        buffer.write_u8(kind as u8).expect("Error writing header");
        buffer
            .write_u64::<BigEndian>(sequence)
            .expect("Error writing header");
        buffer
            .write_u16::<BigEndian>(payload.len() as u16)
            .expect("Error writing header");
        buffer.extend_from_slice(payload);

        buffer
    }
}

/// Fragment sub-header, prefixed to the payload of `ReliableFragment` datagrams. Fragments ride
/// the ordered reliable lane, so reassembly is strictly sequential.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FragmentInfo {
    pub index: u16,
    pub count: u16,
}

impl FragmentInfo {
    pub fn read(payload: &[u8]) -> NetworkResult<(FragmentInfo, &[u8])> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
        }

        let mut cursor = Cursor::new(payload);
        let index = cursor.read_u16::<BigEndian>()?;
        let count = cursor.read_u16::<BigEndian>()?;

        if count == 0 || index >= count {
            return Err(NetworkError::Fatal(ErrorType::FragmentMismatch));
        }

        Ok((FragmentInfo { index, count }, &payload[FRAGMENT_HEADER_SIZE..]))
    }

    pub fn write(self, chunk: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());

        payload
            .write_u16::<BigEndian>(self.index)
            .expect("Error writing fragment header");
        payload
            .write_u16::<BigEndian>(self.count)
            .expect("Error writing fragment header");
        payload.extend_from_slice(chunk);

        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let wire = Datagram::write(Kind::Reliable, 42, b"payload");
        let parsed = Datagram::read(&wire).unwrap();

        assert_eq!(parsed.kind, Kind::Reliable);
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.payload, b"payload");
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let wire = Datagram::write(Kind::KeepAlive, 0, &[]);
        let parsed = Datagram::read(&wire).unwrap();

        assert_eq!(parsed.kind, Kind::KeepAlive);
        assert_eq!(parsed.payload.len(), 0);
    }

    #[test]
    fn test_truncated_header_waits() {
        assert_eq!(Datagram::read(&[5u8; 4]).unwrap_err(), NetworkError::Wait);
    }

    #[test]
    fn test_unknown_kind_is_fatal() {
        let mut wire = Datagram::write(Kind::Reliable, 1, b"x");
        wire[0] = 99;

        assert_eq!(
            Datagram::read(&wire).unwrap_err(),
            NetworkError::Fatal(ErrorType::IncorrectKind)
        );
    }

    #[test]
    fn test_length_overrun_is_fatal() {
        let mut wire = Datagram::write(Kind::Reliable, 1, b"abc");
        // Claim more payload than the buffer holds
        wire[9] = 0xff;
        wire[10] = 0xff;

        assert_eq!(
            Datagram::read(&wire).unwrap_err(),
            NetworkError::Fatal(ErrorType::PayloadTooLarge)
        );
    }

    #[test]
    fn test_fragment_info_roundtrip() {
        let payload = FragmentInfo { index: 2, count: 5 }.write(b"chunk");
        let (info, chunk) = FragmentInfo::read(&payload).unwrap();

        assert_eq!(info, FragmentInfo { index: 2, count: 5 });
        assert_eq!(chunk, b"chunk");
    }

    #[test]
    fn test_fragment_index_out_of_range() {
        let payload = FragmentInfo { index: 1, count: 2 }.write(b"chunk");
        let mut bad = payload.clone();
        bad[0] = 0;
        bad[1] = 9;

        assert_eq!(
            FragmentInfo::read(&bad).unwrap_err(),
            NetworkError::Fatal(ErrorType::FragmentMismatch)
        );
    }
}
