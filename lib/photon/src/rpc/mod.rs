//! Request/response RPC with observer streams, layered on the datagram transport. Each
//! connection is driven by a single task runner: receive callbacks, timer ticks and sends all
//! happen on the thread pumping the owning endpoint, so per-connection state needs no locks.

pub mod client;
pub mod codec;
pub mod message;
pub mod server;

use flint::crypto;
use std::fmt;
use uuid::Uuid;

/// Call level error taxonomy surfaced to RPC callers.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RpcError {
    /// Deadline exceeded before a response arrived.
    Timeout,
    /// Transport lost before or during the call.
    Disconnected,
    /// Method gating rejected the caller's role.
    NotAuthorized,
    /// No grain with the requested interface; usually transient during startup.
    UnknownGrain,
    /// Grain exists, method id does not.
    UnknownMethod,
    /// Codec variant or schema mismatch while decoding arguments.
    ArgumentDecode,
    /// Error produced by the grain implementation.
    Application(String),
}

impl RpcError {
    #[inline]
    pub fn code(&self) -> u8 {
        match self {
            RpcError::Timeout => 1,
            RpcError::Disconnected => 2,
            RpcError::NotAuthorized => 3,
            RpcError::UnknownGrain => 4,
            RpcError::UnknownMethod => 5,
            RpcError::ArgumentDecode => 6,
            RpcError::Application(_) => 7,
        }
    }

    #[inline]
    pub fn from_wire(code: u8, text: String) -> RpcError {
        match code {
            1 => RpcError::Timeout,
            2 => RpcError::Disconnected,
            3 => RpcError::NotAuthorized,
            4 => RpcError::UnknownGrain,
            5 => RpcError::UnknownMethod,
            6 => RpcError::ArgumentDecode,
            _ => RpcError::Application(text),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RpcError::Timeout => write!(formatter, "deadline exceeded"),
            RpcError::Disconnected => write!(formatter, "transport lost"),
            RpcError::NotAuthorized => write!(formatter, "not authorized"),
            RpcError::UnknownGrain => write!(formatter, "unknown grain"),
            RpcError::UnknownMethod => write!(formatter, "unknown method"),
            RpcError::ArgumentDecode => write!(formatter, "argument decode error"),
            RpcError::Application(text) => write!(formatter, "application error: {}", text),
        }
    }
}

/// Generates a random v4 uuid from the sodium csprng.
#[inline]
pub fn new_uuid() -> Uuid {
    let mut bytes = [0u8; 16];
    crypto::random_bytes(&mut bytes);

    // Stamp the version/variant bits
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_roundtrip() {
        let errors = [
            RpcError::Timeout,
            RpcError::Disconnected,
            RpcError::NotAuthorized,
            RpcError::UnknownGrain,
            RpcError::UnknownMethod,
            RpcError::ArgumentDecode,
            RpcError::Application("FAILED".into()),
        ];

        for error in errors.iter() {
            let text = match error {
                RpcError::Application(text) => text.clone(),
                _ => String::new(),
            };

            assert_eq!(&RpcError::from_wire(error.code(), text), error);
        }
    }

    #[test]
    fn test_uuid_version_bits() {
        let id = new_uuid();

        assert_eq!(id.get_version_num(), 4);
        assert_ne!(id, new_uuid());
    }
}
