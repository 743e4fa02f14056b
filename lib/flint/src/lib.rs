#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub const PROTOCOL_VERSION: u8 = 1;

/// Application-level handshake key offered when opening a transport
/// connection. Listeners accept the empty key as well.
pub const HANDSHAKE_KEY: &str = "RpcConnection";

pub const SESSION_EXPIRY_SECS: u64 = 3600;

pub type PlayerId = String;
pub type ServerId = String;

pub mod contract;
pub mod crypto;
pub mod encoding;
pub mod logging;
pub mod math;
pub mod session;
pub mod time;

mod util;
