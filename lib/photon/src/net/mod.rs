//! The networking modules handle all datagram traffic between peers: framing, the per-peer
//! channel state machines and the socket pump.

pub mod channel;
pub mod datagram;
pub mod endpoint;
pub mod support;
