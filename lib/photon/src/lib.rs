#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Connectionful UDP transport and the RPC session layer riding on it.

pub mod net;
pub mod rpc;

pub use crate::net::support::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
pub use crate::rpc::RpcError;
