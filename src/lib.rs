//! NetBIOS over TCP/IP (RFC 1001/1002): name encoding, name service and
//! datagram packets, name resolution, a name server and the session service.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod mask;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
