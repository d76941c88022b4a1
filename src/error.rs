//! Error types for name resolution and the session service.
//!
//! Packet parsers do not use these: malformed input there yields `None`.
//! Resolution reports "not found" as `Ok(None)` or an empty list, so an
//! `Err` from this crate always means something the caller should see.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Neither NetBIOS nor DNS could produce an address.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// The called name was refused, after the wildcard retry if any.
    #[error("session rejected by {host} (error {code:#04x})")]
    SessionRejected { host: String, code: u8 },

    /// The peer asked us to connect elsewhere; not followed automatically.
    #[error("session retargeted to {addr}:{port}")]
    Retarget { addr: Ipv4Addr, port: u16 },

    #[error("invalid session response from {host}: {detail}")]
    InvalidResponse { host: String, detail: String },

    /// The stream ended inside a message.
    #[error("short read: stream ended before {wanted} bytes")]
    ShortRead { wanted: usize },

    #[error("unknown session packet type {0:#04x}")]
    UnknownPacketType(u8),

    #[error("receive buffer too small: need {required} bytes, have {actual}")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("session is not connected")]
    NotConnected,

    #[error("message of {0} bytes exceeds the session length field")]
    MessageTooLarge(usize),

    #[error("invalid caller name template {template:?}: {reason}")]
    InvalidTemplate { template: String, reason: &'static str },

    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Another node owns the name we tried to register.
    #[error("name {name} is in use (rcode {rcode})")]
    NameConflict { name: String, rcode: u8 },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_too_small_names_both_sizes() {
        let e = Error::BufferTooSmall { required: 1004, actual: 512 };
        let msg = e.to_string();
        assert!(msg.contains("1004"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
