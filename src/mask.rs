//! Subnet broadcast address for name service broadcasts.
//!
//! The broadcast address is derived from the classful network of the local
//! address. This is not CIDR aware; it matches what legacy NetBIOS stacks send.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Fallback when the address cannot be classified.
pub const ALL_ONES: &str = "255.255.255.255";

/// Classful broadcast address for a dotted IPv4 string.
///
/// Class A keeps the first octet, class B the first two, class C the first
/// three; the rest become 255. Class D/E addresses and anything that does not
/// parse yield `255.255.255.255`.
pub fn generate_mask(ip: &str) -> String {
    match ip.trim().parse::<Ipv4Addr>() {
        Ok(addr) => broadcast_for(addr).to_string(),
        Err(_) => ALL_ONES.to_string(),
    }
}

/// As [`generate_mask`] over a parsed address.
pub fn broadcast_for(addr: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = addr.octets();
    match a {
        0..=127 => Ipv4Addr::new(a, 255, 255, 255),
        128..=191 => Ipv4Addr::new(a, b, 255, 255),
        192..=223 => Ipv4Addr::new(a, b, c, 255),
        _ => Ipv4Addr::BROADCAST,
    }
}

/// Find the local IPv4 address used to reach the outside world. A connected
/// UDP socket picks a route without sending anything.
pub async fn discover_local_ipv4() -> Option<Ipv4Addr> {
    let sock = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    // TEST-NET-1; never actually contacted
    sock.connect("192.0.2.1:137").await.ok()?;
    match sock.local_addr().ok()? {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Some(*v4.ip()),
        _ => None,
    }
}

/// Broadcast address owned by a resolver or name server. Computed once from
/// the configured addresses and cached for the life of the owner.
#[derive(Debug, Default)]
pub struct BroadcastMask {
    explicit: Option<Ipv4Addr>,
    local: Option<Ipv4Addr>,
    cached: OnceCell<Ipv4Addr>,
}

impl BroadcastMask {
    /// `explicit` overrides derivation; `local` is the address to derive from.
    pub fn new(explicit: Option<Ipv4Addr>, local: Option<Ipv4Addr>) -> Self {
        BroadcastMask { explicit, local, cached: OnceCell::new() }
    }

    /// The broadcast address, discovering the local address on first use if
    /// none was configured.
    pub async fn address(&self) -> Ipv4Addr {
        *self
            .cached
            .get_or_init(|| async {
                if let Some(addr) = self.explicit {
                    return addr;
                }
                let local = match self.local {
                    Some(addr) => Some(addr),
                    None => discover_local_ipv4().await,
                };
                match local {
                    Some(addr) => {
                        let mask = broadcast_for(addr);
                        debug!(local = %addr, broadcast = %mask, "derived broadcast address");
                        mask
                    }
                    None => {
                        warn!("no local IPv4 address found, using {}", ALL_ONES);
                        Ipv4Addr::BROADCAST
                    }
                }
            })
            .await
    }
}
