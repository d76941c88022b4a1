//! NetBIOS name resolution over the name service.
//!
//! One UDP socket per resolver, shared behind a mutex so that a query and the
//! replies it collects are never interleaved with another caller's. Every
//! receive is bounded by a deadline; running out of time is the normal end of
//! a lookup, not an error.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mask::{self, BroadcastMask};
use crate::protocol::name::{NameList, NetbiosName};
use crate::protocol::packet::NameServicePacket;
use crate::protocol::datagram::{DatagramPacket, NB_USERDATA};
use crate::protocol::{datagram_type, name_type, opcode};

/// Receive buffer for name service replies.
const RECV_BUFFER_LEN: usize = 4096;

/// Resolves NetBIOS names by WINS unicast or subnet broadcast.
pub struct NameResolver {
    config: Arc<Config>,
    socket: Mutex<UdpSocket>,
    tran_id: AtomicU16,
    mask: BroadcastMask,
}

impl NameResolver {
    /// Bind an ephemeral UDP socket for lookups.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let mask = BroadcastMask::new(config.broadcast_address, config.local_address);
        Ok(NameResolver {
            config,
            socket: Mutex::new(socket),
            tran_id: AtomicU16::new(rand::random::<u16>()),
            mask,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Next transaction id; wraps at 16 bits.
    pub fn next_transaction_id(&self) -> u16 {
        self.tran_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Where name queries go: the WINS server, or the subnet broadcast address.
    /// The flag is true for broadcast.
    async fn query_destination(&self) -> (SocketAddr, bool) {
        match self.config.wins_server {
            Some(wins) => (SocketAddrV4::new(wins, self.config.name_port).into(), false),
            None => {
                let bcast = self.mask.address().await;
                (SocketAddrV4::new(bcast, self.config.name_port).into(), true)
            }
        }
    }

    fn query_name(&self, name: &str, name_type: u8) -> NetbiosName {
        let mut nb = NetbiosName::new(name, name_type, false);
        nb.set_scope(self.config.scope().map(str::to_string));
        nb
    }

    /// Look up `name` and return the first answer, or `None` if nothing
    /// answered before `wait` elapsed.
    pub async fn find_name(&self, name: &str, name_type: u8, wait: Duration) -> Result<Option<NetbiosName>> {
        let query = self.query_name(name, name_type);
        let (dest, broadcast) = self.query_destination().await;
        let tran_id = self.next_transaction_id();
        let pkt = NameServicePacket::name_query_request(&query, tran_id, broadcast);

        debug!(name = %query, %dest, tran_id, "name query");
        trace!("{}", pkt.dump());

        let sock = self.socket.lock().await;
        sock.send_to(pkt.as_bytes(), dest).await?;

        let deadline = Instant::now() + wait;
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (n, from) = match timeout(remaining, sock.recv_from(&mut buf)).await {
                Err(_) => {
                    debug!(name = %query, "name query timed out");
                    return Ok(None);
                }
                Ok(res) => res?,
            };
            let Some(resp) = NameServicePacket::from_bytes(&buf[..n]) else {
                continue;
            };
            if !resp.is_response()
                || resp.opcode() != opcode::RESP_QUERY
                || resp.transaction_id() != tran_id
            {
                trace!(%from, tran_id = resp.transaction_id(), "ignoring unrelated packet");
                continue;
            }
            if resp.rcode() != 0 {
                debug!(name = %query, %from, rcode = resp.rcode(), "negative name query response");
                return Ok(None);
            }
            let found = resp.answer_name_list().and_then(|list| list.into_iter().next());
            if let Some(nb) = &found {
                debug!(name = %nb, addresses = ?nb.addresses(), %from, "name resolved");
            }
            return Ok(found);
        }
    }

    /// Addresses of every host answering a query for `name` within `wait`.
    /// Each host is listed once, in the order it replied.
    pub async fn find_responders(&self, name: &str, name_type: u8, wait: Duration) -> Result<Vec<Ipv4Addr>> {
        let query = self.query_name(name, name_type);
        let (dest, broadcast) = self.query_destination().await;
        let tran_id = self.next_transaction_id();
        let pkt = NameServicePacket::name_query_request(&query, tran_id, broadcast);

        debug!(name = %query, %dest, tran_id, "collecting name query responses");

        let sock = self.socket.lock().await;
        sock.send_to(pkt.as_bytes(), dest).await?;

        let deadline = Instant::now() + wait;
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let mut hosts: Vec<Ipv4Addr> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (n, from) = match timeout(remaining, sock.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(res)) => res,
                Ok(Err(e)) if is_unreachable(&e) => {
                    // ICMP unreachable from one host; the others may still answer
                    trace!(error = %e, "receive error while collecting responses");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            let Some(resp) = NameServicePacket::from_bytes(&buf[..n]) else {
                continue;
            };
            if resp.transaction_id() != tran_id {
                trace!(got = resp.transaction_id(), want = tran_id, "stale name query response");
                continue;
            }
            if !resp.is_response() || resp.opcode() != opcode::RESP_QUERY {
                continue;
            }
            if let SocketAddr::V4(v4) = from {
                if !hosts.contains(v4.ip()) {
                    hosts.push(*v4.ip());
                }
            }
        }
        debug!(name = %query, count = hosts.len(), "name query collection finished");
        Ok(hosts)
    }

    /// Short node names of every host answering a query for `name`. Empty
    /// if nothing answered.
    pub async fn find_name_list(&self, name: &str, name_type: u8, wait: Duration) -> Result<Vec<String>> {
        let hosts = self.find_responders(name, name_type, wait).await?;
        let mut names = Vec::with_capacity(hosts.len());
        for addr in hosts {
            names.push(self.node_name(addr).await);
        }
        Ok(names)
    }

    /// Node name of the host at `addr`: its first unique WorkStation name
    /// from an adapter status query, or the dotted address.
    pub async fn node_name(&self, addr: Ipv4Addr) -> String {
        match self.adapter_status(addr, 1, self.config.lookup_timeout()).await {
            Ok(Some(list)) => list
                .find_names_of_type(name_type::WORKSTATION, false)
                .into_iter()
                .next()
                .map(|nb| nb.name().to_string())
                .unwrap_or_else(|| addr.to_string()),
            _ => addr.to_string(),
        }
    }

    /// Ask the host at `addr` for its name table, trying up to `retries`
    /// times. Every returned name is tagged with `addr`.
    ///
    /// Returns `Ok(None)` when the host answered but only with malformed
    /// replies, and `UnknownHost` when it never answered.
    pub async fn find_names_for_address(&self, addr: Ipv4Addr, retries: u32) -> Result<Option<NameList>> {
        self.adapter_status(addr, retries, self.config.status_timeout()).await
    }

    async fn adapter_status(&self, addr: Ipv4Addr, retries: u32, wait: Duration) -> Result<Option<NameList>> {
        let dest = SocketAddr::from(SocketAddrV4::new(addr, self.config.name_port));
        let sock = self.socket.lock().await;
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let mut malformed = false;

        for attempt in 0..retries.max(1) {
            let tran_id = self.next_transaction_id();
            let pkt = NameServicePacket::adapter_status_request(tran_id);
            debug!(%dest, tran_id, attempt, "adapter status query");

            if let Err(e) = sock.send_to(pkt.as_bytes(), dest).await {
                warn!(%dest, error = %e, "adapter status send failed");
                return Err(Error::UnknownHost(addr.to_string()));
            }

            let deadline = Instant::now() + wait;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let n = match timeout(remaining, sock.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(Ok((n, _))) => n,
                    Ok(Err(e)) => {
                        debug!(%dest, error = %e, "adapter status receive failed");
                        return Err(Error::UnknownHost(addr.to_string()));
                    }
                };
                let Some(resp) = NameServicePacket::from_bytes(&buf[..n]) else {
                    continue;
                };
                if !resp.is_response()
                    || resp.opcode() != opcode::RESP_QUERY
                    || resp.transaction_id() != tran_id
                {
                    continue;
                }
                match resp.adapter_status_name_list() {
                    Some(mut list) => {
                        for nb in list.iter_mut() {
                            nb.add_address(addr);
                        }
                        debug!(%dest, names = list.len(), "adapter status received");
                        return Ok(Some(list));
                    }
                    None => {
                        debug!(%dest, "malformed adapter status response");
                        malformed = true;
                        break;
                    }
                }
            }
        }

        if malformed {
            Ok(None)
        } else {
            Err(Error::UnknownHost(addr.to_string()))
        }
    }

    /// Send `data` to `to` over the datagram service. A name with an
    /// address is sent directly to its first address, a name without one is
    /// broadcast on the subnet.
    pub async fn send_datagram(&self, from: &NetbiosName, to: &NetbiosName, data: &[u8]) -> Result<()> {
        let (msg_type, dest_ip) = match to.address(0) {
            Some(addr) if to.is_group() => (datagram_type::DIRECT_GROUP, addr),
            Some(addr) => (datagram_type::DIRECT_UNIQUE, addr),
            None => (datagram_type::BROADCAST, self.mask.address().await),
        };
        let source_ip = match self.config.local_address {
            Some(addr) => addr,
            None => mask::discover_local_ipv4().await.unwrap_or(Ipv4Addr::UNSPECIFIED),
        };

        let mut pkt = DatagramPacket::with_capacity(NB_USERDATA + data.len());
        let built = pkt.build(
            msg_type,
            self.next_transaction_id(),
            (source_ip, self.config.datagram_port),
            (from.name(), from.name_type()),
            (to.name(), to.name_type()),
            data,
        );
        if !built {
            return Err(Error::MessageTooLarge(data.len()));
        }

        let dest = SocketAddrV4::new(dest_ip, self.config.datagram_port);
        debug!(from = %from, to = %to, %dest, len = data.len(), "sending datagram");
        let sock = self.socket.lock().await;
        sock.send_to(pkt.as_bytes(), dest).await?;
        Ok(())
    }
}

/// ICMP unreachable reported on a later receive; not a socket failure.
fn is_unreachable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}
