//! NetBIOS name server: answers queries for local names, tracks names
//! registered by other nodes and registers, refreshes and releases our own.
//!
//! One UDP socket carries both the request loop and outgoing registrations,
//! so replies to our registrations arrive through the same loop.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{Config, NameServerConfig};
use crate::error::{Error, Result};
use crate::mask::{self, BroadcastMask};
use crate::protocol::name::{NameList, NetbiosName};
use crate::protocol::packet::NameServicePacket;
use crate::protocol::{name_type, opcode, rcode, NAME_TYPE_NBSTAT};

/// Receive buffer for incoming name service packets.
const RECV_BUFFER_LEN: usize = 1024;
/// Time allowed for a release to reach the wire before returning.
const RELEASE_INTERVAL: Duration = Duration::from_millis(200);

/// Shared name server state. Created by [`NameServer::bind`] and driven by
/// [`NameServer::run`] or [`NameServer::serve`].
pub struct NameServer {
    config: Arc<Config>,
    settings: NameServerConfig,
    socket: UdpSocket,
    addresses: Vec<Ipv4Addr>,
    mask: BroadcastMask,
    tran_id: AtomicU16,
    local_names: Mutex<NameList>,
    remote_names: Mutex<HashMap<NetbiosName, Ipv4Addr>>,
    /// Outstanding registrations by transaction id; set to the rcode of a
    /// negative response when one arrives.
    pending: Mutex<HashMap<u16, Option<u8>>>,
}

impl NameServer {
    /// Bind the name service socket. Server settings come from
    /// `config.server`, or defaults if absent.
    pub async fn bind(config: Arc<Config>) -> Result<Arc<Self>> {
        let settings = config.server.clone().unwrap_or_default();
        let bind_ip = settings.bind_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let socket = UdpSocket::bind(SocketAddrV4::new(bind_ip, settings.port)).await?;
        socket.set_broadcast(true)?;

        let mut addresses = settings.addresses.clone();
        if addresses.is_empty() {
            match config.local_address {
                Some(addr) => addresses.push(addr),
                None => addresses.extend(mask::discover_local_ipv4().await),
            }
        }
        if addresses.is_empty() {
            warn!("no address to advertise for local names");
        }

        info!(addr = %socket.local_addr()?, ?addresses, "NetBIOS name server bound");
        let mask = BroadcastMask::new(config.broadcast_address, addresses.first().copied());
        Ok(Arc::new(NameServer {
            config,
            settings,
            socket,
            addresses,
            mask,
            tran_id: AtomicU16::new(rand::random::<u16>()),
            local_names: Mutex::new(NameList::new()),
            remote_names: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    fn next_transaction_id(&self) -> u16 {
        self.tran_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn local_names(&self) -> NameList {
        self.local_names.lock().await.clone()
    }

    /// Names other nodes have registered with us, each with its owner address.
    pub async fn remote_names(&self) -> NameList {
        self.remote_names
            .lock()
            .await
            .iter()
            .map(|(nb, addr)| {
                let mut nb = nb.clone();
                nb.add_address(*addr);
                nb
            })
            .collect()
    }

    /// Fill in addresses, TTL and scope for a name we are about to own.
    fn prepare_local(&self, mut name: NetbiosName) -> NetbiosName {
        if name.number_of_addresses() == 0 {
            for addr in &self.addresses {
                name.add_address(*addr);
            }
        }
        if name.ttl() == 0 {
            name.set_ttl(self.settings.ttl);
        }
        if name.scope().is_none() {
            name.set_scope(self.config.scope().map(str::to_string));
        }
        name.set_local(true);
        name
    }

    /// Add a name to the local table without announcing it.
    pub async fn add_local_name(&self, name: NetbiosName) {
        let mut name = self.prepare_local(name);
        name.renew(Instant::now());
        let mut names = self.local_names.lock().await;
        names.remove(&name);
        names.add(name);
    }

    async fn destination(&self) -> (SocketAddr, bool) {
        match self.config.wins_server {
            Some(wins) => (SocketAddrV4::new(wins, self.config.name_port).into(), false),
            None => {
                let bcast = self.mask.address().await;
                (SocketAddrV4::new(bcast, self.config.name_port).into(), true)
            }
        }
    }

    async fn send(&self, pkt: &NameServicePacket, dest: SocketAddr) -> Result<()> {
        trace!(%dest, "sending\n{}", pkt.dump());
        self.socket.send_to(pkt.as_bytes(), dest).await?;
        Ok(())
    }

    // ---- Request loop ----

    /// Receive and answer name service packets until the socket fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    // ICMP unreachable from an earlier send
                    debug!("ignoring connection reset on name socket");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let SocketAddr::V4(from) = from else {
                continue;
            };
            if let Err(e) = self.handle_packet(&buf[..n], from).await {
                error!(%from, "name service packet error: {:?}", e);
            }
        }
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    async fn handle_packet(&self, data: &[u8], from: SocketAddrV4) -> Result<()> {
        let Some(pkt) = NameServicePacket::from_bytes(data) else {
            debug!("short name service packet");
            return Ok(());
        };
        trace!("received\n{}", pkt.dump());

        match pkt.opcode() {
            opcode::NAME_QUERY => self.process_name_query(&pkt, from).await,
            opcode::NAME_REGISTER | opcode::REFRESH | opcode::NAME_REGISTER_MULTI => {
                self.process_name_register(&pkt, from).await
            }
            opcode::NAME_RELEASE => {
                self.process_name_release(&pkt, from).await;
                Ok(())
            }
            opcode::RESP_REGISTER => {
                self.process_register_response(&pkt).await;
                Ok(())
            }
            opcode::WACK | opcode::RESP_QUERY | opcode::RESP_RELEASE => {
                debug!(op = opcode::as_str(pkt.opcode()), tran_id = pkt.transaction_id(), "ignored");
                Ok(())
            }
            other => {
                warn!(opcode = other, "unknown name service opcode");
                Ok(())
            }
        }
    }

    async fn process_name_query(&self, pkt: &NameServicePacket, from: SocketAddrV4) -> Result<()> {
        if pkt.question_count() != 1 {
            return Ok(());
        }
        let Some(question) = pkt.question_name() else {
            return Ok(());
        };

        if pkt.question_type() == Some(NAME_TYPE_NBSTAT) {
            let names = self.local_names.lock().await.clone();
            debug!(%from, names = names.len(), "adapter status query");
            let resp = NameServicePacket::adapter_status_response(
                pkt.transaction_id(),
                &names,
                self.settings.node_type,
            );
            return self.send(&resp, from.into()).await;
        }

        let wanted = question.name();
        let found = {
            let names = self.local_names.lock().await;
            names
                .iter()
                .find(|nb| nb.name_type() == question.name_type() && nb.name() == wanted)
                .cloned()
        };
        match found {
            Some(nb) => {
                debug!(name = %nb, %from, "answering name query");
                let resp = NameServicePacket::name_query_response(pkt.transaction_id(), &nb);
                self.send(&resp, from.into()).await
            }
            None => {
                trace!(name = %wanted, "query for a name we do not own");
                Ok(())
            }
        }
    }

    async fn process_name_register(&self, pkt: &NameServicePacket, from: SocketAddrV4) -> Result<()> {
        if pkt.question_count() != 1 {
            return Ok(());
        }
        let Some(question) = pkt.question_name() else {
            return Ok(());
        };
        let (owner, group) = pkt.additional_address().unwrap_or((*from.ip(), false));
        let mut nb = NetbiosName::from_raw(&question.raw, group);
        nb.set_scope(question.scope);

        // Defend a unique name we own against another owner
        let ours = {
            let names = self.local_names.lock().await;
            names
                .iter()
                .find(|l| l.name() == nb.name() && l.name_type() == nb.name_type())
                .cloned()
        };
        if let Some(ours) = ours {
            if !ours.is_group() && !ours.has_address(owner) && pkt.opcode() != opcode::REFRESH {
                warn!(name = %ours, %owner, "rejecting registration of a name we own");
                let resp = NameServicePacket::name_registration_response(
                    pkt.transaction_id(),
                    &ours,
                    rcode::ACT_ERR,
                );
                return self.send(&resp, from.into()).await;
            }
            return Ok(());
        }

        debug!(name = %nb, %owner, op = opcode::as_str(pkt.opcode()), "remote name registered");
        self.remote_names.lock().await.insert(nb, owner);
        Ok(())
    }

    async fn process_name_release(&self, pkt: &NameServicePacket, from: SocketAddrV4) {
        if pkt.question_count() != 1 {
            return;
        }
        let Some(question) = pkt.question_name() else {
            return;
        };
        let nb = NetbiosName::from_raw(&question.raw, false);
        if self.remote_names.lock().await.remove(&nb).is_some() {
            debug!(name = %nb, %from, "remote name released");
        }
    }

    async fn process_register_response(&self, pkt: &NameServicePacket) {
        if pkt.answer_count() == 0 {
            return;
        }
        let mut pending = self.pending.lock().await;
        if let Some(slot) = pending.get_mut(&pkt.transaction_id()) {
            if pkt.rcode() != 0 {
                debug!(tran_id = pkt.transaction_id(), rcode = pkt.rcode(), "registration refused");
                *slot = Some(pkt.rcode());
            }
        }
    }

    // ---- Our own names ----

    /// Register `name` on the network and add it to the local table.
    ///
    /// With a WINS server the request is sent once; otherwise it is broadcast
    /// `add_name_retries` times. A negative response from any node fails the
    /// registration. The request loop must be running to see responses.
    pub async fn register_name(&self, name: NetbiosName) -> Result<()> {
        let mut name = self.prepare_local(name);
        let (dest, broadcast) = self.destination().await;
        let (tries, interval) = if broadcast {
            (
                self.settings.add_name_retries.max(1),
                Duration::from_millis(self.settings.add_name_interval_ms),
            )
        } else {
            (1, Duration::from_millis(self.settings.wins_interval_ms))
        };

        let tran_id = self.next_transaction_id();
        self.pending.lock().await.insert(tran_id, None);
        info!(name = %name, %dest, "registering name");

        let mut conflict = None;
        for _ in 0..tries {
            for idx in 0..name.number_of_addresses() {
                if let Some(pkt) = NameServicePacket::add_name_request(&name, idx, tran_id, broadcast) {
                    if let Err(e) = self.send(&pkt, dest).await {
                        self.pending.lock().await.remove(&tran_id);
                        return Err(e);
                    }
                }
            }
            sleep(interval).await;
            conflict = self.pending.lock().await.get(&tran_id).copied().flatten();
            if conflict.is_some() {
                break;
            }
        }
        self.pending.lock().await.remove(&tran_id);

        if let Some(rc) = conflict {
            warn!(name = %name, rcode = rc, "name registration refused");
            return Err(Error::NameConflict { name: name.to_string(), rcode: rc });
        }

        name.renew(Instant::now());
        let mut names = self.local_names.lock().await;
        names.remove(&name);
        info!(name = %name, "name registered");
        names.add(name);
        Ok(())
    }

    /// Release a local name and tell the network. Returns false if we did
    /// not own it.
    pub async fn release_name(&self, name: &str, name_type: u8) -> Result<bool> {
        let removed = {
            let mut names = self.local_names.lock().await;
            let mut key = NetbiosName::new(name, name_type, false);
            key.set_local(true);
            names.remove(&key)
        };
        let Some(nb) = removed else {
            return Ok(false);
        };

        let (dest, broadcast) = self.destination().await;
        let tran_id = self.next_transaction_id();
        for idx in 0..nb.number_of_addresses() {
            if let Some(pkt) = NameServicePacket::delete_name_request(&nb, idx, tran_id, broadcast) {
                self.send(&pkt, dest).await?;
            }
        }
        sleep(RELEASE_INTERVAL).await;
        info!(name = %nb, "name released");
        Ok(true)
    }

    /// Re-announce local names that expire within the next refresh interval.
    pub async fn refresh_names(&self) -> Result<usize> {
        let window = Duration::from_secs(self.settings.refresh_interval_secs);
        let now = Instant::now();
        let due: Vec<NetbiosName> = {
            let names = self.local_names.lock().await;
            names
                .iter()
                .filter(|nb| nb.expiry().map_or(true, |e| e <= now + window))
                .cloned()
                .collect()
        };
        if due.is_empty() {
            return Ok(0);
        }

        let (dest, broadcast) = self.destination().await;
        for nb in &due {
            let tran_id = self.next_transaction_id();
            for idx in 0..nb.number_of_addresses() {
                if let Some(pkt) = NameServicePacket::refresh_name_request(nb, idx, tran_id, broadcast) {
                    self.send(&pkt, dest).await?;
                }
            }
            debug!(name = %nb, "name refreshed");
        }

        let mut names = self.local_names.lock().await;
        for nb in names.iter_mut() {
            if due.contains(nb) {
                nb.renew(now);
            }
        }
        Ok(due.len())
    }

    /// Register the configured server name as FileServer and WorkStation,
    /// and the domain as a group name. Conflicts are logged and skipped.
    pub async fn register_configured_names(&self) -> Result<usize> {
        let mut wanted = vec![
            NetbiosName::new(&self.settings.server_name, name_type::FILE_SERVER, false),
            NetbiosName::new(&self.settings.server_name, name_type::WORKSTATION, false),
        ];
        if let Some(domain) = self.settings.domain_name.as_deref().filter(|d| !d.is_empty()) {
            wanted.push(NetbiosName::new(domain, name_type::DOMAIN, true));
        }

        let mut registered = 0;
        for nb in wanted {
            match self.register_name(nb).await {
                Ok(()) => registered += 1,
                Err(Error::NameConflict { name, rcode }) => {
                    error!(%name, rcode, "name is owned by another node");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(registered)
    }

    /// Run the request loop, register the configured names and refresh
    /// them periodically. Returns only if the socket fails.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let mut listener = tokio::spawn(self.clone().run());
        self.register_configured_names().await?;

        let mut refresh = tokio::time::interval(Duration::from_secs(self.settings.refresh_interval_secs.max(1)));
        refresh.tick().await;
        loop {
            tokio::select! {
                res = &mut listener => {
                    return match res {
                        Ok(r) => r,
                        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e).into()),
                    };
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_names().await {
                        warn!("name refresh failed: {}", e);
                    }
                }
            }
        }
    }
}
