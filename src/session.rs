//! NetBIOS session service client.
//! RFC 1002 Section 4.3
//!
//! A session moves through `Idle -> Connecting -> Established -> Closed`.
//! Connecting resolves the remote host, opens TCP to the session port and
//! exchanges a session request. Once established the session carries framed
//! messages in stream order.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::codec::MAX_NAME_LEN;
use crate::protocol::name::NetbiosName;
use crate::protocol::{name_type, SessionMessageType};
use crate::resolver::NameResolver;
use crate::transport;

/// Longest caller template accepted.
pub const MAX_TEMPLATE_LEN: usize = 8;
/// Characters allowed in a caller template.
pub const TEMPLATE_CHARS: &str = "@#_";
const SESSION_ID_CHAR: char = '#';
const INSTANCE_ID_CHAR: char = '@';

/// Generic name every SMB file server answers to.
pub const SMB_SERVER_WILDCARD: &str = "*SMBSERVER";

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    SessionId(usize),
    InstanceId(usize),
    Literal(char),
}

/// Suffix appended to the local host name to make a unique caller name.
///
/// A run of `#` becomes the session counter and a run of `@` the instance
/// id, each as zero-padded hex as wide as the run. `_` is copied as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerTemplate {
    template: String,
    parts: Vec<TemplatePart>,
}

impl CallerTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidTemplate { template: template.to_string(), reason };
        if template.is_empty() {
            return Err(invalid("empty"));
        }
        if template.chars().count() > MAX_TEMPLATE_LEN {
            return Err(invalid("longer than 8 characters"));
        }
        if !template.contains(SESSION_ID_CHAR) {
            return Err(invalid("no '#' session id field"));
        }
        if template.chars().any(|c| !TEMPLATE_CHARS.contains(c)) {
            return Err(invalid("only '@', '#' and '_' are allowed"));
        }

        let mut parts = Vec::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            let mut run = 1;
            while chars.peek() == Some(&c) && c != '_' {
                chars.next();
                run += 1;
            }
            parts.push(match c {
                SESSION_ID_CHAR => TemplatePart::SessionId(run),
                INSTANCE_ID_CHAR => TemplatePart::InstanceId(run),
                other => TemplatePart::Literal(other),
            });
        }
        Ok(CallerTemplate { template: template.to_string(), parts })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn len(&self) -> usize {
        self.template.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.template.is_empty()
    }

    /// Expand the template. Values wider than their field keep their low digits.
    pub fn expand(&self, session_id: u32, instance_id: u32) -> String {
        let mut out = String::with_capacity(MAX_TEMPLATE_LEN);
        for part in &self.parts {
            match *part {
                TemplatePart::SessionId(w) => out.push_str(&hex_field(session_id, w)),
                TemplatePart::InstanceId(w) => out.push_str(&hex_field(instance_id, w)),
                TemplatePart::Literal(c) => out.push(c),
            }
        }
        out
    }
}

fn hex_field(value: u32, width: usize) -> String {
    let hex = format!("{:0w$x}", value, w = width);
    hex[hex.len() - width..].to_string()
}

/// Hands out unique caller names: the local host name, truncated to leave
/// room for the template, followed by the expanded template.
#[derive(Debug)]
pub struct CallerNameGenerator {
    template: CallerTemplate,
    local_part: String,
    instance_id: u32,
    session_id: AtomicU32,
}

impl CallerNameGenerator {
    pub fn new(template: CallerTemplate, host_name: &str, instance_id: u32) -> Self {
        // The host part and the expanded template must fit in 15 characters
        let room = MAX_NAME_LEN.saturating_sub(template.len());
        let mut local_part: String = host_name.to_uppercase();
        if local_part.chars().count() > room {
            local_part = local_part.chars().take(room).collect();
        }
        CallerNameGenerator { template, local_part, instance_id, session_id: AtomicU32::new(0) }
    }

    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    /// Next caller name string; each call uses a fresh session id.
    pub fn next_name(&self) -> String {
        let id = self.session_id.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.local_part, self.template.expand(id, self.instance_id))
    }

    pub fn next_caller(&self, name_type: u8) -> NetbiosName {
        NetbiosName::new(&self.next_name(), name_type, false)
    }
}

/// Shared state for opening sessions: configuration, the name resolver and
/// the caller name counter.
pub struct NetbiosContext {
    config: Arc<Config>,
    resolver: Arc<NameResolver>,
    callers: CallerNameGenerator,
}

impl NetbiosContext {
    pub async fn new(config: Arc<Config>) -> Result<Arc<Self>> {
        let resolver = Arc::new(NameResolver::new(config.clone()).await?);
        Self::with_resolver(config, resolver)
    }

    pub fn with_resolver(config: Arc<Config>, resolver: Arc<NameResolver>) -> Result<Arc<Self>> {
        let template = CallerTemplate::parse(&config.caller_template)?;
        let callers = CallerNameGenerator::new(template, &config.local_host_name(), config.instance_id);
        Ok(Arc::new(NetbiosContext { config, resolver, callers }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<NameResolver> {
        &self.resolver
    }

    pub fn caller_names(&self) -> &CallerNameGenerator {
        &self.callers
    }

    /// Address for `host`: a dotted address as is, otherwise a NetBIOS lookup
    /// then DNS, as the lookup type allows.
    pub async fn resolve_host(&self, host: &str, name_type: u8) -> Result<Ipv4Addr> {
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Ok(addr);
        }

        if self.config.lookup_type.uses_wins() {
            match self.resolver.find_name(host, name_type, self.config.lookup_timeout()).await {
                Ok(Some(nb)) => {
                    let local: Vec<Ipv4Addr> = self.config.local_address.into_iter().collect();
                    if let Some(addr) = nb.best_match_address(&local) {
                        debug!(host, %addr, "resolved by NetBIOS name query");
                        return Ok(addr);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(host, error = %e, "NetBIOS name query failed"),
            }
        }

        if self.config.lookup_type.uses_dns() {
            if let Ok(addrs) = tokio::net::lookup_host((host, self.config.session_port)).await {
                for addr in addrs {
                    if let SocketAddr::V4(v4) = addr {
                        debug!(host, addr = %v4.ip(), "resolved by DNS");
                        return Ok(*v4.ip());
                    }
                }
            }
        }

        Err(Error::UnknownHost(host.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Established,
    Closed,
}

/// One NetBIOS session to a remote name.
pub struct NetbiosSession {
    ctx: Arc<NetbiosContext>,
    stream: Option<TcpStream>,
    state: SessionState,
    timeout: Duration,
    local_name_type: u8,
    remote_name_type: u8,
    local_name: Option<NetbiosName>,
    remote_name: Option<NetbiosName>,
    remote_addr: Option<SocketAddrV4>,
}

impl NetbiosSession {
    pub fn new(ctx: Arc<NetbiosContext>) -> Self {
        let timeout = ctx.config().session_timeout();
        NetbiosSession {
            ctx,
            stream: None,
            state: SessionState::Idle,
            timeout,
            local_name_type: name_type::WORKSTATION,
            remote_name_type: name_type::FILE_SERVER,
            local_name: None,
            remote_name: None,
            remote_addr: None,
        }
    }

    pub fn protocol_name(&self) -> &'static str {
        "TCP/IP NetBIOS"
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Established && self.stream.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Per-session read/write timeout, overriding the configured default.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_local_name_type(&mut self, t: u8) {
        self.local_name_type = t;
    }

    pub fn set_remote_name_type(&mut self, t: u8) {
        self.remote_name_type = t;
    }

    /// The name called when the session was established.
    pub fn remote_name(&self) -> Option<&NetbiosName> {
        self.remote_name.as_ref()
    }

    /// The caller name presented to the remote side.
    pub fn local_name(&self) -> Option<&NetbiosName> {
        self.local_name.as_ref()
    }

    pub fn remote_address(&self) -> Option<SocketAddrV4> {
        self.remote_addr
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Connect to `remote_host`. `local_name` replaces the generated caller
    /// name; `remote_addr` skips name resolution.
    ///
    /// A reject of the wildcard file server name is retried once with the
    /// host name itself.
    pub async fn connect(
        &mut self,
        remote_host: &str,
        local_name: Option<&str>,
        remote_addr: Option<Ipv4Addr>,
    ) -> Result<()> {
        if self.stream.is_some() {
            self.close().await;
        }
        self.state = SessionState::Connecting;

        let result = self.try_connect(remote_host, local_name, remote_addr).await;
        match &result {
            Ok(()) => {
                self.state = SessionState::Established;
                info!(
                    remote = %remote_host,
                    addr = ?self.remote_addr,
                    caller = ?self.local_name.as_ref().map(|n| n.to_string()),
                    "NetBIOS session established"
                );
            }
            Err(e) => {
                warn!(remote = %remote_host, error = %e, "NetBIOS session failed");
                self.stream = None;
                self.state = SessionState::Closed;
            }
        }
        result
    }

    async fn try_connect(
        &mut self,
        remote_host: &str,
        local_name: Option<&str>,
        remote_addr: Option<Ipv4Addr>,
    ) -> Result<()> {
        let addr = match remote_addr {
            Some(a) => a,
            None => self.ctx.resolve_host(remote_host, self.remote_name_type).await?,
        };
        let dest = SocketAddrV4::new(addr, self.ctx.config().session_port);
        self.remote_addr = Some(dest);

        let mut called = Vec::with_capacity(2);
        if self.remote_name_type == name_type::FILE_SERVER && self.ctx.config().wildcard_file_server {
            called.push(SMB_SERVER_WILDCARD.to_string());
        }
        if !called.iter().any(|c| c.eq_ignore_ascii_case(remote_host)) {
            called.push(remote_host.to_string());
        }

        let scope = self.ctx.config().scope().map(str::to_string);
        for (i, called_name) in called.iter().enumerate() {
            let mut to = NetbiosName::new(called_name, self.remote_name_type, false);
            to.set_scope(scope.clone());
            let mut from = match local_name {
                Some(n) => NetbiosName::new(n, self.local_name_type, false),
                None => self.ctx.caller_names().next_caller(self.local_name_type),
            };
            from.set_scope(scope.clone());

            debug!(from = %from, to = %to, %dest, "calling");
            match self.open_session(dest, &to, &from, remote_host).await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.local_name = Some(from);
                    self.remote_name = Some(to);
                    return Ok(());
                }
                Err(Error::SessionRejected { code, .. }) if i + 1 < called.len() => {
                    debug!(called = %to, code, "session rejected, retrying with host name");
                }
                Err(e) => return Err(e),
            }
        }
        // The loop returns on the last attempt
        Err(Error::UnknownHost(remote_host.to_string()))
    }

    /// One TCP connection and session request. Returns the stream on ACK.
    async fn open_session(
        &self,
        dest: SocketAddrV4,
        to: &NetbiosName,
        from: &NetbiosName,
        host: &str,
    ) -> Result<TcpStream> {
        let ms = self.timeout_ms();
        let mut stream = timeout(self.timeout, TcpStream::connect(dest))
            .await
            .map_err(|_| Error::Timeout(ms))??;
        stream.set_nodelay(true)?;

        let request = transport::build_session_request(to, from);
        timeout(self.timeout, stream.write_all(&request))
            .await
            .map_err(|_| Error::Timeout(ms))??;

        let invalid = |detail: String| Error::InvalidResponse { host: host.to_string(), detail };
        let hdr = match timeout(self.timeout, transport::read_header(&mut stream)).await {
            Err(_) => return Err(Error::Timeout(ms)),
            Ok(Err(Error::ShortRead { .. })) => {
                let _ = stream.shutdown().await;
                return Err(invalid("short session response header".to_string()));
            }
            Ok(res) => res?,
        };

        // Read the whole declared body so an accepted stream starts on a frame boundary
        let mut body = vec![0u8; hdr.length];
        if !body.is_empty() {
            match timeout(self.timeout, tokio::io::AsyncReadExt::read_exact(&mut stream, &mut body)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    let _ = stream.shutdown().await;
                    return Err(invalid(format!(
                        "truncated session response body ({} bytes declared): {}",
                        hdr.length, e
                    )));
                }
                Err(_) => {
                    let _ = stream.shutdown().await;
                    return Err(Error::Timeout(ms));
                }
            }
        }

        match hdr.message_type() {
            Some(SessionMessageType::Ack) => Ok(stream),
            Some(SessionMessageType::Reject) => {
                let code = body.first().copied().unwrap_or(0);
                let _ = stream.shutdown().await;
                Err(Error::SessionRejected { host: to.name().to_string(), code })
            }
            Some(SessionMessageType::Retarget) if body.len() >= 6 => {
                let addr = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                let _ = stream.shutdown().await;
                Err(Error::Retarget { addr, port })
            }
            _ => {
                let _ = stream.shutdown().await;
                Err(invalid(format!("unexpected session response type {:#04x}", hdr.msg_type)))
            }
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        if self.state != SessionState::Established {
            return Err(Error::NotConnected);
        }
        self.stream.as_mut().ok_or(Error::NotConnected)
    }

    /// Send `len` payload bytes from `buf[4..]`; the header is written into
    /// `buf[..4]`.
    pub async fn send(&mut self, buf: &mut [u8], len: usize) -> Result<()> {
        let wait = self.timeout;
        let ms = self.timeout_ms();
        let stream = self.stream_mut()?;
        timeout(wait, transport::write_session_message(stream, buf, len))
            .await
            .map_err(|_| Error::Timeout(ms))?
    }

    /// Receive the next message into `buf` (header at `buf[..4]`), waiting
    /// up to `wait` or the session timeout for it to start. Returns the
    /// payload length.
    ///
    /// Running out of `wait` before a header arrives leaves the session
    /// usable. Once a packet has started, the rest of it must arrive within
    /// the session timeout; failing that, or any error mid-packet, closes
    /// the session since the stream has lost its framing.
    pub async fn receive(&mut self, buf: &mut [u8], wait: Option<Duration>) -> Result<usize> {
        let wait = wait.unwrap_or(self.timeout);
        let deadline = Instant::now() + wait;
        let packet_wait = self.timeout;
        let packet_ms = self.timeout_ms();

        loop {
            let stream = self.stream_mut()?;
            let mut first = [0u8; 1];
            match timeout_at(deadline, stream.peek(&mut first)).await {
                Err(_) => return Err(Error::Timeout(wait.as_millis() as u64)),
                Ok(Err(e)) => {
                    self.close().await;
                    return Err(e.into());
                }
                Ok(Ok(_)) => {}
            }

            let stream = self.stream_mut()?;
            let res = timeout(packet_wait, transport::read_session_packet(stream, buf)).await;
            match res {
                Ok(Ok(Some(len))) => return Ok(len),
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    warn!(addr = ?self.remote_addr, "session receive failed: {}", e);
                    self.close().await;
                    return Err(e);
                }
                Err(_) => {
                    warn!(addr = ?self.remote_addr, "session message stalled part way");
                    self.close().await;
                    return Err(Error::Timeout(packet_ms));
                }
            }
        }
    }

    pub async fn send_keepalive(&mut self) -> Result<()> {
        let stream = self.stream_mut()?;
        transport::write_keepalive(stream).await
    }

    /// Close the session. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(addr = ?self.remote_addr, "NetBIOS session closed");
        }
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SESSION_HEADER_LEN;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn test_context(session_port: u16) -> Arc<NetbiosContext> {
        let config = Config {
            session_port,
            local_name: Some("client.example.com".into()),
            session_timeout_ms: 2_000,
            lookup_type: crate::config::LookupType::DnsOnly,
            ..Config::default()
        };
        NetbiosContext::new(Arc::new(config)).await.unwrap()
    }

    /// Read one session request and return the called name.
    async fn read_called_name(stream: &mut TcpStream) -> String {
        let hdr = transport::read_header(stream).await.unwrap();
        assert_eq!(hdr.message_type(), Some(SessionMessageType::Request));
        let mut body = vec![0u8; hdr.length];
        stream.read_exact(&mut body).await.unwrap();
        let (called, _calling) = transport::parse_session_request(&body).unwrap();
        called.name().to_string()
    }

    #[test]
    fn test_template_validation() {
        assert!(CallerTemplate::parse("_##").is_ok());
        assert!(CallerTemplate::parse("@@_####").is_ok());
        for bad in ["", "_________##", "_@@", "_#X", "ab##"] {
            assert!(
                matches!(CallerTemplate::parse(bad), Err(Error::InvalidTemplate { .. })),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_template_expansion() {
        let t = CallerTemplate::parse("@@_###").unwrap();
        assert_eq!(t.expand(0x1a, 3), "03_01a");
        // Wider values keep their low digits
        assert_eq!(t.expand(0x1234, 0x1ff), "ff_234");
    }

    #[test]
    fn test_caller_names_are_unique() {
        let callers = CallerNameGenerator::new(CallerTemplate::parse("_##").unwrap(), "ws1", 0);
        assert_eq!(callers.next_name(), "WS1_00");
        assert_eq!(callers.next_name(), "WS1_01");
        assert_eq!(callers.next_caller(name_type::WORKSTATION).name(), "WS1_02");
    }

    #[test]
    fn test_caller_name_truncates_host() {
        let callers = CallerNameGenerator::new(
            CallerTemplate::parse("_##").unwrap(),
            "VERYLONGHOSTNAME1",
            0,
        );
        // 15 - 3 leaves 12 characters for the host
        assert_eq!(callers.local_part(), "VERYLONGHOST");
        assert_eq!(callers.next_name(), "VERYLONGHOST_00");
        assert!(callers.next_name().len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_caller_names_unique_at_host_length_boundary() {
        let callers = CallerNameGenerator::new(CallerTemplate::parse("_##").unwrap(), "ABCDEFGHIJKLM", 0);
        assert_eq!(callers.local_part(), "ABCDEFGHIJKL");

        let first = callers.next_caller(name_type::WORKSTATION);
        let second = callers.next_caller(name_type::WORKSTATION);
        assert_eq!(first.name(), "ABCDEFGHIJKL_00");
        assert_eq!(second.name(), "ABCDEFGHIJKL_01");
        assert_ne!(first, second);

        // A host that fits exactly is kept whole
        let callers = CallerNameGenerator::new(CallerTemplate::parse("_##").unwrap(), "ABCDEFGHIJKL", 0);
        assert_eq!(callers.local_part(), "ABCDEFGHIJKL");
    }

    #[tokio::test]
    async fn test_context_uses_local_name() {
        let ctx = test_context(1).await;
        assert_eq!(ctx.caller_names().local_part(), "CLIENT");
    }

    #[tokio::test]
    async fn test_wildcard_reject_then_literal_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));

        let count = accepted.clone();
        let server = tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                count.fetch_add(1, Ordering::SeqCst);
                let called = read_called_name(&mut stream).await;
                if called == SMB_SERVER_WILDCARD {
                    // called name not present
                    transport::write_packet(&mut stream, SessionMessageType::Reject, &[0x82])
                        .await
                        .unwrap();
                } else {
                    assert_eq!(called, "FILESERVER");
                    transport::write_packet(&mut stream, SessionMessageType::Ack, &[])
                        .await
                        .unwrap();
                    let msg = transport::read_frame(&mut stream).await.unwrap();
                    transport::write_frame(&mut stream, &msg).await.unwrap();
                    return;
                }
            }
        });

        let ctx = test_context(port).await;
        let mut session = NetbiosSession::new(ctx);
        assert_eq!(session.state(), SessionState::Idle);
        session
            .connect("FILESERVER", None, Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Established);
        assert!(session.is_connected());
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(session.remote_name().unwrap().name(), "FILESERVER");
        assert!(session.local_name().unwrap().name().starts_with("CLIENT_"));

        let mut out = vec![0u8; SESSION_HEADER_LEN + 5];
        out[SESSION_HEADER_LEN..].copy_from_slice(b"hello");
        session.send(&mut out, 5).await.unwrap();

        let mut inbuf = vec![0u8; 64];
        let n = session.receive(&mut inbuf, None).await.unwrap();
        assert_eq!(&inbuf[SESSION_HEADER_LEN..SESSION_HEADER_LEN + n], b"hello");

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_without_wildcard_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_called_name(&mut stream).await;
            transport::write_packet(&mut stream, SessionMessageType::Reject, &[0x80])
                .await
                .unwrap();
        });

        let ctx = test_context(port).await;
        let mut session = NetbiosSession::new(ctx);
        session.set_remote_name_type(name_type::WORKSTATION);
        let err = session
            .connect("PRINTHOST", None, Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionRejected { code: 0x80, .. }));
        assert_eq!(session.state(), SessionState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_retarget_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_called_name(&mut stream).await;
            transport::write_packet(&mut stream, SessionMessageType::Retarget, &[10, 0, 0, 9, 0x01, 0xBD])
                .await
                .unwrap();
        });

        let ctx = test_context(port).await;
        let mut session = NetbiosSession::new(ctx);
        let err = session
            .connect("FILESERVER", Some("ME"), Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap_err();
        match err {
            Error::Retarget { addr, port } => {
                assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 9));
                assert_eq!(port, 445);
            }
            other => panic!("unexpected {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_called_name(&mut stream).await;
            stream.write_all(&[0x42]).await.unwrap();
        });

        let ctx = test_context(port).await;
        let mut session = NetbiosSession::new(ctx);
        let err = session
            .connect("FILESERVER", None, Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResponse { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_retarget_is_invalid() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_called_name(&mut stream).await;
            // Declares six bytes, sends two, then hangs up
            stream.write_all(&[0x84, 0x00, 0x00, 0x06, 10, 0]).await.unwrap();
        });

        let ctx = test_context(port).await;
        let mut session = NetbiosSession::new(ctx);
        let err = session
            .connect("FILESERVER", None, Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResponse { .. }), "got {:?}", err);
        assert!(!session.is_connected());
        server.await.unwrap();
    }

    /// Accept one connection and answer its session request with an ACK.
    async fn accept_and_ack(listener: &TcpListener, ack_body: &[u8]) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_called_name(&mut stream).await;
        transport::write_packet(&mut stream, SessionMessageType::Ack, ack_body)
            .await
            .unwrap();
        stream
    }

    #[tokio::test]
    async fn test_ack_body_is_drained() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut stream = accept_and_ack(&listener, &[0xAB; 70]).await;
            transport::write_frame(&mut stream, b"next").await.unwrap();
            stream
        });

        let ctx = test_context(port).await;
        let mut session = NetbiosSession::new(ctx);
        session
            .connect("FILESERVER", None, Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        let mut buf = vec![0u8; 64];
        let n = session.receive(&mut buf, None).await.unwrap();
        assert_eq!(&buf[SESSION_HEADER_LEN..SESSION_HEADER_LEN + n], b"next");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_split_message_outlasts_receive_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut stream = accept_and_ack(&listener, &[]).await;
            stream.write_all(&[0x00, 0x00, 0x00, 0x04, b'a', b'b']).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            stream.write_all(b"cd").await.unwrap();
            stream
        });

        let ctx = test_context(port).await;
        let mut session = NetbiosSession::new(ctx);
        session
            .connect("FILESERVER", None, Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        let mut buf = vec![0u8; 64];
        let n = session.receive(&mut buf, Some(Duration::from_millis(100))).await.unwrap();
        assert_eq!(&buf[SESSION_HEADER_LEN..SESSION_HEADER_LEN + n], b"abcd");
        assert!(session.is_connected());
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_idle_receive_timeout_keeps_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut stream = accept_and_ack(&listener, &[]).await;
            tokio::time::sleep(Duration::from_millis(400)).await;
            transport::write_frame(&mut stream, b"late").await.unwrap();
            stream
        });

        let ctx = test_context(port).await;
        let mut session = NetbiosSession::new(ctx);
        session
            .connect("FILESERVER", None, Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        let mut buf = vec![0u8; 64];
        let err = session.receive(&mut buf, Some(Duration::from_millis(100))).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(100)));
        assert!(session.is_connected());

        let n = session.receive(&mut buf, None).await.unwrap();
        assert_eq!(&buf[SESSION_HEADER_LEN..SESSION_HEADER_LEN + n], b"late");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_message_closes_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut stream = accept_and_ack(&listener, &[]).await;
            stream.write_all(&[0x00, 0x00, 0x00, 0x04, b'a', b'b']).await.unwrap();
            tokio::time::sleep(Duration::from_millis(800)).await;
            stream
        });

        let ctx = test_context(port).await;
        let mut session = NetbiosSession::new(ctx);
        session
            .connect("FILESERVER", None, Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        session.set_timeout(Duration::from_millis(200));

        let mut buf = vec![0u8; 64];
        let err = session.receive(&mut buf, Some(Duration::from_millis(100))).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(200)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.receive(&mut buf, None).await, Err(Error::NotConnected)));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let ctx = test_context(1).await;
        let mut session = NetbiosSession::new(ctx);
        let mut buf = [0u8; 8];
        assert!(matches!(session.send(&mut buf, 4).await, Err(Error::NotConnected)));
        assert!(matches!(session.receive(&mut buf, None).await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_unknown_host_with_wins_only_and_no_answer() {
        let config = Config {
            lookup_type: crate::config::LookupType::WinsOnly,
            wins_server: Some(Ipv4Addr::LOCALHOST),
            // nothing listens here
            name_port: 9,
            lookup_timeout_ms: 250,
            ..Config::default()
        };
        let ctx = NetbiosContext::new(Arc::new(config)).await.unwrap();
        let res = ctx.resolve_host("NO-SUCH-HOST", name_type::FILE_SERVER).await;
        assert!(matches!(res, Err(Error::UnknownHost(_))));
    }
}
