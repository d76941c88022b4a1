//! NetBIOS Session Service framing.
//! RFC 1002 Section 4.3
//!
//! Every session packet starts with a 4-byte header: the packet type, a flags
//! byte whose low bit extends the length to 17 bits, and a big-endian 16-bit
//! length.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::codec;
use crate::protocol::name::NetbiosName;
use crate::protocol::{SessionMessageType, MAX_SESSION_PAYLOAD, SESSION_HEADER_LEN};

/// Flags bit carrying the 17th length bit.
const LENGTH_EXTENSION: u8 = 0x01;

/// Parsed session packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    pub msg_type: u8,
    pub length: usize,
}

impl SessionHeader {
    pub fn new(msg_type: SessionMessageType, length: usize) -> Self {
        SessionHeader { msg_type: msg_type as u8, length }
    }

    /// Parse a header from the first four bytes of `input`.
    pub fn parse(input: &[u8]) -> Option<Self> {
        if input.len() < SESSION_HEADER_LEN {
            return None;
        }
        let high = ((input[1] & LENGTH_EXTENSION) as usize) << 16;
        let length = high | u16::from_be_bytes([input[2], input[3]]) as usize;
        Some(SessionHeader { msg_type: input[0], length })
    }

    /// Encode the header. Lengths above 17 bits are truncated; callers check
    /// against [`MAX_SESSION_PAYLOAD`] first.
    pub fn encode(&self) -> [u8; SESSION_HEADER_LEN] {
        let len = (self.length & MAX_SESSION_PAYLOAD) as u32;
        let flags = if len > 0xFFFF { LENGTH_EXTENSION } else { 0 };
        let low = (len & 0xFFFF) as u16;
        let [hi, lo] = low.to_be_bytes();
        [self.msg_type, flags, hi, lo]
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.encode());
    }

    pub fn message_type(&self) -> Option<SessionMessageType> {
        SessionMessageType::from_u8(self.msg_type)
    }
}

/// Build a session request: header, called name, calling name. The header
/// length is filled in once both names are written.
pub fn build_session_request(called: &NetbiosName, calling: &NetbiosName) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SESSION_HEADER_LEN + 2 * codec::FULL_NAME_LEN);
    buf.put_u8(SessionMessageType::Request as u8);
    buf.put_u8(0);
    buf.put_u16(0);
    buf.put_slice(&called.full_name());
    buf.put_slice(&calling.full_name());

    let len = buf.len() - SESSION_HEADER_LEN;
    let header = SessionHeader::new(SessionMessageType::Request, len).encode();
    buf[..SESSION_HEADER_LEN].copy_from_slice(&header);
    buf
}

/// Called and calling names from a session request body.
pub fn parse_session_request(body: &[u8]) -> Option<(NetbiosName, NetbiosName)> {
    let called = codec::decode_full_name(body, 0)?;
    let calling = codec::decode_full_name(body, called.encoded_len)?;
    let to_name = |full: codec::FullName| {
        let mut nb = NetbiosName::from_raw(&full.raw, false);
        nb.set_scope(full.scope);
        nb
    };
    Some((to_name(called), to_name(calling)))
}

/// Fill `buf` completely. A stream that ends first is a short read.
async fn read_full<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::ShortRead { wanted: buf.len() })
        }
        Err(e) => Err(e.into()),
    }
}

/// Read one session packet header.
pub async fn read_header<R: AsyncRead + Unpin>(stream: &mut R) -> Result<SessionHeader> {
    let mut hdr = [0u8; SESSION_HEADER_LEN];
    read_full(stream, &mut hdr).await?;
    // parse cannot fail on a full header
    SessionHeader::parse(&hdr).ok_or(Error::ShortRead { wanted: SESSION_HEADER_LEN })
}

/// Read one session packet into `buf`, header included at `buf[..4]`.
/// Returns `None` for a keep-alive, otherwise the payload length. Any error
/// after the header has been read leaves the stream mid-frame.
pub async fn read_session_packet<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<Option<usize>> {
    let hdr = read_header(stream).await?;
    match hdr.message_type() {
        Some(SessionMessageType::KeepAlive) => {
            trace!("skipping keep-alive");
            // A keep-alive carries no payload, but drain one if a peer sent it
            if hdr.length > 0 {
                let mut discard = vec![0u8; hdr.length];
                read_full(stream, &mut discard).await?;
            }
            return Ok(None);
        }
        Some(SessionMessageType::Message) => {}
        _ => return Err(Error::UnknownPacketType(hdr.msg_type)),
    }

    let required = SESSION_HEADER_LEN + hdr.length;
    if buf.len() < required {
        return Err(Error::BufferTooSmall { required, actual: buf.len() });
    }
    buf[..SESSION_HEADER_LEN].copy_from_slice(&hdr.encode());
    read_full(stream, &mut buf[SESSION_HEADER_LEN..required]).await?;
    trace!(len = hdr.length, "received session message");
    Ok(Some(hdr.length))
}

/// Read the next session message into `buf`, header included at `buf[..4]`.
/// Keep-alives are consumed silently. Returns the payload length.
pub async fn read_session_message<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        if let Some(len) = read_session_packet(stream, buf).await? {
            return Ok(len);
        }
    }
}

/// Send `payload_len` bytes from `buf[4..]` as a session message. The first
/// four bytes of `buf` are overwritten with the header.
pub async fn write_session_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    buf: &mut [u8],
    payload_len: usize,
) -> Result<()> {
    if payload_len > MAX_SESSION_PAYLOAD {
        return Err(Error::MessageTooLarge(payload_len));
    }
    let total = SESSION_HEADER_LEN + payload_len;
    if buf.len() < total {
        return Err(Error::BufferTooSmall { required: total, actual: buf.len() });
    }
    let header = SessionHeader::new(SessionMessageType::Message, payload_len).encode();
    buf[..SESSION_HEADER_LEN].copy_from_slice(&header);
    stream.write_all(&buf[..total]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one session message, allocating for its payload.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    loop {
        let hdr = read_header(stream).await?;
        let mut payload = vec![0u8; hdr.length];
        read_full(stream, &mut payload).await?;
        match hdr.message_type() {
            Some(SessionMessageType::KeepAlive) => continue,
            Some(SessionMessageType::Message) => return Ok(payload),
            _ => return Err(Error::UnknownPacketType(hdr.msg_type)),
        }
    }
}

/// Write `data` as one session message.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<()> {
    write_packet(stream, SessionMessageType::Message, data).await
}

/// Write a session packet of any type.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg_type: SessionMessageType,
    data: &[u8],
) -> Result<()> {
    if data.len() > MAX_SESSION_PAYLOAD {
        return Err(Error::MessageTooLarge(data.len()));
    }
    stream.write_all(&SessionHeader::new(msg_type, data.len()).encode()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn write_keepalive<W: AsyncWrite + Unpin>(stream: &mut W) -> Result<()> {
    write_packet(stream, SessionMessageType::KeepAlive, &[]).await
}
