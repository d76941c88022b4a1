//! NetBIOS datagram service packet.
//! RFC 1002 Section 4.4.2
//!
//! The packet is a fixed-layout view over an owned buffer. Offsets:
//!
//! ```text
//!  0  msg type          1
//!  1  flags             1
//!  2  datagram id       2  (little-endian)
//!  4  source IP         4
//!  8  source port       2  (little-endian)
//! 10  datagram length   2  (big-endian)
//! 12  packet offset     2
//! 14  source name      34
//! 48  destination name 34
//! 82  user data
//! ```

use std::net::Ipv4Addr;

use crate::protocol::codec::{self, ENCODED_NAME_LEN, FULL_NAME_LEN};
use crate::protocol::datagram_type;
use crate::protocol::name::NetbiosName;

pub const DGM_MSG_TYPE: usize = 0;
pub const DGM_FLAGS: usize = 1;
pub const DGM_ID: usize = 2;
pub const DGM_SOURCE_IP: usize = 4;
pub const DGM_SOURCE_PORT: usize = 8;
pub const DGM_LENGTH: usize = 10;
pub const DGM_OFFSET: usize = 12;
pub const DGM_FROM_NAME: usize = 14;
pub const DGM_TO_NAME: usize = 48;
pub const NB_USERDATA: usize = 82;

/// Default buffer allocation.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Minimum total length for a datagram to be treated as carrying SMB.
const MIN_SMB_DATAGRAM_LEN: usize = 100;
const SMB_SIGNATURE: [u8; 4] = [0xFF, b'S', b'M', b'B'];

/// A datagram service packet over a caller-owned buffer.
#[derive(Debug, Clone)]
pub struct DatagramPacket {
    buf: Vec<u8>,
    len: usize,
}

impl Default for DatagramPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramPacket {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Allocate a packet buffer; the header is always included.
    pub fn with_capacity(size: usize) -> Self {
        DatagramPacket { buf: vec![0u8; size.max(NB_USERDATA)], len: NB_USERDATA }
    }

    /// Wrap a received datagram. Returns `None` if it cannot hold the header.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < NB_USERDATA {
            return None;
        }
        Some(DatagramPacket { buf: data.to_vec(), len: data.len() })
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The used part of the buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn length(&self) -> usize {
        self.len
    }

    /// Record the total used length, clamped to the buffer.
    pub fn set_length(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    /// Length of the user data part.
    pub fn data_length(&self) -> usize {
        self.len.saturating_sub(NB_USERDATA)
    }

    pub fn message_type(&self) -> u8 {
        self.buf[DGM_MSG_TYPE]
    }

    pub fn set_message_type(&mut self, t: u8) {
        self.buf[DGM_MSG_TYPE] = t;
    }

    pub fn flags(&self) -> u8 {
        self.buf[DGM_FLAGS]
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.buf[DGM_FLAGS] = flags;
    }

    pub fn datagram_id(&self) -> u16 {
        u16::from_le_bytes([self.buf[DGM_ID], self.buf[DGM_ID + 1]])
    }

    pub fn set_datagram_id(&mut self, id: u16) {
        self.buf[DGM_ID..DGM_ID + 2].copy_from_slice(&id.to_le_bytes());
    }

    pub fn source_ip(&self) -> Ipv4Addr {
        let b = &self.buf[DGM_SOURCE_IP..DGM_SOURCE_IP + 4];
        Ipv4Addr::new(b[0], b[1], b[2], b[3])
    }

    pub fn set_source_ip(&mut self, addr: Ipv4Addr) {
        self.buf[DGM_SOURCE_IP..DGM_SOURCE_IP + 4].copy_from_slice(&addr.octets());
    }

    pub fn source_port(&self) -> u16 {
        u16::from_le_bytes([self.buf[DGM_SOURCE_PORT], self.buf[DGM_SOURCE_PORT + 1]])
    }

    pub fn set_source_port(&mut self, port: u16) {
        self.buf[DGM_SOURCE_PORT..DGM_SOURCE_PORT + 2].copy_from_slice(&port.to_le_bytes());
    }

    pub fn datagram_length(&self) -> u16 {
        u16::from_be_bytes([self.buf[DGM_LENGTH], self.buf[DGM_LENGTH + 1]])
    }

    pub fn set_datagram_length(&mut self, len: u16) {
        self.buf[DGM_LENGTH..DGM_LENGTH + 2].copy_from_slice(&len.to_be_bytes());
    }

    pub fn packet_offset(&self) -> u16 {
        u16::from_be_bytes([self.buf[DGM_OFFSET], self.buf[DGM_OFFSET + 1]])
    }

    pub fn set_packet_offset(&mut self, off: u16) {
        self.buf[DGM_OFFSET..DGM_OFFSET + 2].copy_from_slice(&off.to_be_bytes());
    }

    fn put_name(&mut self, offset: usize, name: &str, name_type: u8) {
        self.buf[offset] = ENCODED_NAME_LEN as u8;
        self.buf[offset + 1..offset + 1 + ENCODED_NAME_LEN]
            .copy_from_slice(&codec::encode_name(name, name_type));
        self.buf[offset + FULL_NAME_LEN - 1] = 0;
    }

    pub fn set_source_name(&mut self, name: &str, name_type: u8) {
        self.put_name(DGM_FROM_NAME, name, name_type);
    }

    pub fn set_destination_name(&mut self, name: &str, name_type: u8) {
        self.put_name(DGM_TO_NAME, name, name_type);
    }

    /// Copy `data` into the user data area and update the datagram length
    /// field. Returns `false` if the buffer cannot hold it.
    pub fn set_user_data(&mut self, data: &[u8]) -> bool {
        let end = NB_USERDATA + data.len();
        if end > self.buf.len() || end > u16::MAX as usize {
            return false;
        }
        self.buf[NB_USERDATA..end].copy_from_slice(data);
        self.set_datagram_length(end as u16);
        true
    }

    /// User data within the recorded length.
    pub fn user_data(&self) -> &[u8] {
        &self.buf[NB_USERDATA..self.len.max(NB_USERDATA)]
    }

    /// Whether the user data starts with an SMB signature.
    pub fn is_smb_data(&self) -> bool {
        self.len >= MIN_SMB_DATAGRAM_LEN && self.buf[NB_USERDATA..].starts_with(&SMB_SIGNATURE)
    }

    fn name_at(&self, offset: usize) -> Option<NetbiosName> {
        if self.buf[offset] as usize != ENCODED_NAME_LEN {
            return None;
        }
        let raw = codec::decode_name(&self.buf, offset + 1)?;
        let group = self.message_type() == datagram_type::DIRECT_GROUP;
        Some(NetbiosName::from_raw(&raw, group))
    }

    pub fn source_name(&self) -> Option<NetbiosName> {
        self.name_at(DGM_FROM_NAME)
    }

    /// Destination name; marked as a group name for DIRECT_GROUP datagrams.
    pub fn destination_name(&self) -> Option<NetbiosName> {
        self.name_at(DGM_TO_NAME)
    }

    /// Fill in a complete datagram in one go.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &mut self,
        msg_type: u8,
        datagram_id: u16,
        source: (Ipv4Addr, u16),
        from: (&str, u8),
        to: (&str, u8),
        data: &[u8],
    ) -> bool {
        self.set_message_type(msg_type);
        self.set_flags(0x02); // first fragment, no more fragments, B node
        self.set_datagram_id(datagram_id);
        self.set_source_ip(source.0);
        self.set_source_port(source.1);
        self.set_packet_offset(0);
        self.set_source_name(from.0, from.1);
        self.set_destination_name(to.0, to.1);
        if !self.set_user_data(data) {
            return false;
        }
        self.set_length(NB_USERDATA + data.len());
        true
    }
}
