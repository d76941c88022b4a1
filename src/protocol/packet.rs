//! NetBIOS name service packets.
//! RFC 1002 Section 4.2
//!
//! A 12-byte header followed by question and resource record sections. The
//! second header word packs the opcode, the NM_FLAGS and the RCODE:
//!
//! ```text
//!  15 14 13 12 11 10 9 8 7 6 5 4 3 2 1 0
//! | R  OPCODE     | NM_FLAGS       | RCODE |
//! ```
//!
//! Here the response bit R is treated as the top bit of a 5-bit opcode, so
//! `RESP_QUERY` is `0x10`.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use crate::protocol::codec::{self, FullName, NAME_LEN};
use crate::protocol::name::{NameList, NetbiosName};
use crate::protocol::{
    flags, hex_dump, opcode, NodeType, NAME_CLASS_IN, NAME_FLAG_ACTIVE, NAME_FLAG_GROUP,
    NAME_TYPE_NB, NAME_TYPE_NBSTAT, NB_FLAG_GROUP,
};

/// Size of the name service header.
pub const NS_HEADER_LEN: usize = 12;

/// Largest name service datagram we build or accept.
pub const MAX_PACKET_LEN: usize = 1024;

/// TTL advertised in positive name query responses.
pub const QUERY_RESPONSE_TTL: u32 = 10_000;

/// Compression pointer to the question name, which always starts at offset 12.
const QUESTION_NAME_POINTER: u16 = 0xC000 | NS_HEADER_LEN as u16;

/// Wildcard name used in adapter status queries: `*` padded with NULs.
pub const NBSTAT_QUERY_NAME: &str = "*\0\0\0\0\0\0\0\0\0\0\0\0\0\0";

/// Zeroed statistics block that follows the name table in a status response.
const ADAPTER_STATS_LEN: usize = 42;
/// Bytes per name in an adapter status response: raw name plus flags.
const ADAPTER_NAME_ENTRY_LEN: usize = NAME_LEN + 2;
/// Smallest rdata length accepted for an adapter status response.
const MIN_ADAPTER_STATUS_LEN: usize = 16;
/// NB_FLAGS and IPv4 address.
const NB_ADDRESS_ENTRY_LEN: usize = 6;

const OPCODE_MASK: u16 = 0xF800;
const OPCODE_SHIFT: u16 = 11;
const FLAGS_MASK: u16 = 0x07F0;
const FLAGS_SHIFT: u16 = 4;
const RCODE_MASK: u16 = 0x000F;

// Header field offsets
const HDR_TRAN_ID: usize = 0;
const HDR_OPCODE: usize = 2;
const HDR_QDCOUNT: usize = 4;
const HDR_ANCOUNT: usize = 6;
const HDR_NSCOUNT: usize = 8;
const HDR_ARCOUNT: usize = 10;

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let b = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Option<u32> {
    let b = buf.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// A name service request or response.
#[derive(Debug, Clone)]
pub struct NameServicePacket {
    buf: BytesMut,
}

impl Default for NameServicePacket {
    fn default() -> Self {
        Self::new()
    }
}

impl NameServicePacket {
    /// An empty packet: a zeroed header and no sections.
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_LEN);
        buf.put_bytes(0, NS_HEADER_LEN);
        NameServicePacket { buf }
    }

    /// Wrap a received datagram. Returns `None` if it is shorter than the header.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < NS_HEADER_LEN {
            return None;
        }
        Some(NameServicePacket { buf: BytesMut::from(data) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() <= NS_HEADER_LEN
    }

    fn header_u16(&self, pos: usize) -> u16 {
        u16::from_be_bytes([self.buf[pos], self.buf[pos + 1]])
    }

    fn set_header_u16(&mut self, pos: usize, val: u16) {
        self.buf[pos..pos + 2].copy_from_slice(&val.to_be_bytes());
    }

    pub fn transaction_id(&self) -> u16 {
        self.header_u16(HDR_TRAN_ID)
    }

    pub fn set_transaction_id(&mut self, id: u16) {
        self.set_header_u16(HDR_TRAN_ID, id);
    }

    pub fn opcode(&self) -> u8 {
        ((self.header_u16(HDR_OPCODE) & OPCODE_MASK) >> OPCODE_SHIFT) as u8
    }

    /// Set the 5-bit opcode, leaving flags and rcode untouched.
    pub fn set_opcode(&mut self, op: u8) {
        let word = self.header_u16(HDR_OPCODE) & !OPCODE_MASK;
        self.set_header_u16(HDR_OPCODE, word | (((op as u16) << OPCODE_SHIFT) & OPCODE_MASK));
    }

    pub fn flags(&self) -> u8 {
        ((self.header_u16(HDR_OPCODE) & FLAGS_MASK) >> FLAGS_SHIFT) as u8
    }

    /// Set the 7-bit NM_FLAGS, leaving opcode and rcode untouched.
    pub fn set_flags(&mut self, fl: u8) {
        let word = self.header_u16(HDR_OPCODE) & !FLAGS_MASK;
        self.set_header_u16(HDR_OPCODE, word | (((fl as u16) << FLAGS_SHIFT) & FLAGS_MASK));
    }

    pub fn rcode(&self) -> u8 {
        (self.header_u16(HDR_OPCODE) & RCODE_MASK) as u8
    }

    pub fn set_rcode(&mut self, rc: u8) {
        let word = self.header_u16(HDR_OPCODE) & !RCODE_MASK;
        self.set_header_u16(HDR_OPCODE, word | (rc as u16 & RCODE_MASK));
    }

    pub fn is_response(&self) -> bool {
        self.opcode() & opcode::RESPONSE != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags() & flags::BROADCAST != 0
    }

    pub fn question_count(&self) -> u16 {
        self.header_u16(HDR_QDCOUNT)
    }

    pub fn set_question_count(&mut self, n: u16) {
        self.set_header_u16(HDR_QDCOUNT, n);
    }

    pub fn answer_count(&self) -> u16 {
        self.header_u16(HDR_ANCOUNT)
    }

    pub fn set_answer_count(&mut self, n: u16) {
        self.set_header_u16(HDR_ANCOUNT, n);
    }

    pub fn authority_count(&self) -> u16 {
        self.header_u16(HDR_NSCOUNT)
    }

    pub fn set_authority_count(&mut self, n: u16) {
        self.set_header_u16(HDR_NSCOUNT, n);
    }

    pub fn additional_count(&self) -> u16 {
        self.header_u16(HDR_ARCOUNT)
    }

    pub fn set_additional_count(&mut self, n: u16) {
        self.set_header_u16(HDR_ARCOUNT, n);
    }

    /// Reset to a bare header carrying the given ids and counts.
    fn reset(&mut self, tran_id: u16, op: u8, fl: u8) {
        self.buf.clear();
        self.buf.put_bytes(0, NS_HEADER_LEN);
        self.set_transaction_id(tran_id);
        self.set_opcode(op);
        self.set_flags(fl);
    }

    fn put_question(&mut self, raw: &[u8; NAME_LEN], scope: Option<&str>, qtype: u16) {
        codec::put_full_raw(&mut self.buf, raw, scope);
        self.buf.put_u16(qtype);
        self.buf.put_u16(NAME_CLASS_IN);
    }

    fn put_rr_header(&mut self, rtype: u16, ttl: u32, rdlen: u16) {
        self.buf.put_u16(rtype);
        self.buf.put_u16(NAME_CLASS_IN);
        self.buf.put_u32(ttl);
        self.buf.put_u16(rdlen);
    }

    // --- builders ---

    /// Build a name query for `name`. The broadcast flag is set when the
    /// query goes to the subnet rather than a WINS server.
    pub fn name_query_request(name: &NetbiosName, tran_id: u16, broadcast: bool) -> Self {
        let mut pkt = Self::new();
        pkt.reset(
            tran_id,
            opcode::NAME_QUERY,
            if broadcast { flags::BROADCAST } else { 0 },
        );
        pkt.set_question_count(1);
        pkt.put_question(&name.raw(), name.scope(), NAME_TYPE_NB);
        pkt
    }

    /// Build an adapter status (NBSTAT) query for whatever host receives it.
    pub fn adapter_status_request(tran_id: u16) -> Self {
        let mut pkt = Self::new();
        pkt.reset(tran_id, opcode::NAME_QUERY, flags::BROADCAST);
        pkt.set_question_count(1);
        pkt.put_question(&codec::pad_name(NBSTAT_QUERY_NAME, 0), None, NAME_TYPE_NBSTAT);
        pkt
    }

    /// Shared layout of register, refresh and release requests: one question
    /// for the name and one additional record carrying the address at
    /// `addr_idx`. Returns `None` if the name has no such address.
    fn name_registration(
        op: u8,
        name: &NetbiosName,
        addr_idx: usize,
        tran_id: u16,
        broadcast: bool,
    ) -> Option<Self> {
        let addr = name.address(addr_idx)?;
        let fl = if broadcast {
            flags::BROADCAST | flags::RECURSION_DESIRED
        } else {
            flags::RECURSION_DESIRED
        };

        let mut pkt = Self::new();
        pkt.reset(tran_id, op, fl);
        pkt.set_question_count(1);
        pkt.set_additional_count(1);
        pkt.put_question(&name.raw(), name.scope(), NAME_TYPE_NB);

        pkt.buf.put_u16(QUESTION_NAME_POINTER);
        pkt.put_rr_header(NAME_TYPE_NB, name.effective_ttl(), NB_ADDRESS_ENTRY_LEN as u16);
        pkt.buf.put_u16(if name.is_group() { NB_FLAG_GROUP } else { 0 });
        pkt.buf.put_slice(&addr.octets());
        Some(pkt)
    }

    pub fn add_name_request(name: &NetbiosName, addr_idx: usize, tran_id: u16, broadcast: bool) -> Option<Self> {
        Self::name_registration(opcode::NAME_REGISTER, name, addr_idx, tran_id, broadcast)
    }

    pub fn refresh_name_request(name: &NetbiosName, addr_idx: usize, tran_id: u16, broadcast: bool) -> Option<Self> {
        Self::name_registration(opcode::REFRESH, name, addr_idx, tran_id, broadcast)
    }

    pub fn delete_name_request(name: &NetbiosName, addr_idx: usize, tran_id: u16, broadcast: bool) -> Option<Self> {
        Self::name_registration(opcode::NAME_RELEASE, name, addr_idx, tran_id, broadcast)
    }

    /// Positive name query response listing every address owned by `name`.
    pub fn name_query_response(tran_id: u16, name: &NetbiosName) -> Self {
        let mut pkt = Self::new();
        pkt.reset(
            tran_id,
            opcode::RESP_QUERY,
            flags::AUTHORITATIVE_ANSWER | flags::RECURSION_DESIRED,
        );
        pkt.set_answer_count(1);
        codec::put_full_raw(&mut pkt.buf, &name.raw(), name.scope());

        let nb_flags = if name.is_group() { NB_FLAG_GROUP } else { 0 };
        let rdlen = name.number_of_addresses() * NB_ADDRESS_ENTRY_LEN;
        pkt.put_rr_header(NAME_TYPE_NB, QUERY_RESPONSE_TTL, rdlen as u16);
        for addr in name.addresses() {
            pkt.buf.put_u16(nb_flags);
            pkt.buf.put_slice(&addr.octets());
        }
        pkt
    }

    /// Registration response with the given rcode, answering the request
    /// that registered `name`. A non-zero rcode refuses the registration.
    pub fn name_registration_response(tran_id: u16, name: &NetbiosName, rc: u8) -> Self {
        let mut pkt = Self::new();
        pkt.reset(
            tran_id,
            opcode::RESP_REGISTER,
            flags::AUTHORITATIVE_ANSWER | flags::RECURSION_DESIRED,
        );
        pkt.set_rcode(rc);
        pkt.set_answer_count(1);
        codec::put_full_raw(&mut pkt.buf, &name.raw(), name.scope());

        let owner = name.address(0).unwrap_or(Ipv4Addr::UNSPECIFIED);
        pkt.put_rr_header(NAME_TYPE_NB, 0, NB_ADDRESS_ENTRY_LEN as u16);
        pkt.buf.put_u16(if name.is_group() { NB_FLAG_GROUP } else { 0 });
        pkt.buf.put_slice(&owner.octets());
        pkt
    }

    /// Adapter status response listing `names`. Each entry carries the node
    /// type bits and the active and group flags.
    pub fn adapter_status_response(tran_id: u16, names: &NameList, node_type: NodeType) -> Self {
        let mut pkt = Self::new();
        pkt.reset(
            tran_id,
            opcode::RESP_QUERY,
            flags::AUTHORITATIVE_ANSWER | flags::RECURSION_DESIRED,
        );
        pkt.set_answer_count(1);
        codec::put_full_raw(&mut pkt.buf, &codec::pad_name(NBSTAT_QUERY_NAME, 0), None);

        // The count is a single byte on the wire.
        let count = names.len().min(u8::MAX as usize);
        let rdlen = 1 + count * ADAPTER_NAME_ENTRY_LEN + ADAPTER_STATS_LEN;
        pkt.put_rr_header(NAME_TYPE_NBSTAT, 0, rdlen as u16);
        pkt.buf.put_u8(count as u8);
        for name in names.iter().take(count) {
            let mut fl = node_type.flag_bits() | NAME_FLAG_ACTIVE;
            if name.is_group() {
                fl |= NAME_FLAG_GROUP;
            }
            pkt.buf.put_slice(&name.raw());
            pkt.buf.put_u16(fl);
        }
        pkt.buf.put_bytes(0, ADAPTER_STATS_LEN);
        pkt
    }

    // --- parsers ---

    /// The first question name.
    pub fn question_name(&self) -> Option<FullName> {
        if self.question_count() == 0 {
            return None;
        }
        codec::decode_full_name(&self.buf, NS_HEADER_LEN)
    }

    /// Type of the first question (NB or NBSTAT).
    pub fn question_type(&self) -> Option<u16> {
        if self.question_count() == 0 {
            return None;
        }
        let len = codec::full_name_length(&self.buf, NS_HEADER_LEN)?;
        read_u16(&self.buf, NS_HEADER_LEN + len)
    }

    /// Offset of the first resource record after the question section.
    fn records_offset(&self) -> Option<usize> {
        let mut pos = NS_HEADER_LEN;
        for _ in 0..self.question_count() {
            pos += codec::full_name_length(&self.buf, pos)? + 4;
        }
        Some(pos)
    }

    /// Address of the first NB record in the additional section, as carried
    /// by register, refresh and release requests.
    pub fn additional_address(&self) -> Option<(Ipv4Addr, bool)> {
        if self.additional_count() == 0 {
            return None;
        }
        let mut pos = self.records_offset()?;
        // Skip any answer and authority records
        for _ in 0..(self.answer_count() as usize + self.authority_count() as usize) {
            pos += codec::full_name_length(&self.buf, pos)? + 8;
            pos += 2 + read_u16(&self.buf, pos)? as usize;
        }
        pos += codec::full_name_length(&self.buf, pos)? + 8;
        let rdlen = read_u16(&self.buf, pos)? as usize;
        if rdlen < NB_ADDRESS_ENTRY_LEN {
            return None;
        }
        let fl = read_u16(&self.buf, pos + 2)?;
        let ip = self.buf.get(pos + 4..pos + 8)?;
        Some((Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]), fl & NB_FLAG_GROUP != 0))
    }

    /// Names and addresses from the answer section. Each answer becomes one
    /// entry; an entry is a group name if any of its address records has the
    /// group bit set. Returns `None` if the records run past the packet.
    pub fn answer_name_list(&self) -> Option<NameList> {
        let mut pos = self.records_offset()?;
        let mut list = NameList::new();

        for _ in 0..self.answer_count() {
            let full = codec::decode_full_name(&self.buf, pos)?;
            pos += full.encoded_len;

            // type(2) class(2) ttl(4)
            let ttl = read_u32(&self.buf, pos + 4)?;
            pos += 8;
            let mut remaining = read_u16(&self.buf, pos)? as usize;
            pos += 2;

            let mut name = NetbiosName::from_raw(&full.raw, false);
            name.set_scope(full.scope);
            name.set_ttl(ttl);

            while remaining >= NB_ADDRESS_ENTRY_LEN {
                let fl = read_u16(&self.buf, pos)?;
                let ip = self.buf.get(pos + 2..pos + 6)?;
                if fl & NB_FLAG_GROUP != 0 {
                    name.set_group(true);
                }
                name.add_address(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]));
                pos += NB_ADDRESS_ENTRY_LEN;
                remaining -= NB_ADDRESS_ENTRY_LEN;
            }
            pos += remaining;
            list.add(name);
        }
        Some(list)
    }

    /// Names from an adapter status response. Returns `None` when the
    /// resource data is shorter than 16 bytes or the record is truncated;
    /// entries beyond the declared data length are ignored.
    pub fn adapter_status_name_list(&self) -> Option<NameList> {
        let mut pos = self.records_offset()?;
        pos += codec::full_name_length(&self.buf, pos)? + 8;

        let data_len = read_u16(&self.buf, pos)? as usize;
        if data_len < MIN_ADAPTER_STATUS_LEN {
            return None;
        }
        pos += 2;

        let mut count = *self.buf.get(pos)?;
        pos += 1;
        let mut remaining = data_len - 1;

        let mut list = NameList::new();
        while count > 0 && remaining >= ADAPTER_NAME_ENTRY_LEN {
            let entry = self.buf.get(pos..pos + ADAPTER_NAME_ENTRY_LEN)?;
            let mut raw = [0u8; NAME_LEN];
            raw.copy_from_slice(&entry[..NAME_LEN]);
            let fl = u16::from_be_bytes([entry[NAME_LEN], entry[NAME_LEN + 1]]);
            list.add(NetbiosName::from_raw(&raw, fl & NAME_FLAG_GROUP != 0));

            pos += ADAPTER_NAME_ENTRY_LEN;
            remaining -= ADAPTER_NAME_ENTRY_LEN;
            count -= 1;
        }
        Some(list)
    }

    /// Hex dump of the packet, for trace logging.
    pub fn dump(&self) -> String {
        format!(
            "tran_id={} op={} flags={:#04x} rcode={} qd={} an={} ns={} ar={}\n{}",
            self.transaction_id(),
            opcode::as_str(self.opcode()),
            self.flags(),
            self.rcode(),
            self.question_count(),
            self.answer_count(),
            self.authority_count(),
            self.additional_count(),
            hex_dump(&self.buf),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::name_type::{FILE_SERVER, WORKSTATION};
    use crate::protocol::rcode;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_name_query_request_layout() {
        let name = NetbiosName::new("TESTHOST", FILE_SERVER, false);
        let pkt = NameServicePacket::name_query_request(&name, 42, false);
        let bytes = pkt.as_bytes();

        assert_eq!(pkt.transaction_id(), 42);
        assert_eq!(pkt.question_count(), 1);
        assert_eq!(pkt.opcode(), opcode::NAME_QUERY);
        assert_eq!(pkt.flags(), 0);

        // 1 length + 32 encoded + 1 terminator, then qtype and qclass
        assert_eq!(bytes.len(), NS_HEADER_LEN + 34 + 4);
        assert_eq!(bytes[12], 0x20);
        assert_eq!(&bytes[13..45], &codec::encode_name("TESTHOST", FILE_SERVER)[..]);
        assert_eq!(bytes[45], 0);
        assert_eq!(&bytes[46..48], &[0x00, 0x20]);
        assert_eq!(&bytes[48..50], &[0x00, 0x01]);

        let q = pkt.question_name().unwrap();
        assert_eq!(q.name(), "TESTHOST");
        assert_eq!(q.name_type(), FILE_SERVER);
        assert_eq!(pkt.question_type(), Some(NAME_TYPE_NB));
    }

    #[test]
    fn test_broadcast_query_sets_flag() {
        let name = NetbiosName::new("X", 0, false);
        let pkt = NameServicePacket::name_query_request(&name, 1, true);
        assert!(pkt.is_broadcast());
        assert!(!pkt.is_response());
    }

    #[test]
    fn test_opcode_flags_rcode_independent() {
        let mut pkt = NameServicePacket::new();
        for op in 0..=31u8 {
            for fl in 0..=127u8 {
                for rc in 0..=15u8 {
                    pkt.set_rcode(rc);
                    pkt.set_flags(fl);
                    pkt.set_opcode(op);
                    assert_eq!(pkt.opcode(), op);
                    assert_eq!(pkt.flags(), fl);
                    assert_eq!(pkt.rcode(), rc);
                }
            }
        }
        // Setting one field again leaves the others alone
        pkt.set_opcode(opcode::RESP_QUERY);
        assert_eq!(pkt.flags(), 127);
        assert_eq!(pkt.rcode(), 15);
    }

    #[test]
    fn test_answer_name_list_two_addresses() {
        let srv = NetbiosName::with_addresses(
            "SRV1",
            FILE_SERVER,
            false,
            vec![ip("10.0.0.1"), ip("10.0.0.2")],
        );
        let resp = NameServicePacket::name_query_response(7, &srv);
        assert!(resp.is_response());
        assert_eq!(resp.opcode(), opcode::RESP_QUERY);
        assert_eq!(resp.answer_count(), 1);

        let parsed = NameServicePacket::from_bytes(resp.as_bytes()).unwrap();
        let list = parsed.answer_name_list().unwrap();
        assert_eq!(list.len(), 1);
        let entry = list.get(0).unwrap();
        assert_eq!(entry.name(), "SRV1");
        assert_eq!(entry.name_type(), FILE_SERVER);
        assert_eq!(entry.number_of_addresses(), 2);
        assert_eq!(entry.address(1), Some(ip("10.0.0.2")));
        assert_eq!(entry.ttl(), QUERY_RESPONSE_TTL);
        assert!(!entry.is_group());
    }

    #[test]
    fn test_answer_group_bit() {
        let dom = NetbiosName::with_addresses("CORP", WORKSTATION, true, vec![ip("10.0.0.9")]);
        let resp = NameServicePacket::name_query_response(1, &dom);
        let list = resp.answer_name_list().unwrap();
        assert!(list.get(0).unwrap().is_group());
    }

    #[test]
    fn test_answer_truncated() {
        let srv = NetbiosName::with_addresses("SRV1", FILE_SERVER, false, vec![ip("10.0.0.1")]);
        let resp = NameServicePacket::name_query_response(7, &srv);
        let bytes = resp.as_bytes();
        let cut = NameServicePacket::from_bytes(&bytes[..bytes.len() - 3]).unwrap();
        assert!(cut.answer_name_list().is_none());
    }

    #[test]
    fn test_registration_requests() {
        let mut name = NetbiosName::with_addresses(
            "SRV",
            FILE_SERVER,
            false,
            vec![ip("192.168.1.5"), ip("10.1.1.5")],
        );
        name.set_ttl(10_800);

        let pkt = NameServicePacket::add_name_request(&name, 1, 99, true).unwrap();
        assert_eq!(pkt.opcode(), opcode::NAME_REGISTER);
        assert_eq!(pkt.flags(), flags::BROADCAST | flags::RECURSION_DESIRED);
        assert_eq!(pkt.question_count(), 1);
        assert_eq!(pkt.additional_count(), 1);
        let bytes = pkt.as_bytes();
        // question (34 + 4), then pointer + type + class + ttl + rdlen + rdata
        assert_eq!(bytes.len(), NS_HEADER_LEN + 38 + 2 + 10 + 6);
        assert_eq!(&bytes[50..52], &[0xC0, 0x0C]);
        assert_eq!(read_u32(bytes, 56), Some(10_800));
        assert_eq!(pkt.additional_address(), Some((ip("10.1.1.5"), false)));

        let pkt = NameServicePacket::refresh_name_request(&name, 0, 100, false).unwrap();
        assert_eq!(pkt.opcode(), opcode::REFRESH);
        assert_eq!(pkt.flags(), flags::RECURSION_DESIRED);

        let pkt = NameServicePacket::delete_name_request(&name, 0, 101, true).unwrap();
        assert_eq!(pkt.opcode(), opcode::NAME_RELEASE);

        assert!(NameServicePacket::add_name_request(&name, 2, 1, true).is_none());
    }

    #[test]
    fn test_registration_default_ttl_and_group() {
        let dom = NetbiosName::with_addresses("CORP", WORKSTATION, true, vec![ip("10.0.0.1")]);
        let pkt = NameServicePacket::add_name_request(&dom, 0, 1, true).unwrap();
        assert_eq!(read_u32(pkt.as_bytes(), 56), Some(crate::protocol::name::DEFAULT_TTL));
        assert_eq!(pkt.additional_address(), Some((ip("10.0.0.1"), true)));
    }

    #[test]
    fn test_registration_response_rcode() {
        let name = NetbiosName::with_addresses("SRV", FILE_SERVER, false, vec![ip("10.0.0.1")]);
        let pkt = NameServicePacket::name_registration_response(5, &name, rcode::ACT_ERR);
        assert_eq!(pkt.opcode(), opcode::RESP_REGISTER);
        assert_eq!(pkt.rcode(), rcode::ACT_ERR);
        assert_eq!(pkt.transaction_id(), 5);
        assert!(pkt.is_response());
    }

    #[test]
    fn test_adapter_status_roundtrip() {
        let mut names = NameList::new();
        names.add(NetbiosName::new("SRV", FILE_SERVER, false));
        names.add(NetbiosName::new("SRV", WORKSTATION, false));
        names.add(NetbiosName::new("CORP", WORKSTATION, true));

        let pkt = NameServicePacket::adapter_status_response(3, &names, NodeType::H);
        let list = pkt.adapter_status_name_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(0).unwrap().name(), "SRV");
        assert_eq!(list.get(0).unwrap().name_type(), FILE_SERVER);
        assert!(list.get(2).unwrap().is_group());
        assert!(!list.get(1).unwrap().is_group());

        // First entry flags carry H-node bits and the active flag
        let flags_pos = NS_HEADER_LEN + 34 + 8 + 2 + 1 + NAME_LEN;
        assert_eq!(read_u16(pkt.as_bytes(), flags_pos), Some(0x6000 | NAME_FLAG_ACTIVE));
    }

    fn status_response_with_data_len(data_len: u16) -> NameServicePacket {
        let mut pkt = NameServicePacket::new();
        pkt.reset(1, opcode::RESP_QUERY, 0);
        pkt.set_answer_count(1);
        codec::put_full_raw(&mut pkt.buf, &codec::pad_name(NBSTAT_QUERY_NAME, 0), None);
        pkt.put_rr_header(NAME_TYPE_NBSTAT, 0, data_len);
        pkt.buf.put_u8(0);
        pkt.buf.put_bytes(0, data_len as usize);
        pkt
    }

    #[test]
    fn test_adapter_status_length_boundary() {
        let ok = status_response_with_data_len(16);
        let list = ok.adapter_status_name_list();
        assert!(list.is_some());
        assert!(list.unwrap().is_empty());

        let short = status_response_with_data_len(15);
        assert!(short.adapter_status_name_list().is_none());
    }

    #[test]
    fn test_adapter_status_count_exceeds_data() {
        // Count claims 5 names but the data only holds one
        let mut pkt = NameServicePacket::new();
        pkt.reset(1, opcode::RESP_QUERY, 0);
        pkt.set_answer_count(1);
        codec::put_full_raw(&mut pkt.buf, &codec::pad_name(NBSTAT_QUERY_NAME, 0), None);
        pkt.put_rr_header(NAME_TYPE_NBSTAT, 0, 1 + 18);
        pkt.buf.put_u8(5);
        pkt.buf.put_slice(&codec::pad_name("ONLY", 0));
        pkt.buf.put_u16(NAME_FLAG_ACTIVE);

        let list = pkt.adapter_status_name_list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().name(), "ONLY");
    }

    #[test]
    fn test_adapter_status_request() {
        let pkt = NameServicePacket::adapter_status_request(77);
        assert_eq!(pkt.question_type(), Some(NAME_TYPE_NBSTAT));
        let q = pkt.question_name().unwrap();
        assert_eq!(q.raw[0], b'*');
        assert!(q.raw[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_bytes_short() {
        assert!(NameServicePacket::from_bytes(&[0u8; 11]).is_none());
        let pkt = NameServicePacket::from_bytes(&[0u8; 12]).unwrap();
        assert!(pkt.question_name().is_none());
        assert!(pkt.answer_name_list().unwrap().is_empty());
    }
}
