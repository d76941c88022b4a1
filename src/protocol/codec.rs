//! NetBIOS name encoding and decoding.
//!
//! A NetBIOS name is 15 characters, space padded, plus a type byte. On the wire
//! each of the 16 bytes is split into two nibbles and each nibble is written
//! as a character from `A`..`P` (RFC 1001 Section 14.1, "first-level encoding").
//! The 32 encoded bytes are then wrapped as the first label of a DNS-style
//! name, optionally followed by the scope labels (the "second-level encoding").

use bytes::{BufMut, BytesMut};

/// Nibble-to-character table.
pub const NAME_ALPHABET: &[u8; 16] = b"ABCDEFGHIJKLMNOP";

/// Usable characters in a name.
pub const MAX_NAME_LEN: usize = 15;
/// Name plus type byte.
pub const NAME_LEN: usize = 16;
/// Length of the first-level encoded name.
pub const ENCODED_NAME_LEN: usize = 32;
/// Length byte + encoded name + terminator, for a name without scope.
pub const FULL_NAME_LEN: usize = ENCODED_NAME_LEN + 2;
/// Longest scope label we will write.
pub const MAX_LABEL_LEN: usize = 63;

/// Leading bytes of the browser election pseudo-name, which is never trimmed.
pub const BROWSE_PREFIX: [u8; 2] = [0x01, 0x02];

/// Top two bits of a label length byte that mark a compression pointer.
const LABEL_POINTER: u8 = 0xC0;

/// Map a name string onto single bytes, uppercasing ASCII letters.
/// Characters outside Latin-1 cannot be represented and become `?`.
pub fn name_bytes(name: &str) -> Vec<u8> {
    name.chars()
        .map(|c| {
            let u = c.to_ascii_uppercase() as u32;
            if u <= 0xFF { u as u8 } else { b'?' }
        })
        .collect()
}

/// Inverse of [`name_bytes`]: each byte becomes the Latin-1 character with that value.
pub fn bytes_to_name(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Build the raw 16-byte form: uppercased name truncated or space padded to
/// 15 bytes, then the type byte.
pub fn pad_name(name: &str, name_type: u8) -> [u8; NAME_LEN] {
    let mut raw = [b' '; NAME_LEN];
    let bytes = name_bytes(name);
    let len = bytes.len().min(MAX_NAME_LEN);
    raw[..len].copy_from_slice(&bytes[..len]);
    raw[MAX_NAME_LEN] = name_type;
    raw
}

/// First-level encode a raw 16-byte name.
pub fn encode_raw(raw: &[u8; NAME_LEN]) -> [u8; ENCODED_NAME_LEN] {
    let mut encoded = [0u8; ENCODED_NAME_LEN];
    for (i, &b) in raw.iter().enumerate() {
        encoded[i * 2] = NAME_ALPHABET[(b >> 4) as usize];
        encoded[i * 2 + 1] = NAME_ALPHABET[(b & 0x0F) as usize];
    }
    encoded
}

/// First-level encode a name and type. A space always encodes as `CA`.
pub fn encode_name(name: &str, name_type: u8) -> [u8; ENCODED_NAME_LEN] {
    encode_raw(&pad_name(name, name_type))
}

fn nibble(c: u8) -> Option<u8> {
    if (b'A'..=b'P').contains(&c) {
        Some(c - b'A')
    } else {
        None
    }
}

/// Decode 32 encoded bytes at `offset` back to the raw 16-byte name.
/// Returns `None` if the buffer is too short or a character is outside the alphabet.
pub fn decode_name(buf: &[u8], offset: usize) -> Option<[u8; NAME_LEN]> {
    let encoded = buf.get(offset..offset.checked_add(ENCODED_NAME_LEN)?)?;
    let mut raw = [0u8; NAME_LEN];
    for (i, pair) in encoded.chunks_exact(2).enumerate() {
        raw[i] = (nibble(pair[0])? << 4) | nibble(pair[1])?;
    }
    Some(raw)
}

/// Split a raw name into its trimmed name string and type byte.
/// Trailing spaces are removed unless the name is the browser election name.
pub fn split_name(raw: &[u8; NAME_LEN]) -> (String, u8) {
    let body = &raw[..MAX_NAME_LEN];
    let body = if body.starts_with(&BROWSE_PREFIX) {
        body
    } else {
        let end = body.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
        &body[..end]
    };
    (bytes_to_name(body), raw[MAX_NAME_LEN])
}

/// Write the second-level encoded name: length byte, 32 encoded bytes, the
/// scope labels and the terminating zero.
pub fn put_full_name(buf: &mut BytesMut, name: &str, name_type: u8, scope: Option<&str>) {
    put_full_raw(buf, &pad_name(name, name_type), scope);
}

/// As [`put_full_name`] for an already padded raw name.
pub fn put_full_raw(buf: &mut BytesMut, raw: &[u8; NAME_LEN], scope: Option<&str>) {
    buf.put_u8(ENCODED_NAME_LEN as u8);
    buf.put_slice(&encode_raw(raw));
    if let Some(scope) = scope {
        for label in scope.split('.').filter(|l| !l.is_empty()) {
            let label = &label.as_bytes()[..label.len().min(MAX_LABEL_LEN)];
            buf.put_u8(label.len() as u8);
            buf.put_slice(label);
        }
    }
    buf.put_u8(0);
}

/// Second-level encode a name into a new buffer.
pub fn encode_full_name(name: &str, name_type: u8, scope: Option<&str>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(FULL_NAME_LEN + scope.map_or(0, |s| s.len() + 1));
    put_full_name(&mut buf, name, name_type, scope);
    buf.to_vec()
}

/// Number of bytes an encoded name occupies at `offset`, including the
/// terminating zero (or the two bytes of a compression pointer).
/// Returns `None` if the labels run past the end of the buffer.
pub fn full_name_length(buf: &[u8], offset: usize) -> Option<usize> {
    let mut pos = offset;
    loop {
        let len = *buf.get(pos)?;
        if len & LABEL_POINTER == LABEL_POINTER {
            buf.get(pos + 1)?;
            return Some(pos + 2 - offset);
        }
        pos += 1;
        if len == 0 {
            return Some(pos - offset);
        }
        pos += len as usize;
        if pos > buf.len() {
            return None;
        }
    }
}

/// A second-level encoded name read from a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullName {
    pub raw: [u8; NAME_LEN],
    pub scope: Option<String>,
    /// Bytes occupied at the decoded offset.
    pub encoded_len: usize,
}

impl FullName {
    pub fn name(&self) -> String {
        split_name(&self.raw).0
    }

    pub fn name_type(&self) -> u8 {
        self.raw[MAX_NAME_LEN]
    }
}

/// Decode a second-level encoded name. A compression pointer is followed
/// once; `encoded_len` still reports the two bytes of the pointer.
pub fn decode_full_name(buf: &[u8], offset: usize) -> Option<FullName> {
    let first = *buf.get(offset)?;
    if first & LABEL_POINTER == LABEL_POINTER {
        let target = (u16::from_be_bytes([first, *buf.get(offset + 1)?]) & 0x3FFF) as usize;
        let target_first = *buf.get(target)?;
        if target_first & LABEL_POINTER == LABEL_POINTER {
            return None;
        }
        let mut name = decode_full_name(buf, target)?;
        name.encoded_len = 2;
        return Some(name);
    }
    if first as usize != ENCODED_NAME_LEN {
        return None;
    }
    let raw = decode_name(buf, offset + 1)?;

    let mut labels = Vec::new();
    let mut pos = offset + 1 + ENCODED_NAME_LEN;
    loop {
        let len = *buf.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len as u8 & LABEL_POINTER == LABEL_POINTER {
            return None;
        }
        let label = buf.get(pos..pos + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += len;
    }

    Some(FullName {
        raw,
        scope: if labels.is_empty() { None } else { Some(labels.join(".")) },
        encoded_len: pos - offset,
    })
}

/// Convert a TCP/IP host name to a NetBIOS name: drop the domain, uppercase.
pub fn netbios_host_name(host: &str) -> String {
    host.split('.').next().unwrap_or(host).to_uppercase()
}
