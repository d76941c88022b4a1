//! NetBIOS over TCP/IP wire types: ports, message types, opcodes and flags.
//!
//! Reference: RFC 1001 (concepts) and RFC 1002 (detailed specifications).

pub mod codec;
pub mod name;
pub mod datagram;
pub mod packet;

/// Name service UDP port.
pub const NAME_PORT: u16 = 137;
/// Datagram service UDP port.
pub const DATAGRAM_PORT: u16 = 138;
/// Session service TCP port.
pub const SESSION_PORT: u16 = 139;

/// Size of the session service header.
pub const SESSION_HEADER_LEN: usize = 4;
/// Largest payload a session header can describe (17 bits).
pub const MAX_SESSION_PAYLOAD: usize = 0x1FFFF;

/// Session service message types.
/// RFC 1002 Section 4.3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionMessageType {
    Message = 0x00,
    Request = 0x81,
    Ack = 0x82,
    Reject = 0x83,
    Retarget = 0x84,
    KeepAlive = 0x85,
}

impl SessionMessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Message),
            0x81 => Some(Self::Request),
            0x82 => Some(Self::Ack),
            0x83 => Some(Self::Reject),
            0x84 => Some(Self::Retarget),
            0x85 => Some(Self::KeepAlive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "SessionMessage",
            Self::Request => "SessionRequest",
            Self::Ack => "SessionAck",
            Self::Reject => "SessionReject",
            Self::Retarget => "SessionRetarget",
            Self::KeepAlive => "SessionKeepAlive",
        }
    }
}

/// Name service opcodes, including the response bit (0x10).
/// RFC 1002 Section 4.2.1.1
pub mod opcode {
    pub const NAME_QUERY: u8 = 0x00;
    pub const NAME_REGISTER: u8 = 0x05;
    pub const NAME_RELEASE: u8 = 0x06;
    pub const WACK: u8 = 0x07;
    pub const REFRESH: u8 = 0x08;
    pub const NAME_REGISTER_MULTI: u8 = 0x0F;

    pub const RESP_QUERY: u8 = 0x10;
    pub const RESP_REGISTER: u8 = 0x15;
    pub const RESP_RELEASE: u8 = 0x16;

    /// Set in the 5-bit opcode field of every response.
    pub const RESPONSE: u8 = 0x10;

    pub fn as_str(op: u8) -> &'static str {
        match op {
            NAME_QUERY => "NameQuery",
            NAME_REGISTER => "NameRegister",
            NAME_RELEASE => "NameRelease",
            WACK => "WACK",
            REFRESH => "Refresh",
            NAME_REGISTER_MULTI => "NameRegisterMulti",
            RESP_QUERY => "QueryResponse",
            RESP_REGISTER => "RegisterResponse",
            RESP_RELEASE => "ReleaseResponse",
            _ => "Unknown",
        }
    }
}

/// Name service header flag bits (the 7-bit NM_FLAGS field).
pub mod flags {
    pub const BROADCAST: u8 = 0x01;
    pub const RECURSION_DESIRED: u8 = 0x08;
    pub const RECURSION_AVAILABLE: u8 = 0x10;
    pub const TRUNCATION: u8 = 0x20;
    pub const AUTHORITATIVE_ANSWER: u8 = 0x40;
}

/// Name service result codes.
pub mod rcode {
    pub const FMT_ERR: u8 = 1;
    pub const SRV_ERR: u8 = 2;
    pub const IMP_ERR: u8 = 4;
    pub const RFS_ERR: u8 = 5;
    pub const ACT_ERR: u8 = 6;
    pub const CFT_ERR: u8 = 7;
}

/// Question/resource record type and class values.
pub const NAME_TYPE_NB: u16 = 0x0020;
pub const NAME_TYPE_NBSTAT: u16 = 0x0021;
pub const NAME_CLASS_IN: u16 = 0x0001;

/// Group bit in the NB_FLAGS of a resource record.
pub const NB_FLAG_GROUP: u16 = 0x8000;
/// Name flags used in adapter status name entries.
pub const NAME_FLAG_ACTIVE: u16 = 0x0400;
pub const NAME_FLAG_GROUP: u16 = 0x8000;

/// Datagram service message types.
/// RFC 1002 Section 4.4.1
pub mod datagram_type {
    pub const DIRECT_UNIQUE: u8 = 0x10;
    pub const DIRECT_GROUP: u8 = 0x11;
    pub const BROADCAST: u8 = 0x12;
    pub const DATAGRAM_ERROR: u8 = 0x13;
    pub const DATAGRAM_QUERY: u8 = 0x14;
    pub const POSITIVE_RESP: u8 = 0x15;
    pub const NEGATIVE_RESP: u8 = 0x16;
}

/// Well-known values of the 16th name byte.
pub mod name_type {
    pub const WORKSTATION: u8 = 0x00;
    pub const MESSENGER: u8 = 0x03;
    pub const RAS_SERVER: u8 = 0x06;
    pub const DOMAIN_MASTER_BROWSER: u8 = 0x1B;
    pub const DOMAIN_CONTROLLERS: u8 = 0x1C;
    pub const MASTER_BROWSER: u8 = 0x1D;
    pub const BROWSER_ELECTION: u8 = 0x1E;
    pub const NET_DDE: u8 = 0x1F;
    pub const FILE_SERVER: u8 = 0x20;
    pub const RAS_CLIENT: u8 = 0x21;
    /// Domain names are group names registered with the workstation type.
    pub const DOMAIN: u8 = 0x00;

    pub fn as_str(t: u8) -> &'static str {
        match t {
            WORKSTATION => "WorkStation",
            MESSENGER => "Messenger",
            RAS_SERVER => "RASServer",
            DOMAIN_MASTER_BROWSER => "DomainMasterBrowser",
            DOMAIN_CONTROLLERS => "DomainControllers",
            MASTER_BROWSER => "MasterBrowser",
            BROWSER_ELECTION => "BrowserElection",
            NET_DDE => "NetDDE",
            FILE_SERVER => "FileServer",
            RAS_CLIENT => "RASClient",
            _ => "Unknown",
        }
    }
}

/// Node type of the responding host, encoded into adapter status name flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    #[default]
    B,
    P,
    M,
    H,
}

impl NodeType {
    /// ONT bits of the NAME_FLAGS field.
    pub fn flag_bits(&self) -> u16 {
        match self {
            Self::B => 0x0000,
            Self::P => 0x2000,
            Self::M => 0x4000,
            Self::H => 0x6000,
        }
    }
}

/// Render bytes as a hex dump, 16 bytes per line, for trace logging.
pub fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            format!("{:04x}  {:<48} {}", i * 16, hex.join(" "), ascii)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_message_types() {
        assert_eq!(SessionMessageType::from_u8(0x85), Some(SessionMessageType::KeepAlive));
        assert_eq!(SessionMessageType::from_u8(0x82), Some(SessionMessageType::Ack));
        assert_eq!(SessionMessageType::from_u8(0x42), None);
        assert_eq!(SessionMessageType::Request as u8, 0x81);
    }

    #[test]
    fn test_response_opcodes_carry_response_bit() {
        for op in [opcode::RESP_QUERY, opcode::RESP_REGISTER, opcode::RESP_RELEASE] {
            assert_ne!(op & opcode::RESPONSE, 0);
        }
        assert_eq!(opcode::NAME_QUERY & opcode::RESPONSE, 0);
    }

    #[test]
    fn test_hex_dump_layout() {
        let dump = hex_dump(b"0123456789abcdefXY");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000  30 31"));
        assert!(lines[1].starts_with("0010  58 59"));
    }
}
