//! Resolved NetBIOS names and name lists.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::protocol::codec::{self, NAME_LEN};

/// TTL applied to registrations when none has been set (8 hours).
pub const DEFAULT_TTL: u32 = 28_800;

/// A NetBIOS name with its owning addresses.
///
/// Identity is the name, the type byte and the local flag. Addresses, TTL and
/// expiry are state attached to the name and do not take part in equality.
#[derive(Debug, Clone)]
pub struct NetbiosName {
    name: String,
    name_type: u8,
    scope: Option<String>,
    group: bool,
    local: bool,
    addresses: Vec<Ipv4Addr>,
    ttl: u32,
    expiry: Option<Instant>,
}

impl NetbiosName {
    /// Create a name. The name is uppercased and truncated to 15 characters;
    /// trailing spaces are dropped except on the browser election name.
    pub fn new(name: &str, name_type: u8, group: bool) -> Self {
        let (name, _) = codec::split_name(&codec::pad_name(name, name_type));
        NetbiosName {
            name,
            name_type,
            scope: None,
            group,
            local: false,
            addresses: Vec::new(),
            ttl: 0,
            expiry: None,
        }
    }

    pub fn with_addresses(name: &str, name_type: u8, group: bool, addresses: Vec<Ipv4Addr>) -> Self {
        let mut nb = Self::new(name, name_type, group);
        nb.addresses = addresses;
        nb
    }

    /// Build a name from its raw 16-byte wire form.
    pub fn from_raw(raw: &[u8; NAME_LEN], group: bool) -> Self {
        let (name, name_type) = codec::split_name(raw);
        NetbiosName {
            name,
            name_type,
            scope: None,
            group,
            local: false,
            addresses: Vec::new(),
            ttl: 0,
            expiry: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_type(&self) -> u8 {
        self.name_type
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn set_scope(&mut self, scope: Option<String>) {
        self.scope = scope.filter(|s| !s.is_empty());
    }

    pub fn is_group(&self) -> bool {
        self.group
    }

    pub fn set_group(&mut self, group: bool) {
        self.group = group;
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn set_local(&mut self, local: bool) {
        self.local = local;
    }

    /// Raw 16-byte form: padded name plus type byte.
    pub fn raw(&self) -> [u8; NAME_LEN] {
        codec::pad_name(&self.name, self.name_type)
    }

    /// First-level encoded form (32 bytes).
    pub fn encoded(&self) -> [u8; codec::ENCODED_NAME_LEN] {
        codec::encode_raw(&self.raw())
    }

    /// Second-level encoded form including length byte, scope and terminator.
    pub fn full_name(&self) -> Vec<u8> {
        codec::encode_full_name(&self.name, self.name_type, self.scope())
    }

    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    pub fn number_of_addresses(&self) -> usize {
        self.addresses.len()
    }

    pub fn address(&self, idx: usize) -> Option<Ipv4Addr> {
        self.addresses.get(idx).copied()
    }

    pub fn address_string(&self, idx: usize) -> Option<String> {
        self.address(idx).map(|a| a.to_string())
    }

    pub fn has_address(&self, addr: Ipv4Addr) -> bool {
        self.addresses.contains(&addr)
    }

    /// Append an owning address; duplicates are ignored.
    pub fn add_address(&mut self, addr: Ipv4Addr) {
        if !self.has_address(addr) {
            self.addresses.push(addr);
        }
    }

    pub fn remove_address(&mut self, addr: Ipv4Addr) -> bool {
        let before = self.addresses.len();
        self.addresses.retain(|a| *a != addr);
        before != self.addresses.len()
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: u32) {
        self.ttl = ttl;
    }

    /// TTL to advertise: the set value, or [`DEFAULT_TTL`] when unset.
    pub fn effective_ttl(&self) -> u32 {
        if self.ttl == 0 { DEFAULT_TTL } else { self.ttl }
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    pub fn set_expiry(&mut self, expiry: Instant) {
        self.expiry = Some(expiry);
    }

    /// Push the expiry to `now + effective TTL`.
    pub fn renew(&mut self, now: Instant) {
        self.expiry = Some(now + Duration::from_secs(self.effective_ttl() as u64));
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry.map_or(false, |e| e <= now)
    }

    /// Pick the owning address sharing the longest run of leading octets with
    /// any of the local addresses. Ties keep the earlier address; with no
    /// common prefix at all the first address is returned.
    pub fn best_match_address(&self, local: &[Ipv4Addr]) -> Option<Ipv4Addr> {
        let mut best: Option<(usize, Ipv4Addr)> = None;
        for addr in &self.addresses {
            let score = local
                .iter()
                .map(|l| common_prefix_octets(addr, l))
                .max()
                .unwrap_or(0);
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, *addr));
            }
        }
        best.map(|(_, addr)| addr)
    }
}

fn common_prefix_octets(a: &Ipv4Addr, b: &Ipv4Addr) -> usize {
    a.octets()
        .iter()
        .zip(b.octets().iter())
        .take_while(|(x, y)| x == y)
        .count()
}

impl PartialEq for NetbiosName {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.name_type == other.name_type && self.local == other.local
    }
}

impl Eq for NetbiosName {}

impl Hash for NetbiosName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.name_type.hash(state);
        self.local.hash(state);
    }
}

impl fmt::Display for NetbiosName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let printable: String = self
            .name
            .chars()
            .map(|c| if c.is_control() { '.' } else { c })
            .collect();
        write!(f, "{}<{:02X}>", printable, self.name_type)?;
        if self.group {
            write!(f, " (group)")?;
        }
        if let Some(scope) = &self.scope {
            write!(f, ".{}", scope)?;
        }
        Ok(())
    }
}

/// Ordered list of names; insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NameList {
    names: Vec<NetbiosName>,
}

impl NameList {
    pub fn new() -> Self {
        NameList { names: Vec::new() }
    }

    pub fn add(&mut self, name: NetbiosName) {
        self.names.push(name);
    }

    pub fn get(&self, idx: usize) -> Option<&NetbiosName> {
        self.names.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut NetbiosName> {
        self.names.get_mut(idx)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NetbiosName> {
        self.names.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, NetbiosName> {
        self.names.iter_mut()
    }

    pub fn contains(&self, name: &NetbiosName) -> bool {
        self.names.contains(name)
    }

    /// First entry with the given name, type and group flag.
    pub fn find_name(&self, name: &str, name_type: u8, group: bool) -> Option<&NetbiosName> {
        let name = NetbiosName::new(name, name_type, group);
        self.names.iter().find(|n| {
            n.name == name.name && n.name_type == name_type && n.group == group
        })
    }

    /// All entries with the given name, of any type.
    pub fn find_names(&self, name: &str) -> NameList {
        let wanted = NetbiosName::new(name, 0, false).name;
        self.names.iter().filter(|n| n.name == wanted).cloned().collect()
    }

    /// All entries of the given type and group flag.
    pub fn find_names_of_type(&self, name_type: u8, group: bool) -> NameList {
        self.names
            .iter()
            .filter(|n| n.name_type == name_type && n.group == group)
            .cloned()
            .collect()
    }

    /// All entries matching name, type and group flag.
    pub fn find_names_matching(&self, name: &str, name_type: u8, group: bool) -> NameList {
        let wanted = NetbiosName::new(name, name_type, group).name;
        self.names
            .iter()
            .filter(|n| n.name == wanted && n.name_type == name_type && n.group == group)
            .cloned()
            .collect()
    }

    /// Remove the first entry equal to `name`, returning it.
    pub fn remove(&mut self, name: &NetbiosName) -> Option<NetbiosName> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(self.names.remove(idx))
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}

impl FromIterator<NetbiosName> for NameList {
    fn from_iter<I: IntoIterator<Item = NetbiosName>>(iter: I) -> Self {
        NameList { names: iter.into_iter().collect() }
    }
}

impl IntoIterator for NameList {
    type Item = NetbiosName;
    type IntoIter = std::vec::IntoIter<NetbiosName>;

    fn into_iter(self) -> Self::IntoIter {
        self.names.into_iter()
    }
}

impl<'a> IntoIterator for &'a NameList {
    type Item = &'a NetbiosName;
    type IntoIter = std::slice::Iter<'a, NetbiosName>;

    fn into_iter(self) -> Self::IntoIter {
        self.names.iter()
    }
}
