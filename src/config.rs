use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::warn;

use crate::protocol::{NodeType, DATAGRAM_PORT, NAME_PORT, SESSION_PORT};
use crate::session::CallerTemplate;

/// Shortest name lookup timeout we accept.
pub const MIN_LOOKUP_TIMEOUT_MS: u64 = 250;

/// How to turn a host name into an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookupType {
    DnsOnly,
    WinsOnly,
    #[default]
    WinsAndDns,
}

impl LookupType {
    pub fn uses_wins(&self) -> bool {
        !matches!(self, LookupType::DnsOnly)
    }

    pub fn uses_dns(&self) -> bool {
        !matches!(self, LookupType::WinsOnly)
    }
}

/// Client and name server configuration loaded from a TOML file.
/// Every field has a default, so an empty file is valid.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// WINS server; when unset, name queries are broadcast
    pub wins_server: Option<Ipv4Addr>,
    pub lookup_type: LookupType,
    pub lookup_timeout_ms: u64,
    /// Default read/write timeout for sessions
    pub session_timeout_ms: u64,
    /// Receive timeout for adapter status queries
    pub status_timeout_ms: u64,
    /// Caller name template, e.g. "_##" (see `CallerTemplate`)
    pub caller_template: String,
    /// Value substituted for '@' in the caller template
    pub instance_id: u32,
    /// Call "*SMBSERVER" instead of the host name for file servers
    pub wildcard_file_server: bool,
    /// Local host short name; defaults to the HOSTNAME/COMPUTERNAME environment
    pub local_name: Option<String>,
    pub local_address: Option<Ipv4Addr>,
    /// Overrides the classful broadcast address
    pub broadcast_address: Option<Ipv4Addr>,
    /// NetBIOS scope appended to names we build
    pub scope: Option<String>,
    pub name_port: u16,
    pub datagram_port: u16,
    pub session_port: u16,
    pub server: Option<NameServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            wins_server: None,
            lookup_type: LookupType::default(),
            lookup_timeout_ms: 500,
            session_timeout_ms: 30_000,
            status_timeout_ms: 5_000,
            caller_template: "_##".to_string(),
            instance_id: 0,
            wildcard_file_server: true,
            local_name: None,
            local_address: None,
            broadcast_address: None,
            scope: None,
            name_port: NAME_PORT,
            datagram_port: DATAGRAM_PORT,
            session_port: SESSION_PORT,
            server: None,
        }
    }
}

impl Config {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    /// Scope to attach to names, if one is set.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref().filter(|s| !s.is_empty())
    }

    /// Short name of this host, uppercased with any DNS domain removed.
    pub fn local_host_name(&self) -> String {
        let host = self
            .local_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| std::env::var("COMPUTERNAME").ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "LOCALHOST".to_string());
        crate::protocol::codec::netbios_host_name(&host)
    }

    /// Check settings that cannot be expressed by serde alone. Bad values
    /// are fixed up with a warning where a default makes sense.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.lookup_timeout_ms < MIN_LOOKUP_TIMEOUT_MS {
            warn!(
                requested = self.lookup_timeout_ms,
                "lookup timeout below {} ms ignored", MIN_LOOKUP_TIMEOUT_MS
            );
            self.lookup_timeout_ms = Config::default().lookup_timeout_ms;
        }
        CallerTemplate::parse(&self.caller_template)?;
        if let Some(server) = &self.server {
            if server.server_name.is_empty() {
                anyhow::bail!("Name server requires a server_name");
            }
        }
        Ok(())
    }
}

/// Settings for the name service responder.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NameServerConfig {
    /// NetBIOS name of this server, registered as FileServer and WorkStation
    pub server_name: String,
    /// Domain or workgroup, registered as a group name
    pub domain_name: Option<String>,
    pub bind_address: Option<Ipv4Addr>,
    /// UDP port to listen on (default 137)
    pub port: u16,
    /// Addresses to advertise; defaults to the local address
    pub addresses: Vec<Ipv4Addr>,
    pub node_type: NodeType,
    pub ttl: u32,
    /// Broadcast registration attempts
    pub add_name_retries: u32,
    pub add_name_interval_ms: u64,
    /// Wait for a WINS reply to a registration
    pub wins_interval_ms: u64,
    pub refresh_interval_secs: u64,
}

impl Default for NameServerConfig {
    fn default() -> Self {
        NameServerConfig {
            server_name: String::new(),
            domain_name: None,
            bind_address: None,
            port: NAME_PORT,
            addresses: Vec::new(),
            node_type: NodeType::default(),
            ttl: 10_800,
            add_name_retries: 5,
            add_name_interval_ms: 2_000,
            wins_interval_ms: 250,
            refresh_interval_secs: 180,
        }
    }
}

/// Load and parse the TOML configuration file.
pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
    let mut config: Config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path, e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {}", path, e))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            wins_server = "10.0.0.2"
            lookup_type = "wins-only"
            lookup_timeout_ms = 800
            caller_template = "@@_##"
            instance_id = 7
            [server]
            server_name = "files"
            domain_name = "corp"
            port = 1137
            addresses = ["10.0.0.5"]
            node_type = "h"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.wins_server, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(config.lookup_type, LookupType::WinsOnly);
        assert!(config.lookup_type.uses_wins());
        assert!(!config.lookup_type.uses_dns());
        assert_eq!(config.lookup_timeout(), Duration::from_millis(800));
        assert_eq!(config.session_port, SESSION_PORT);

        let server = config.server.unwrap();
        assert_eq!(server.port, 1137);
        assert_eq!(server.node_type, NodeType::H);
        assert_eq!(server.ttl, 10_800);
        assert_eq!(server.add_name_retries, 5);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.lookup_type, LookupType::WinsAndDns);
        assert_eq!(config.lookup_timeout_ms, 500);
        assert_eq!(config.caller_template, "_##");
        assert!(config.wildcard_file_server);
        assert_eq!(config.name_port, 137);
        assert!(config.server.is_none());
    }

    #[test]
    fn test_short_lookup_timeout_ignored() {
        let mut config = Config { lookup_timeout_ms: 100, ..Config::default() };
        config.validate().unwrap();
        assert_eq!(config.lookup_timeout_ms, 500);
    }

    #[test]
    fn test_local_host_name_strips_domain() {
        let config = Config { local_name: Some("desk42.corp.local".into()), ..Config::default() };
        assert_eq!(config.local_host_name(), "DESK42");
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "session_timeout_ms = 1000\nscope = \"lan\"").unwrap();
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.session_timeout(), Duration::from_secs(1));
        assert_eq!(config.scope(), Some("lan"));
    }

    #[test]
    fn test_load_config_rejects_bad_template() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "caller_template = \"NOHASH\"").unwrap();
        let err = load_config(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/nonexistent/nbt.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
