//! Configuration schema.
//!
//! Every section has serde defaults so a partial (or empty) TOML file is a
//! valid configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const SOCKS_PROXY_PORT_DEFAULT: u16 = 9150;
pub const HTTP_PROXY_PORT_DEFAULT: u16 = 8218;
pub const TOR_DNS_PORT_DEFAULT: u16 = 5400;
pub const TOR_TRANSPROXY_PORT_DEFAULT: u16 = 9140;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tor: TorConfig,
    #[serde(default)]
    pub vpn: VpnConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub hidden_services: Vec<HiddenServiceConfig>,
    #[serde(default)]
    pub client_cookies: Vec<ClientCookieConfig>,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorConfig {
    /// Binary name (resolved via `PATH`) or absolute path.
    #[serde(default = "default_tor_binary")]
    pub binary: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_http_tunnel_port")]
    pub http_tunnel_port: u16,
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_trans_port")]
    pub trans_port: u16,
    /// Bind SOCKS/HTTP ports on all interfaces instead of loopback.
    #[serde(default)]
    pub open_proxy_on_all_interfaces: bool,
    #[serde(default)]
    pub exit_nodes: Vec<String>,
    #[serde(default)]
    pub entry_nodes: Vec<String>,
    #[serde(default)]
    pub exclude_nodes: Vec<String>,
    #[serde(default)]
    pub strict_nodes: bool,
    #[serde(default)]
    pub use_bridges: bool,
    #[serde(default)]
    pub bridges: Vec<String>,
    /// Pluggable transport client binary (e.g. obfs4proxy).
    #[serde(default)]
    pub pluggable_transport: Option<String>,
    #[serde(default)]
    pub isolate_destination: bool,
    #[serde(default)]
    pub connection_padding: bool,
    #[serde(default = "default_true")]
    pub reduced_connection_padding: bool,
    #[serde(default)]
    pub reachable_addresses: bool,
    #[serde(default = "default_reachable_ports")]
    pub reachable_address_ports: String,
    #[serde(default)]
    pub upstream_proxy: Option<UpstreamProxyConfig>,
    #[serde(default)]
    pub relay: RelayConfig,
    /// Appended verbatim to the generated torrc.
    #[serde(default)]
    pub custom_torrc: String,
    #[serde(default = "default_bootstrap_timeout_secs")]
    pub bootstrap_timeout_secs: u64,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            binary: default_tor_binary(),
            data_dir: default_data_dir(),
            socks_port: default_socks_port(),
            http_tunnel_port: default_http_tunnel_port(),
            dns_port: default_dns_port(),
            trans_port: default_trans_port(),
            open_proxy_on_all_interfaces: false,
            exit_nodes: Vec::new(),
            entry_nodes: Vec::new(),
            exclude_nodes: Vec::new(),
            strict_nodes: false,
            use_bridges: false,
            bridges: Vec::new(),
            pluggable_transport: None,
            isolate_destination: false,
            connection_padding: false,
            reduced_connection_padding: true,
            reachable_addresses: false,
            reachable_address_ports: default_reachable_ports(),
            upstream_proxy: None,
            relay: RelayConfig::default(),
            custom_torrc: String::new(),
            bootstrap_timeout_secs: default_bootstrap_timeout_secs(),
        }
    }
}

impl TorConfig {
    /// Data directory with `~` expanded.
    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProxyType {
    Http,
    Https,
    Socks4,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    #[serde(rename = "type")]
    pub proxy_type: UpstreamProxyType,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    #[serde(default = "default_relay_nickname")]
    pub nickname: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_relay_port(),
            nickname: default_relay_nickname(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Start the tunnel whenever the proxy comes up.
    #[serde(default)]
    pub enabled: bool,
    /// Route only selected apps (where the platform supports it).
    #[serde(default = "default_true")]
    pub per_app_routing: bool,
    /// Package ids selected for tunnelling.
    #[serde(default)]
    pub torified_apps: Vec<String>,
    /// Package id of this application; excluded from the tunnel by default.
    #[serde(default = "default_own_package")]
    pub own_package: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// Interface name template; `%d` is filled by the kernel.
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    #[serde(default = "default_restart_grace_ms")]
    pub restart_grace_ms: u64,
    #[serde(default = "default_tun2socks_binary")]
    pub tun2socks_binary: String,
    /// Run the SOCKS bypass proxy even where per-app routing is available.
    #[serde(default)]
    pub socks_bypass: bool,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            per_app_routing: true,
            torified_apps: Vec::new(),
            own_package: default_own_package(),
            mtu: default_mtu(),
            session_name: default_session_name(),
            interface_name: default_interface_name(),
            restart_grace_ms: default_restart_grace_ms(),
            tun2socks_binary: default_tun2socks_binary(),
            socks_bypass: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_binary")]
    pub binary: String,
    /// Where the relay listens; also the bridging engine's DNS gateway.
    #[serde(default = "default_dns_listen")]
    pub listen: SocketAddr,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            binary: default_dns_binary(),
            listen: default_dns_listen(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Emit per-circuit chatter at debug level.
    #[serde(default)]
    pub debug_logging: bool,
    /// Keep a table of built circuits for display.
    #[serde(default)]
    pub expanded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_true")]
    pub disable_on_connectivity_loss: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            disable_on_connectivity_loss: true,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenServiceConfig {
    pub name: String,
    pub local_port: u16,
    pub onion_port: u16,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub auth_cookie: bool,
    #[serde(default)]
    pub auth_cookie_value: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCookieConfig {
    pub domain: String,
    pub cookie: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Installed-application record for hosts without a package registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub package_id: String,
    pub uid: u32,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub uses_network: bool,
}

fn default_true() -> bool {
    true
}

fn default_tor_binary() -> String {
    "tor".into()
}

fn default_data_dir() -> String {
    "~/.onionlink/tor".into()
}

fn default_socks_port() -> u16 {
    SOCKS_PROXY_PORT_DEFAULT
}

fn default_http_tunnel_port() -> u16 {
    HTTP_PROXY_PORT_DEFAULT
}

fn default_dns_port() -> u16 {
    TOR_DNS_PORT_DEFAULT
}

fn default_trans_port() -> u16 {
    TOR_TRANSPROXY_PORT_DEFAULT
}

fn default_reachable_ports() -> String {
    "*:80,*:443".into()
}

fn default_bootstrap_timeout_secs() -> u64 {
    120
}

fn default_relay_port() -> u16 {
    9001
}

fn default_relay_nickname() -> String {
    "OnionLink".into()
}

fn default_own_package() -> String {
    "onionlink".into()
}

fn default_mtu() -> u16 {
    1500
}

fn default_session_name() -> String {
    "OnionLinkVPN".into()
}

fn default_interface_name() -> String {
    "olink%d".into()
}

fn default_restart_grace_ms() -> u64 {
    3000
}

fn default_tun2socks_binary() -> String {
    "tun2socks".into()
}

fn default_dns_binary() -> String {
    "pdnsd".into()
}

fn default_dns_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8091))
}

fn default_poll_interval_secs() -> u64 {
    5
}
