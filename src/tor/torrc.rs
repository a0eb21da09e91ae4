//! Proxy configuration (torrc) generation.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::config::{TorConfig, UpstreamProxyConfig, UpstreamProxyType};

use super::registry::{hidden_service_dir, HiddenServiceRegistry};

/// Address range the proxy hands out for automapped hostnames.
pub const VIRTUAL_ADDR_NETWORK: &str = "10.192.0.0/10";

/// Files the proxy reads and writes inside its data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorPaths {
    pub data_dir: PathBuf,
    pub torrc: PathBuf,
    pub control_port_file: PathBuf,
    pub cookie_file: PathBuf,
}

impl TorPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            torrc: data_dir.join("torrc"),
            control_port_file: data_dir.join("control.txt"),
            cookie_file: data_dir.join("control_auth_cookie"),
            data_dir,
        }
    }
}

/// Build the complete torrc text.
///
/// `bypass` is the local SOCKS bypass endpoint; when set, the proxy routes
/// its own upstream connections through it so they escape the tunnel.
pub fn build_torrc(
    tor: &TorConfig,
    paths: &TorPaths,
    registry: &dyn HiddenServiceRegistry,
    bypass: Option<SocketAddr>,
) -> String {
    let mut torrc = String::with_capacity(2048);
    let bind = if tor.open_proxy_on_all_interfaces {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };

    // Process and control channel. Network stays off until explicitly enabled.
    torrc.push_str("RunAsDaemon 0\n");
    torrc.push_str("AvoidDiskWrites 1\n");
    torrc.push_str(&format!("DataDirectory {}\n", paths.data_dir.display()));
    torrc.push_str("ControlPort auto\n");
    torrc.push_str(&format!(
        "ControlPortWriteToFile {}\n",
        paths.control_port_file.display()
    ));
    torrc.push_str("CookieAuthentication 1\n");
    torrc.push_str(&format!("CookieAuthFile {}\n", paths.cookie_file.display()));
    torrc.push_str("DisableNetwork 1\n");

    // Local listeners.
    let isolate = if tor.isolate_destination {
        " IsolateDestAddr"
    } else {
        ""
    };
    torrc.push_str(&format!("SOCKSPort {bind}:{}{isolate}\n", tor.socks_port));
    torrc.push_str("SafeSocks 0\n");
    torrc.push_str("TestSocks 0\n");
    torrc.push_str(&format!("HTTPTunnelPort {bind}:{}\n", tor.http_tunnel_port));
    torrc.push_str(&format!("DNSPort 127.0.0.1:{}\n", tor.dns_port));
    torrc.push_str(&format!("TransPort 127.0.0.1:{}\n", tor.trans_port));
    torrc.push_str(&format!("VirtualAddrNetwork {VIRTUAL_ADDR_NETWORK}\n"));
    torrc.push_str("AutomapHostsOnResolve 1\n");

    torrc.push_str(&format!(
        "ConnectionPadding {}\n",
        u8::from(tor.connection_padding)
    ));
    torrc.push_str(&format!(
        "ReducedConnectionPadding {}\n",
        u8::from(tor.reduced_connection_padding)
    ));

    append_node_selection(&mut torrc, tor);
    append_bridges(&mut torrc, tor);

    if tor.reachable_addresses && !tor.reachable_address_ports.trim().is_empty() {
        torrc.push_str(&format!(
            "ReachableAddresses {}\n",
            tor.reachable_address_ports.trim()
        ));
    }

    if let Some(proxy) = &tor.upstream_proxy {
        append_upstream_proxy(&mut torrc, proxy);
    } else if let Some(bypass) = bypass {
        torrc.push_str(&format!("Socks5Proxy {bypass}\n"));
    }

    if tor.relay.enabled && !tor.use_bridges {
        torrc.push_str(&format!("ORPort {}\n", tor.relay.port));
        torrc.push_str(&format!("Nickname {}\n", tor.relay.nickname));
        torrc.push_str("ExitPolicy reject *:*\n");
    }

    append_hidden_services(&mut torrc, &paths.data_dir, registry);

    let custom = tor.custom_torrc.trim();
    if !custom.is_empty() {
        torrc.push_str(custom);
        torrc.push('\n');
    }

    torrc
}

fn append_node_selection(torrc: &mut String, tor: &TorConfig) {
    for (key, nodes) in [
        ("EntryNodes", &tor.entry_nodes),
        ("ExitNodes", &tor.exit_nodes),
        ("ExcludeNodes", &tor.exclude_nodes),
    ] {
        if !nodes.is_empty() {
            torrc.push_str(&format!("{key} {}\n", nodes.join(",")));
        }
    }
    if tor.strict_nodes {
        torrc.push_str("StrictNodes 1\n");
    }
}

fn append_bridges(torrc: &mut String, tor: &TorConfig) {
    let bridges: Vec<&str> = tor
        .bridges
        .iter()
        .map(|b| b.trim())
        .filter(|b| !b.is_empty())
        .collect();
    if !tor.use_bridges || bridges.is_empty() {
        return;
    }

    torrc.push_str("UseBridges 1\n");
    if let Some(pt) = &tor.pluggable_transport {
        let mut transports: Vec<&str> = bridges
            .iter()
            .filter_map(|b| b.split_whitespace().next())
            .filter(|first| !first.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '['))
            .collect();
        transports.sort_unstable();
        transports.dedup();
        if !transports.is_empty() {
            torrc.push_str(&format!(
                "ClientTransportPlugin {} exec {pt}\n",
                transports.join(",")
            ));
        }
    }
    for bridge in bridges {
        torrc.push_str(&format!("Bridge {bridge}\n"));
    }
}

fn append_upstream_proxy(torrc: &mut String, proxy: &UpstreamProxyConfig) {
    let endpoint = format!("{}:{}", proxy.host, proxy.port);
    let credentials = proxy.username.as_deref().filter(|u| !u.is_empty());
    match proxy.proxy_type {
        UpstreamProxyType::Http | UpstreamProxyType::Https => {
            torrc.push_str(&format!("HTTPSProxy {endpoint}\n"));
            if let Some(user) = credentials {
                let pass = proxy.password.as_deref().unwrap_or_default();
                torrc.push_str(&format!("HTTPSProxyAuthenticator {user}:{pass}\n"));
            }
        }
        UpstreamProxyType::Socks4 => {
            torrc.push_str(&format!("Socks4Proxy {endpoint}\n"));
        }
        UpstreamProxyType::Socks5 => {
            torrc.push_str(&format!("Socks5Proxy {endpoint}\n"));
            if let Some(user) = credentials {
                torrc.push_str(&format!("Socks5ProxyUsername {user}\n"));
                let pass = proxy.password.as_deref().unwrap_or_default();
                torrc.push_str(&format!("Socks5ProxyPassword {pass}\n"));
            }
        }
    }
}

fn append_hidden_services(torrc: &mut String, data_dir: &Path, registry: &dyn HiddenServiceRegistry) {
    for hs in registry.hidden_services() {
        tracing::debug!("Adding hidden service on port: {}", hs.local_port);
        torrc.push_str(&format!(
            "HiddenServiceDir {}\n",
            hidden_service_dir(data_dir, hs.local_port).display()
        ));
        torrc.push_str(&format!(
            "HiddenServicePort {} 127.0.0.1:{}\n",
            hs.onion_port, hs.local_port
        ));
        if hs.auth_cookie {
            torrc.push_str(&format!("HiddenServiceAuthorizeClient stealth {}\n", hs.name));
        }
    }
    for cookie in registry.client_cookies() {
        torrc.push_str(&format!("HidServAuth {} {}\n", cookie.domain, cookie.cookie));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tor::registry::{ClientCookieRecord, HiddenServiceRecord};

    #[derive(Default)]
    struct FixedRegistry {
        services: Vec<HiddenServiceRecord>,
        cookies: Vec<ClientCookieRecord>,
    }

    impl HiddenServiceRegistry for FixedRegistry {
        fn hidden_services(&self) -> Vec<HiddenServiceRecord> {
            self.services.clone()
        }

        fn client_cookies(&self) -> Vec<ClientCookieRecord> {
            self.cookies.clone()
        }
    }

    fn paths() -> TorPaths {
        TorPaths::new("/var/lib/onionlink")
    }

    #[test]
    fn defaults_bind_loopback_and_disable_network() {
        let torrc = build_torrc(&TorConfig::default(), &paths(), &FixedRegistry::default(), None);
        assert!(torrc.contains("SOCKSPort 127.0.0.1:9150\n"));
        assert!(torrc.contains("HTTPTunnelPort 127.0.0.1:8218\n"));
        assert!(torrc.contains("DNSPort 127.0.0.1:5400\n"));
        assert!(torrc.contains("TransPort 127.0.0.1:9140\n"));
        assert!(torrc.contains("DisableNetwork 1\n"));
        assert!(torrc.contains("CookieAuthentication 1\n"));
        assert!(torrc.contains("ControlPortWriteToFile /var/lib/onionlink/control.txt\n"));
        assert!(torrc.contains("VirtualAddrNetwork 10.192.0.0/10\n"));
        assert!(torrc.contains("ReducedConnectionPadding 1\n"));
        assert!(!torrc.contains("0.0.0.0"));
        assert!(!torrc.contains("UseBridges"));
    }

    #[test]
    fn isolation_and_open_interfaces() {
        let tor = TorConfig {
            isolate_destination: true,
            open_proxy_on_all_interfaces: true,
            ..TorConfig::default()
        };
        let torrc = build_torrc(&tor, &paths(), &FixedRegistry::default(), None);
        assert!(torrc.contains("SOCKSPort 0.0.0.0:9150 IsolateDestAddr\n"));
        assert!(torrc.contains("HTTPTunnelPort 0.0.0.0:8218\n"));
    }

    #[test]
    fn node_selection_lines() {
        let tor = TorConfig {
            exit_nodes: vec!["{de}".into(), "{nl}".into()],
            exclude_nodes: vec!["{ru}".into()],
            strict_nodes: true,
            ..TorConfig::default()
        };
        let torrc = build_torrc(&tor, &paths(), &FixedRegistry::default(), None);
        assert!(torrc.contains("ExitNodes {de},{nl}\n"));
        assert!(torrc.contains("ExcludeNodes {ru}\n"));
        assert!(torrc.contains("StrictNodes 1\n"));
        assert!(!torrc.contains("EntryNodes"));
    }

    #[test]
    fn bridges_with_transport_plugin() {
        let tor = TorConfig {
            use_bridges: true,
            bridges: vec![
                "obfs4 192.0.2.1:443 AAAA cert=x iat-mode=0".into(),
                "192.0.2.2:9001 BBBB".into(),
                " ".into(),
            ],
            pluggable_transport: Some("/usr/bin/obfs4proxy".into()),
            ..TorConfig::default()
        };
        let torrc = build_torrc(&tor, &paths(), &FixedRegistry::default(), None);
        assert!(torrc.contains("UseBridges 1\n"));
        assert!(torrc.contains("ClientTransportPlugin obfs4 exec /usr/bin/obfs4proxy\n"));
        assert!(torrc.contains("Bridge obfs4 192.0.2.1:443 AAAA cert=x iat-mode=0\n"));
        assert!(torrc.contains("Bridge 192.0.2.2:9001 BBBB\n"));
        assert_eq!(torrc.matches("Bridge ").count(), 2);
    }

    #[test]
    fn bypass_proxy_used_without_upstream() {
        let bypass: SocketAddr = "127.0.0.1:10123".parse().unwrap();
        let torrc = build_torrc(&TorConfig::default(), &paths(), &FixedRegistry::default(), Some(bypass));
        assert!(torrc.contains("Socks5Proxy 127.0.0.1:10123\n"));
    }

    #[test]
    fn upstream_proxy_takes_precedence_over_bypass() {
        let tor = TorConfig {
            upstream_proxy: Some(UpstreamProxyConfig {
                proxy_type: UpstreamProxyType::Https,
                host: "proxy.example".into(),
                port: 3128,
                username: Some("alice".into()),
                password: Some("secret".into()),
            }),
            ..TorConfig::default()
        };
        let bypass: SocketAddr = "127.0.0.1:10123".parse().unwrap();
        let torrc = build_torrc(&tor, &paths(), &FixedRegistry::default(), Some(bypass));
        assert!(torrc.contains("HTTPSProxy proxy.example:3128\n"));
        assert!(torrc.contains("HTTPSProxyAuthenticator alice:secret\n"));
        assert!(!torrc.contains("Socks5Proxy"));
    }

    #[test]
    fn relay_mode() {
        let mut tor = TorConfig::default();
        tor.relay.enabled = true;
        let torrc = build_torrc(&tor, &paths(), &FixedRegistry::default(), None);
        assert!(torrc.contains("ORPort 9001\n"));
        assert!(torrc.contains("Nickname OnionLink\n"));
    }

    #[test]
    fn hidden_services_and_cookies() {
        let registry = FixedRegistry {
            services: vec![HiddenServiceRecord {
                name: "web".into(),
                local_port: 8080,
                onion_port: 80,
                domain: None,
                auth_cookie: true,
            }],
            cookies: vec![ClientCookieRecord {
                domain: "abc.onion".into(),
                cookie: "Zm9v".into(),
            }],
        };
        let torrc = build_torrc(&TorConfig::default(), &paths(), &registry, None);
        assert!(torrc.contains("HiddenServiceDir /var/lib/onionlink/hidden_services/hs8080\n"));
        assert!(torrc.contains("HiddenServicePort 80 127.0.0.1:8080\n"));
        assert!(torrc.contains("HiddenServiceAuthorizeClient stealth web\n"));
        assert!(torrc.contains("HidServAuth abc.onion Zm9v\n"));
    }

    #[test]
    fn custom_torrc_is_appended_last() {
        let tor = TorConfig {
            custom_torrc: "Log notice stdout\n".into(),
            ..TorConfig::default()
        };
        let torrc = build_torrc(&tor, &paths(), &FixedRegistry::default(), None);
        assert!(torrc.ends_with("Log notice stdout\n"));
    }
}
