//! Hidden-service and client-cookie registry.
//!
//! Read-only: the records come from the `[[hidden_services]]` and
//! `[[client_cookies]]` config sections, and are only consumed while
//! building the proxy configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::SharedConfig;

/// An onion service published by the local proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenServiceRecord {
    pub name: String,
    pub local_port: u16,
    pub onion_port: u16,
    pub domain: Option<String>,
    /// Publish with stealth client authorization.
    pub auth_cookie: bool,
}

/// Client authorization for someone else's stealth onion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCookieRecord {
    pub domain: String,
    pub cookie: String,
}

pub trait HiddenServiceRegistry: Send + Sync {
    /// Enabled hidden services.
    fn hidden_services(&self) -> Vec<HiddenServiceRecord>;

    /// Enabled client cookies.
    fn client_cookies(&self) -> Vec<ClientCookieRecord>;
}

/// Registry backed by the live configuration.
#[derive(Clone)]
pub struct ConfigRegistry {
    config: SharedConfig,
}

impl ConfigRegistry {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }
}

impl HiddenServiceRegistry for ConfigRegistry {
    fn hidden_services(&self) -> Vec<HiddenServiceRecord> {
        self.config
            .read()
            .hidden_services
            .iter()
            .filter(|hs| hs.enabled)
            .map(|hs| HiddenServiceRecord {
                name: hs.name.clone(),
                local_port: hs.local_port,
                onion_port: hs.onion_port,
                domain: hs.domain.clone(),
                auth_cookie: hs.auth_cookie,
            })
            .collect()
    }

    fn client_cookies(&self) -> Vec<ClientCookieRecord> {
        self.config
            .read()
            .client_cookies
            .iter()
            .filter(|c| c.enabled)
            .map(|c| ClientCookieRecord {
                domain: c.domain.clone(),
                cookie: c.cookie.clone(),
            })
            .collect()
    }
}

/// Directory the proxy keeps a hidden service's keys and hostname in.
pub fn hidden_service_dir(data_dir: &Path, local_port: u16) -> PathBuf {
    data_dir.join("hidden_services").join(format!("hs{local_port}"))
}

/// Onion address (and stealth cookie, if any) published for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedOnion {
    pub local_port: u16,
    pub hostname: String,
    pub cookie: Option<String>,
}

/// Read the `hostname` file the proxy writes once a service is published.
///
/// With stealth authorization the file reads `<host>.onion <cookie> # ...`.
pub fn read_published_onion(
    data_dir: &Path,
    record: &HiddenServiceRecord,
) -> Result<Option<PublishedOnion>> {
    let path = hidden_service_dir(data_dir, record.local_port).join("hostname");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let mut parts = content.split_whitespace();
    let Some(hostname) = parts.next() else {
        return Ok(None);
    };
    let cookie = if record.auth_cookie {
        parts.next().map(str::to_string)
    } else {
        None
    };
    Ok(Some(PublishedOnion {
        local_port: record.local_port,
        hostname: hostname.to_string(),
        cookie,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientCookieConfig, Config, HiddenServiceConfig};
    use tempfile::TempDir;

    fn service(name: &str, port: u16, enabled: bool, auth_cookie: bool) -> HiddenServiceConfig {
        HiddenServiceConfig {
            name: name.into(),
            local_port: port,
            onion_port: 80,
            domain: None,
            auth_cookie,
            auth_cookie_value: None,
            enabled,
        }
    }

    #[test]
    fn only_enabled_records_are_listed() {
        let mut config = Config::default();
        config.hidden_services = vec![service("web", 8080, true, false), service("old", 8081, false, false)];
        config.client_cookies = vec![
            ClientCookieConfig {
                domain: "a.onion".into(),
                cookie: "c1".into(),
                enabled: true,
            },
            ClientCookieConfig {
                domain: "b.onion".into(),
                cookie: "c2".into(),
                enabled: false,
            },
        ];
        let registry = ConfigRegistry::new(config.into_shared());
        let services = registry.hidden_services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].local_port, 8080);
        let cookies = registry.client_cookies();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].domain, "a.onion");
    }

    #[test]
    fn registry_sees_config_updates() {
        let shared = Config::default().into_shared();
        let registry = ConfigRegistry::new(shared.clone());
        assert!(registry.hidden_services().is_empty());
        shared.write().hidden_services.push(service("web", 8080, true, false));
        assert_eq!(registry.hidden_services().len(), 1);
    }

    #[test]
    fn published_hostname_with_cookie() {
        let tmp = TempDir::new().unwrap();
        let record = HiddenServiceRecord {
            name: "web".into(),
            local_port: 8080,
            onion_port: 80,
            domain: None,
            auth_cookie: true,
        };
        let dir = hidden_service_dir(tmp.path(), 8080);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("hostname"), "abc.onion Zm9vYmFy # client: web\n").unwrap();

        let onion = read_published_onion(tmp.path(), &record).unwrap().unwrap();
        assert_eq!(onion.hostname, "abc.onion");
        assert_eq!(onion.cookie.as_deref(), Some("Zm9vYmFy"));
    }

    #[test]
    fn unpublished_service_is_none() {
        let tmp = TempDir::new().unwrap();
        let record = HiddenServiceRecord {
            name: "web".into(),
            local_port: 9999,
            onion_port: 80,
            domain: None,
            auth_cookie: false,
        };
        assert!(read_published_onion(tmp.path(), &record).unwrap().is_none());
    }
}
