//! Per-app routing: which applications go through the tunnel.

use std::collections::HashSet;

use anyhow::Result;

use crate::config::SharedConfig;

/// An installed application as reported by the package registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledApp {
    pub package_id: String,
    pub uid: u32,
    pub display_name: String,
    pub uses_network_permission: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRoutingEntry {
    pub package_id: String,
    pub uid: u32,
    pub display_name: String,
    pub uses_network_permission: bool,
    /// Marked for tunnelling by the user.
    pub user_selected: bool,
}

/// OS package registry.
pub trait PackageRegistry: Send + Sync {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>>;

    /// Uid a package runs as.
    fn uid_of(&self, package_id: &str) -> Result<Option<u32>> {
        Ok(self
            .installed_apps()?
            .into_iter()
            .find(|app| app.package_id == package_id)
            .map(|app| app.uid))
    }
}

/// Registry for hosts without one: the `[[apps]]` config section.
#[derive(Clone)]
pub struct ConfigPackageRegistry {
    config: SharedConfig,
}

impl ConfigPackageRegistry {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }
}

impl PackageRegistry for ConfigPackageRegistry {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        Ok(self
            .config
            .read()
            .apps
            .iter()
            .map(|app| InstalledApp {
                package_id: app.package_id.clone(),
                uid: app.uid,
                display_name: app
                    .display_name
                    .clone()
                    .unwrap_or_else(|| app.package_id.clone()),
                uses_network_permission: app.uses_network,
            })
            .collect())
    }
}

/// Network-using apps, marked with the user's selection, sorted by name.
pub fn enumerate_apps(registry: &dyn PackageRegistry, torified: &[String]) -> Result<Vec<AppRoutingEntry>> {
    let selected: HashSet<&str> = torified.iter().map(String::as_str).collect();
    let mut entries: Vec<AppRoutingEntry> = registry
        .installed_apps()?
        .into_iter()
        .filter(|app| app.uses_network_permission)
        .map(|app| AppRoutingEntry {
            user_selected: selected.contains(app.package_id.as_str()),
            package_id: app.package_id,
            uid: app.uid,
            display_name: app.display_name,
            uses_network_permission: app.uses_network_permission,
        })
        .collect();
    entries.sort_by_key(|e| e.display_name.to_lowercase());
    Ok(entries)
}

/// Allow/deny lists for the interface builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppRoutingPlan {
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
}

/// Allow-list the selected apps (never this application itself); with no
/// selection, tunnel everything except this application.
pub fn plan_app_routing(entries: &[AppRoutingEntry], own_package: &str) -> AppRoutingPlan {
    let allowed: Vec<String> = entries
        .iter()
        .filter(|e| e.user_selected && e.package_id != own_package)
        .map(|e| e.package_id.clone())
        .collect();
    if allowed.is_empty() {
        AppRoutingPlan {
            allowed,
            disallowed: vec![own_package.to_string()],
        }
    } else {
        AppRoutingPlan {
            allowed,
            disallowed: Vec::new(),
        }
    }
}
