//! Linux virtual interface provider.
//!
//! Opens `/dev/net/tun`, configures the device with `ip`, and routes traffic
//! into it through a dedicated routing table. Per-app routing maps package
//! uids to `ip rule ... uidrange` entries.
//!
//! Consecutive interfaces alternate between two table/priority slots so a
//! replacement can be fully set up while the previous one still routes.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::apps::PackageRegistry;
use super::interface::{InterfaceHandle, InterfaceSpec, TunDevice, TunProvider};

const TUN_DEVICE: &str = "/dev/net/tun";

/// `_IOW('T', 202, int)`
const TUNSETIFF: u64 = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// First routing table used for the tunnel; the second slot is `+ 1`.
const ROUTE_TABLE_BASE: u32 = 7100;

/// Rule priority of the first slot; the second slot is `+ 10`.
const RULE_PREF_BASE: u32 = 7100;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct LinuxTunProvider {
    name_template: String,
    packages: Arc<dyn PackageRegistry>,
    generation: AtomicU32,
}

impl LinuxTunProvider {
    /// `name_template` may contain `%d` for the kernel to fill in.
    pub fn new(name_template: impl Into<String>, packages: Arc<dyn PackageRegistry>) -> Self {
        Self {
            name_template: name_template.into(),
            packages,
            generation: AtomicU32::new(0),
        }
    }

    fn open_tun(&self) -> Result<(File, String)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .with_context(|| format!("failed to open {TUN_DEVICE}"))?;

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        let template = self.name_template.as_bytes();
        if template.len() >= libc::IFNAMSIZ {
            bail!("interface name '{}' is too long", self.name_template);
        }
        for (dst, src) in req.name.iter_mut().zip(template) {
            *dst = *src as libc::c_char;
        }

        // SAFETY: `req` is a properly sized, initialised ifreq and the fd is open.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error()).context("TUNSETIFF failed");
        }

        let name: String = req
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect();
        Ok((file, name))
    }

    fn uids_for(&self, packages: &[String]) -> Result<Vec<u32>> {
        let mut uids = Vec::with_capacity(packages.len());
        for package in packages {
            match self.packages.uid_of(package)? {
                Some(uid) => uids.push(uid),
                None => warn!("Unknown package {package}, not routed"),
            }
        }
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }
}

async fn ip(args: &[String]) -> Result<()> {
    debug!("ip {}", args.join(" "));
    let output = tokio::process::Command::new("ip")
        .args(args)
        .output()
        .await
        .context("failed to run ip")?;
    if !output.status.success() {
        bail!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// A configured tun device and the rules pointing at it.
struct LinuxTunDevice {
    name: String,
    file: Option<File>,
    rule_prefs: Vec<u32>,
}

impl TunDevice for LinuxTunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> Option<i32> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    fn close(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for pref in self.rule_prefs.drain(..) {
            let status = std::process::Command::new("ip")
                .args(["rule", "del", "pref", &pref.to_string()])
                .status();
            match status {
                Ok(s) if s.success() => {}
                Ok(s) => failures.push(format!("ip rule del pref {pref}: {s}")),
                Err(e) => failures.push(format!("ip rule del pref {pref}: {e}")),
            }
        }
        // Closing the fd removes a non-persistent tun device and its routes.
        self.file = None;
        if failures.is_empty() {
            Ok(())
        } else {
            bail!("{}", failures.join("; "))
        }
    }
}

#[async_trait]
impl TunProvider for LinuxTunProvider {
    fn supports_per_app_routing(&self) -> bool {
        true
    }

    async fn establish(&self, spec: &InterfaceSpec) -> Result<InterfaceHandle> {
        let slot = self.generation.fetch_add(1, Ordering::SeqCst) % 2;
        let table = (ROUTE_TABLE_BASE + slot).to_string();
        let base_pref = RULE_PREF_BASE + slot * 10;

        let (file, name) = self.open_tun()?;
        let mut device = LinuxTunDevice {
            name: name.clone(),
            file: Some(file),
            rule_prefs: Vec::new(),
        };

        let result: Result<()> = async {
            ip(&args(&["link", "set", "dev", &name, "mtu", &spec.mtu.to_string()])).await?;
            for (addr, prefix) in &spec.addresses {
                ip(&args(&["addr", "add", &format!("{addr}/{prefix}"), "dev", &name])).await?;
            }
            ip(&args(&["link", "set", "dev", &name, "up"])).await?;
            for (addr, prefix) in &spec.routes {
                ip(&args(&[
                    "route",
                    "replace",
                    &format!("{addr}/{prefix}"),
                    "dev",
                    &name,
                    "table",
                    &table,
                ]))
                .await?;
            }

            let mut pref = base_pref;
            if spec.allowed_applications.is_empty() {
                // Excluded uids keep the main table; everything else uses ours.
                for uid in self.uids_for(&spec.disallowed_applications)? {
                    let range = format!("{uid}-{uid}");
                    ip(&args(&["rule", "add", "pref", &pref.to_string(), "uidrange", &range, "lookup", "main"]))
                        .await?;
                    device.rule_prefs.push(pref);
                    pref += 1;
                }
                ip(&args(&["rule", "add", "pref", &pref.to_string(), "lookup", &table])).await?;
                device.rule_prefs.push(pref);
            } else {
                for uid in self.uids_for(&spec.allowed_applications)? {
                    let range = format!("{uid}-{uid}");
                    ip(&args(&["rule", "add", "pref", &pref.to_string(), "uidrange", &range, "lookup", &table]))
                        .await?;
                    device.rule_prefs.push(pref);
                    pref += 1;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = device.close() {
                debug!("Cleanup after failed setup: {cleanup:#}");
            }
            return Err(e.context(format!("failed to configure {name}")));
        }

        debug!(session = %spec.session, "Interface {name} up (table {table})");
        Ok(InterfaceHandle::new(Box::new(device)))
    }
}
