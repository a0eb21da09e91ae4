//! In-memory collaborators shared by the integration tests.
//!
//! Every fake appends to one shared log so tests can assert on the
//! interleaving of proxy, interface, bridge and DNS operations.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use onionlink::error::TunnelError;
use onionlink::notify::{Notification, Notifier};
use onionlink::tor::ProxyProcess;
use onionlink::vpn::{
    BridgeParams, DnsRelay, InstalledApp, InterfaceHandle, InterfaceSpec, PackageRegistry,
    PacketBridge, TunDevice, TunProvider,
};

#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ── Notifier ────────────────────────────────────────────────────────────────

pub struct Recorder {
    log: Log,
    pub seen: Mutex<Vec<Notification>>,
}

impl Recorder {
    pub fn new(log: Log) -> Arc<Self> {
        Arc::new(Self {
            log,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn errors(&self) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Error(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Notice(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Notification) -> usize {
        self.seen.lock().iter().filter(|n| *n == wanted).count()
    }
}

impl Notifier for Recorder {
    fn notify(&self, notification: Notification) {
        if let Notification::Status(status) = &notification {
            self.log.push(format!("status:{status}"));
        }
        self.seen.lock().push(notification);
    }
}

// ── Proxy process ───────────────────────────────────────────────────────────

pub struct FakeProxy {
    log: Log,
    running: AtomicBool,
    events: Mutex<Option<mpsc::Sender<String>>>,
    /// Lines delivered as soon as the process starts.
    pub script: Mutex<Vec<String>>,
    pub fail_start: AtomicBool,
    pub fail_write: AtomicBool,
    pub bypass: Mutex<Option<SocketAddr>>,
}

impl FakeProxy {
    pub fn new(log: Log) -> Arc<Self> {
        Arc::new(Self {
            log,
            running: AtomicBool::new(false),
            events: Mutex::new(None),
            script: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            fail_write: AtomicBool::new(false),
            bypass: Mutex::new(None),
        })
    }

    /// A proxy that reports full bootstrap right after launch.
    pub fn bootstrapping(log: Log) -> Arc<Self> {
        let proxy = Self::new(log);
        proxy
            .script
            .lock()
            .push("650 NOTICE Bootstrapped 100% (done): Done".into());
        proxy
    }

    pub async fn emit(&self, line: &str) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(line.to_string()).await;
        }
    }

    /// Simulate the process dying: the control channel closes.
    pub fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.events.lock().take();
    }
}

#[async_trait]
impl ProxyProcess for FakeProxy {
    async fn write_config(&self, bypass: Option<SocketAddr>) -> Result<()> {
        if self.fail_write.load(Ordering::SeqCst) {
            bail!("read-only file system");
        }
        *self.bypass.lock() = bypass;
        self.log.push("proxy-write-config");
        Ok(())
    }

    async fn start(&self) -> Result<mpsc::Receiver<String>> {
        if self.fail_start.load(Ordering::SeqCst) {
            bail!("tor binary not found");
        }
        let (tx, rx) = mpsc::channel(64);
        for line in self.script.lock().iter() {
            let _ = tx.try_send(line.clone());
        }
        *self.events.lock() = Some(tx);
        self.running.store(true, Ordering::SeqCst);
        self.log.push("proxy-start");
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.events.lock().take();
        self.log.push("proxy-stop");
        Ok(())
    }

    async fn disable_network(&self, disabled: bool) -> Result<()> {
        self.log.push(format!("proxy-disable-network:{disabled}"));
        Ok(())
    }

    async fn request_new_identity(&self) -> Result<()> {
        self.log.push("proxy-newnym");
        Ok(())
    }

    async fn reload_config(&self) -> Result<()> {
        self.log.push("proxy-reload");
        Ok(())
    }

    async fn set_exit_nodes(&self, nodes: &[String]) -> Result<()> {
        self.log.push(format!("proxy-exit-nodes:{}", nodes.join(",")));
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn socks_port(&self) -> u16 {
        9150
    }
}

// ── Virtual interface ───────────────────────────────────────────────────────

pub struct FakeTun {
    log: Log,
    per_app: bool,
    next: AtomicUsize,
    pub live: Arc<AtomicUsize>,
    pub fail: AtomicBool,
    pub specs: Mutex<Vec<InterfaceSpec>>,
}

impl FakeTun {
    pub fn new(log: Log, per_app: bool) -> Arc<Self> {
        Arc::new(Self {
            log,
            per_app,
            next: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            fail: AtomicBool::new(false),
            specs: Mutex::new(Vec::new()),
        })
    }

    pub fn last_spec(&self) -> Option<InterfaceSpec> {
        self.specs.lock().last().cloned()
    }
}

struct FakeDevice {
    index: usize,
    name: String,
    log: Log,
    live: Arc<AtomicUsize>,
}

impl TunDevice for FakeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> Option<i32> {
        Some(100 + self.index as i32)
    }

    fn close(&mut self) -> Result<()> {
        let before = self.live.fetch_sub(1, Ordering::SeqCst);
        self.log.push(format!("close:{}", self.index));
        self.log.push(format!("live-before-close:{before}"));
        Ok(())
    }
}

#[async_trait]
impl TunProvider for FakeTun {
    fn supports_per_app_routing(&self) -> bool {
        self.per_app
    }

    async fn establish(&self, spec: &InterfaceSpec) -> Result<InterfaceHandle> {
        if self.fail.load(Ordering::SeqCst) {
            self.log.push("establish-failed");
            bail!("permission denied");
        }
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().push(spec.clone());
        self.log.push(format!("establish:{index}"));
        Ok(InterfaceHandle::new(Box::new(FakeDevice {
            index,
            name: format!("olink{index}"),
            log: self.log.clone(),
            live: self.live.clone(),
        })))
    }
}

// ── Bridging engine ─────────────────────────────────────────────────────────

pub struct FakeBridge {
    log: Log,
    running: AtomicBool,
    pub fail: AtomicBool,
    pub params: Mutex<Vec<BridgeParams>>,
}

impl FakeBridge {
    pub fn new(log: Log) -> Arc<Self> {
        Arc::new(Self {
            log,
            running: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            params: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PacketBridge for FakeBridge {
    async fn start(&self, params: &BridgeParams) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            self.log.push("bridge-start-failed");
            bail!("tun2socks exited with status 1");
        }
        self.params.lock().push(params.clone());
        self.running.store(true, Ordering::SeqCst);
        self.log.push(format!("bridge-start:{}", params.tun_fd));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.log.push("bridge-stop");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ── DNS relay ───────────────────────────────────────────────────────────────

pub struct FakeDns {
    log: Log,
    pub kill_timeout: AtomicBool,
}

impl FakeDns {
    pub fn new(log: Log) -> Arc<Self> {
        Arc::new(Self {
            log,
            kill_timeout: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl DnsRelay for FakeDns {
    async fn start(&self, upstream: SocketAddr) -> Result<()> {
        self.log.push(format!("dns-start:{upstream}"));
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        self.log.push("dns-stop");
        if self.kill_timeout.load(Ordering::SeqCst) {
            return Err(TunnelError::ProcessKillTimeout {
                path: "/usr/sbin/pdnsd".into(),
                attempts: 5,
            });
        }
        Ok(())
    }

    fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 8091))
    }
}

// ── Package registry ────────────────────────────────────────────────────────

pub struct FakePackages(pub Vec<InstalledApp>);

impl FakePackages {
    pub fn standard() -> Arc<Self> {
        let app = |package_id: &str, uid: u32, network: bool| InstalledApp {
            package_id: package_id.into(),
            uid,
            display_name: package_id.rsplit('.').next().unwrap_or(package_id).into(),
            uses_network_permission: network,
        };
        Arc::new(Self(vec![
            app("org.example.browser", 10001, true),
            app("org.example.chat", 10002, true),
            app("org.example.calculator", 10003, false),
            app("onionlink", 10004, true),
        ]))
    }
}

impl PackageRegistry for FakePackages {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        Ok(self.0.clone())
    }
}
