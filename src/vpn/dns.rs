//! DNS relay (pdnsd) forwarding tunnel DNS into the proxy's DNS port.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::TunnelError;
use crate::supervisor::ProcessSupervisor;

#[async_trait]
pub trait DnsRelay: Send + Sync {
    /// Start (or restart) the relay forwarding to `upstream`.
    async fn start(&self, upstream: SocketAddr) -> Result<()>;

    /// Forcibly terminate the relay.
    async fn stop(&self) -> Result<(), TunnelError>;

    /// Address the relay answers on.
    fn listen_addr(&self) -> SocketAddr;
}

/// Render a pdnsd configuration.
pub fn pdnsd_conf(listen: SocketAddr, upstream: SocketAddr, cache_dir: &Path) -> String {
    format!(
        "global {{\n\
         \tperm_cache=0;\n\
         \tcache_dir=\"{cache}\";\n\
         \tpid_file=\"{cache}/pdnsd.pid\";\n\
         \tserver_ip={listen_ip};\n\
         \tserver_port={listen_port};\n\
         \tquery_method=tcp_only;\n\
         \tmin_ttl=1m;\n\
         \tmax_ttl=1w;\n\
         \ttimeout=10;\n\
         \tdaemon=on;\n\
         }}\n\
         \n\
         server {{\n\
         \tlabel=\"upstream\";\n\
         \tip={up_ip};\n\
         \tport={up_port};\n\
         \tuptest=none;\n\
         \tproxy_only=on;\n\
         }}\n\
         \n\
         rr {{\n\
         \tname=localhost;\n\
         \treverse=on;\n\
         \ta=127.0.0.1;\n\
         \towner=localhost;\n\
         \tsoa=localhost,root.localhost,42,86400,900,86400,86400;\n\
         }}\n",
        cache = cache_dir.display(),
        listen_ip = listen.ip(),
        listen_port = listen.port(),
        up_ip = upstream.ip(),
        up_port = upstream.port(),
    )
}

/// pdnsd run as a self-daemonizing external process.
pub struct PdnsdRelay {
    binary: String,
    listen: SocketAddr,
    work_dir: PathBuf,
    supervisor: Arc<ProcessSupervisor>,
}

impl PdnsdRelay {
    pub fn new(
        binary: impl Into<String>,
        listen: SocketAddr,
        work_dir: impl Into<PathBuf>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self {
            binary: binary.into(),
            listen,
            work_dir: work_dir.into(),
            supervisor,
        }
    }

    pub fn conf_path(&self) -> PathBuf {
        self.work_dir.join("pdnsd.conf")
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        which::which(shellexpand::tilde(&self.binary).as_ref())
            .with_context(|| format!("'{}' binary not found in PATH", self.binary))
    }

    /// Write the config file and make sure the cache file exists.
    pub fn write_conf(&self, upstream: SocketAddr) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("failed to create {}", self.work_dir.display()))?;
        let path = self.conf_path();
        std::fs::write(&path, pdnsd_conf(self.listen, upstream, &self.work_dir))
            .with_context(|| format!("failed to write {}", path.display()))?;
        let cache = self.work_dir.join("pdnsd.cache");
        if !cache.exists() {
            if let Err(e) = std::fs::File::create(&cache) {
                debug!("Could not create {}: {e}", cache.display());
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl DnsRelay for PdnsdRelay {
    async fn start(&self, upstream: SocketAddr) -> Result<()> {
        let binary = self.resolve_binary()?;
        // A relay left over from a previous session still holds the port.
        if let Err(e) = self.supervisor.kill_process(&binary).await {
            debug!("Previous DNS relay: {e}");
        }
        let conf = self.write_conf(upstream)?;

        let output = tokio::process::Command::new(&binary)
            .arg("-c")
            .arg(&conf)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", binary.display()))?;

        info!("DNS relay exited with {} after daemonizing", output.status);
        if !output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            for line in text.lines().chain(String::from_utf8_lossy(&output.stderr).lines()) {
                debug!("pdnsd: {line}");
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        match self.resolve_binary() {
            Ok(binary) => self.supervisor.kill_process(&binary).await,
            Err(e) => {
                debug!("Nothing to stop: {e:#}");
                Ok(())
            }
        }
    }

    fn listen_addr(&self) -> SocketAddr {
        self.listen
    }
}
