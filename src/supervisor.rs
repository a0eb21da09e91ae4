//! Stray-process cleanup.
//!
//! Finds processes by executable path in the OS process table and kills
//! them with bounded retries.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::TunnelError;

/// Maximum kill rounds before giving up.
pub const MAX_KILL_ATTEMPTS: u32 = 5;

/// Pause between kill rounds.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Source of the OS process listing.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Raw `ps`-style listing, one process per line.
    async fn snapshot(&self) -> Result<String>;
}

/// Issues termination signals for one process.
#[async_trait]
pub trait Killer: Send + Sync {
    /// Try every available mechanism. Failures of individual mechanisms are
    /// expected and ignored.
    async fn kill(&self, pid: u32, path: &Path);
}

/// Reads the process table with `ps -ef`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PsProcessTable;

#[async_trait]
impl ProcessTable for PsProcessTable {
    async fn snapshot(&self) -> Result<String> {
        let output = tokio::process::Command::new("ps")
            .arg("-ef")
            .output()
            .await
            .context("failed to run ps")?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Sends SIGKILL directly and then through the usual command-line tools,
/// since which of them exist varies between systems.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalKiller;

#[async_trait]
impl Killer for SignalKiller {
    async fn kill(&self, pid: u32, path: &Path) {
        #[cfg(unix)]
        if let Ok(raw) = libc::pid_t::try_from(pid) {
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
            if rc != 0 {
                debug!("kill({pid}, SIGKILL) failed: {}", std::io::Error::last_os_error());
            }
        }

        let pid = pid.to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let attempts: [(&str, Vec<&str>); 3] = [
            ("killall", vec!["-9", name.as_str()]),
            ("busybox", vec!["kill", "-9", pid.as_str()]),
            ("kill", vec!["-9", pid.as_str()]),
        ];
        for (program, args) in attempts {
            if program == "killall" && name.is_empty() {
                continue;
            }
            match tokio::process::Command::new(program)
                .args(&args)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .await
            {
                Ok(status) => debug!("{program} {} exited with {status}", args.join(" ")),
                Err(e) => debug!("{program} unavailable: {e}"),
            }
        }
    }
}

/// Pick the pid out of a process-table line.
///
/// Most `ps` variants put the pid in the second column (after the user);
/// some put it first.
fn pid_from_line(line: &str) -> Option<u32> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    fields
        .get(1)
        .and_then(|f| f.parse().ok())
        .or_else(|| fields.first().and_then(|f| f.parse().ok()))
}

/// Find a pid in a process listing whose line mentions `command`.
pub fn find_in_listing(listing: &str, command: &str) -> Option<u32> {
    listing
        .lines()
        .filter(|line| !line.contains("PID") && line.contains(command))
        .find_map(pid_from_line)
}

pub struct ProcessSupervisor {
    table: Arc<dyn ProcessTable>,
    killer: Arc<dyn Killer>,
    retry_delay: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Arc::new(PsProcessTable), Arc::new(SignalKiller))
    }
}

impl ProcessSupervisor {
    pub fn new(table: Arc<dyn ProcessTable>, killer: Arc<dyn Killer>) -> Self {
        Self {
            table,
            killer,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Pid of the first process whose command line contains `command_path`.
    pub async fn find_process_id(&self, command_path: &Path) -> Result<Option<u32>> {
        let listing = self.table.snapshot().await?;
        Ok(find_in_listing(&listing, &command_path.to_string_lossy()))
    }

    /// Kill every process running `path`.
    ///
    /// Returns immediately when nothing matches. Fails with
    /// [`TunnelError::ProcessKillTimeout`] if a process is still present
    /// after [`MAX_KILL_ATTEMPTS`] rounds.
    pub async fn kill_process(&self, path: &Path) -> Result<(), TunnelError> {
        let mut attempts = 0;
        loop {
            let pid = match self.find_process_id(path).await {
                Ok(Some(pid)) => pid,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("Process table unavailable while killing {}: {e:#}", path.display());
                    return Ok(());
                }
            };

            if attempts >= MAX_KILL_ATTEMPTS {
                return Err(TunnelError::ProcessKillTimeout {
                    path: path.display().to_string(),
                    attempts,
                });
            }
            attempts += 1;
            debug!("Killing {} (pid {pid}), attempt {attempts}", path.display());
            self.killer.kill(pid, path).await;
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}
