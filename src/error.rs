//! Error taxonomy for the lifecycle and tunnel seams.
//!
//! Collaborator failures (I/O, process spawning, control-port traffic) are
//! carried as `anyhow::Error` and classified into one of these variants at
//! the point where the lifecycle has to decide what state to settle in.

/// Failures surfaced by [`crate::lifecycle::LifecycleController`] and
/// [`crate::vpn::TunnelOrchestrator`].
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The proxy process failed to launch or never became ready.
    #[error("proxy launch failed: {reason}")]
    LaunchFailure { reason: String },

    /// The generated proxy configuration could not be written.
    #[error("unable to write proxy configuration: {reason}")]
    ConfigWriteFailure { reason: String },

    /// A stray process survived every kill attempt.
    #[error("cannot kill {path} after {attempts} attempts")]
    ProcessKillTimeout { path: String, attempts: u32 },

    /// The virtual interface or the bridging engine could not be set up.
    #[error("tunnel setup failed: {reason}")]
    TunnelSetupFailure { reason: String },

    /// A concurrent stop request won the race against this start.
    #[error("start cancelled by a concurrent stop request")]
    StartCancelled,

    /// A background worker is gone (runtime shutting down).
    #[error("{component} is no longer running")]
    Unavailable { component: &'static str },
}

impl TunnelError {
    pub fn launch(err: impl std::fmt::Display) -> Self {
        Self::LaunchFailure {
            reason: err.to_string(),
        }
    }

    pub fn config_write(err: impl std::fmt::Display) -> Self {
        Self::ConfigWriteFailure {
            reason: err.to_string(),
        }
    }

    pub fn tunnel_setup(err: impl std::fmt::Display) -> Self {
        Self::TunnelSetupFailure {
            reason: err.to_string(),
        }
    }

    /// Whether the notifier should see this as an error rather than a notice.
    pub fn is_escalated(&self) -> bool {
        matches!(
            self,
            Self::LaunchFailure { .. } | Self::TunnelSetupFailure { .. }
        )
    }
}
