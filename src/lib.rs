//! OnionLink: supervises a local Tor process and, in VPN mode, bridges the
//! host's traffic into it through a virtual interface.

pub mod commands;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod notify;
pub mod supervisor;
pub mod tor;
pub mod vpn;

pub use commands::{Command, CommandDispatcher, CommandReply, StatusReply};
pub use config::{Config, SharedConfig};
pub use context::SharedContext;
pub use error::TunnelError;
pub use lifecycle::{LifecycleController, ProxyStatus};
pub use notify::{Notification, Notifier};
pub use vpn::TunnelOrchestrator;
