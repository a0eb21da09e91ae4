//! Tor control-port protocol support for onionlink
//!
//! This crate speaks the line-oriented Tor control protocol: it frames
//! replies, separates asynchronous `650` events from synchronous command
//! replies, and exposes typed helpers for the handful of commands the
//! lifecycle supervisor issues.

pub mod client;
pub mod reply;
pub mod transport;

pub use client::{ControlClient, Signal};
pub use reply::{Reply, ReplyAssembler};
pub use transport::{ControlTransport, TcpTransport};
