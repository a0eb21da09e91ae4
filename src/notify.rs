//! One-way notification sink.
//!
//! The core never blocks on a notifier; implementations must return quickly.

use tokio::sync::broadcast;

use crate::events::BandwidthSample;
use crate::lifecycle::ProxyStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Notice(String),
    Debug(String),
    /// Escalated failure (launch or tunnel setup).
    Error(String),
    Bandwidth(BandwidthSample),
    Status(ProxyStatus),
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);

    fn notice(&self, message: &str) {
        self.notify(Notification::Notice(message.to_string()));
    }

    fn debug(&self, message: &str) {
        self.notify(Notification::Debug(message.to_string()));
    }

    fn error(&self, message: &str) {
        self.notify(Notification::Error(message.to_string()));
    }
}

/// Writes every notification to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::Notice(msg) => tracing::info!("{msg}"),
            Notification::Debug(msg) => tracing::debug!("{msg}"),
            Notification::Error(msg) => tracing::error!("{msg}"),
            Notification::Bandwidth(sample) => tracing::debug!(
                total_read = sample.total_read,
                total_written = sample.total_written,
                "{sample}"
            ),
            Notification::Status(status) => tracing::info!("Proxy status: {status}"),
        }
    }
}

/// Fans notifications out to any number of subscribers.
///
/// Slow subscribers lag and lose messages rather than blocking the sender.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

/// Sends to several notifiers in order.
pub struct FanoutNotifier {
    sinks: Vec<Box<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, notification: Notification) {
        for sink in &self.sinks {
            sink.notify(notification.clone());
        }
    }
}
