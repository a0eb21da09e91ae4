//! Proxy lifecycle state machine.
//!
//! ```text
//! Off ──start──▶ Starting ──ready──▶ On ──stop──▶ Stopping ──▶ Off
//!                   │
//!                   └──launch failure / timeout──▶ Off
//! ```

pub mod controller;

pub use controller::{LifecycleController, StatusSnapshot};

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyStatus {
    #[default]
    Off,
    Starting,
    On,
    Stopping,
}

impl ProxyStatus {
    /// Whether a proxy run is underway (a tunnel may only exist then).
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::On)
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "OFF",
            Self::Starting => "STARTING",
            Self::On => "ON",
            Self::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_serialize_agree() {
        for status in [
            ProxyStatus::Off,
            ProxyStatus::Starting,
            ProxyStatus::On,
            ProxyStatus::Stopping,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn only_starting_and_on_are_live() {
        assert!(!ProxyStatus::Off.is_live());
        assert!(ProxyStatus::Starting.is_live());
        assert!(ProxyStatus::On.is_live());
        assert!(!ProxyStatus::Stopping.is_live());
    }
}
