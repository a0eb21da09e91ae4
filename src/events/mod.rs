//! Control-channel event parsing.

pub mod processor;
pub mod types;

pub use processor::{CircuitTable, ControlEventProcessor, RawEvent};
pub use types::{
    format_count, BandwidthSample, Circuit, CircuitStatus, Node, NormalizedEvent, Severity,
};
