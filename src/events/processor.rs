//! Control-event processor
//!
//! Turns raw `650` event text into [`NormalizedEvent`]s. Never fails: bad
//! input degrades into partially populated events or `Unrecognized`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::types::{
    peer_display_name, BandwidthSample, Circuit, CircuitStatus, Node, NormalizedEvent, Severity,
};

/// Category used only for internal status polling; never forwarded.
const SUPPRESSED_CATEGORY: &str = "STATUS_CLIENT";

/// A raw event: category keyword plus the rest of the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub category: String,
    pub payload: String,
}

impl RawEvent {
    /// Split an event line. Accepts lines with or without the `650 `/`650-`
    /// status prefix.
    pub fn parse_line(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let line = line
            .strip_prefix("650 ")
            .or_else(|| line.strip_prefix("650-"))
            .unwrap_or(line)
            .trim_start();
        let (category, payload) = line.split_once(' ').unwrap_or((line, ""));
        Self {
            category: category.to_string(),
            payload: payload.trim().to_string(),
        }
    }
}

/// Circuits currently built, keyed by circuit id.
///
/// Cloning shares the underlying table; readers take snapshots.
#[derive(Debug, Clone, Default)]
pub struct CircuitTable {
    inner: Arc<Mutex<HashMap<String, Circuit>>>,
}

impl CircuitTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, circuit: Circuit) {
        self.inner.lock().insert(circuit.id.clone(), circuit);
    }

    fn remove(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    /// Copy of the table sorted by circuit id.
    pub fn snapshot(&self) -> Vec<Circuit> {
        let mut circuits: Vec<Circuit> = self.inner.lock().values().cloned().collect();
        circuits.sort_by(|a, b| a.id.cmp(&b.id));
        circuits
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Per-run event processor.
///
/// Holds the previous bandwidth sample (for de-duplication), the running
/// totals and a handle to the built-circuit table.
#[derive(Debug)]
pub struct ControlEventProcessor {
    last_read: Option<u64>,
    last_written: Option<u64>,
    total_read: u64,
    total_written: u64,
    tracking: bool,
    circuits: CircuitTable,
}

impl ControlEventProcessor {
    /// `tracking` enables the retained circuit table.
    pub fn new(circuits: CircuitTable, tracking: bool) -> Self {
        Self {
            last_read: None,
            last_written: None,
            total_read: 0,
            total_written: 0,
            tracking,
            circuits,
        }
    }

    pub fn set_tracking(&mut self, tracking: bool) {
        self.tracking = tracking;
    }

    pub fn circuits(&self) -> &CircuitTable {
        &self.circuits
    }

    /// Process one raw event line.
    pub fn process_line(&mut self, line: &str) -> Option<NormalizedEvent> {
        self.process(&RawEvent::parse_line(line))
    }

    pub fn process(&mut self, event: &RawEvent) -> Option<NormalizedEvent> {
        let fields: Vec<&str> = event.payload.split_whitespace().collect();
        match event.category.as_str() {
            "BW" => self.bandwidth_used(&fields),
            "CIRC" => Some(self.circuit_status(&fields)),
            "STREAM" => Some(stream_status(&fields)),
            "ORCONN" => Some(or_conn_status(&fields)),
            SUPPRESSED_CATEGORY => None,
            keyword => match Severity::from_keyword(keyword) {
                Some(severity) => Some(NormalizedEvent::LogMessage {
                    severity,
                    text: event.payload.clone(),
                }),
                None => Some(NormalizedEvent::Unrecognized {
                    kind: event.category.clone(),
                    text: event.payload.clone(),
                }),
            },
        }
    }

    /// `BW <read> <written>`; emits only when the pair changed.
    fn bandwidth_used(&mut self, fields: &[&str]) -> Option<NormalizedEvent> {
        let read = fields.first().and_then(|f| f.parse::<u64>().ok())?;
        let written = fields.get(1).and_then(|f| f.parse::<u64>().ok())?;

        let changed = self.last_read != Some(read) || self.last_written != Some(written);
        self.last_read = Some(read);
        self.last_written = Some(written);
        if !changed {
            return None;
        }

        self.total_read = self.total_read.saturating_add(read);
        self.total_written = self.total_written.saturating_add(written);
        Some(NormalizedEvent::Bandwidth(BandwidthSample {
            read,
            written,
            total_read: self.total_read,
            total_written: self.total_written,
        }))
    }

    /// `CIRC <id> <status> [<path>] [key=value ...]`
    fn circuit_status(&mut self, fields: &[&str]) -> NormalizedEvent {
        let id = fields.first().copied().unwrap_or_default().to_string();
        let status = CircuitStatus::parse(fields.get(1).copied().unwrap_or_default());
        let path = fields
            .get(2)
            .filter(|p| !is_keyword_arg(p))
            .map(|p| {
                p.split(',')
                    .filter(|token| !token.is_empty())
                    .map(Node::parse)
                    .collect()
            })
            .unwrap_or_default();

        let circuit = Circuit { id, status, path };
        if self.tracking {
            match circuit.status {
                CircuitStatus::Built => self.circuits.insert(circuit.clone()),
                CircuitStatus::Closed => self.circuits.remove(&circuit.id),
                _ => {}
            }
        }
        NormalizedEvent::CircuitStatus(circuit)
    }
}

/// `KEY=value` trailer such as `PURPOSE=GENERAL`, as opposed to a path token
/// like `$AAAA=NodeA`.
fn is_keyword_arg(field: &str) -> bool {
    match field.split_once('=') {
        Some((key, _)) => !key.is_empty() && key.bytes().all(|b| b.is_ascii_uppercase() || b == b'_'),
        None => false,
    }
}

/// `STREAM <id> <status> <circuit id> <target> ...`
fn stream_status(fields: &[&str]) -> NormalizedEvent {
    NormalizedEvent::StreamStatus {
        stream_id: fields.first().copied().unwrap_or_default().to_string(),
        status: fields.get(1).copied().unwrap_or_default().to_string(),
        target: fields.get(3).copied().unwrap_or_default().to_string(),
    }
}

/// `ORCONN <target> <status> ...`
fn or_conn_status(fields: &[&str]) -> NormalizedEvent {
    let target = fields.first().copied().unwrap_or_default();
    NormalizedEvent::OrConnStatus {
        peer: peer_display_name(target).to_string(),
        status: fields.get(1).copied().unwrap_or_default().to_string(),
    }
}
