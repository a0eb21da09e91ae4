//! Normalized control-channel events.

use std::fmt;

use serde::Serialize;

/// Bandwidth counters from a `BW` event plus running totals for the
/// current proxy run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BandwidthSample {
    pub read: u64,
    pub written: u64,
    pub total_read: u64,
    pub total_written: u64,
}

impl fmt::Display for BandwidthSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \u{2193} / {} \u{2191}",
            format_count(self.read),
            format_count(self.written)
        )
    }
}

/// Render a per-second byte count as `NNkbps` (below 1 MB) or `NNmbps`.
pub fn format_count(count: u64) -> String {
    if count < 1_000_000 {
        let tenths = count * 10 / 1024;
        format!("{}kbps", (tenths as f64 / 10.0).round() as u64)
    } else {
        let hundredths = count * 100 / 1024 / 1024;
        format!("{}mbps", (hundredths as f64 / 100.0).round() as u64)
    }
}

/// One relay on a circuit path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: String,
    pub display_name: String,
}

impl Node {
    /// Parse a path token such as `$FINGERPRINT~nickname` or
    /// `$FINGERPRINT=nickname`.
    ///
    /// Tokens that split into anything other than one or two parts yield a
    /// node with empty fields.
    pub fn parse(token: &str) -> Self {
        let separator = if token.contains('=') { '=' } else { '~' };
        let mut parts: Vec<&str> = token.split(separator).collect();
        while parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
            parts.pop();
        }

        match parts.as_slice() {
            [id] => {
                let id = strip_fingerprint_marker(id);
                Self {
                    id: id.to_string(),
                    display_name: id.to_string(),
                }
            }
            [id, name] => Self {
                id: strip_fingerprint_marker(id).to_string(),
                display_name: (*name).to_string(),
            },
            _ => Self::default(),
        }
    }
}

fn strip_fingerprint_marker(id: &str) -> &str {
    id.strip_prefix('$').unwrap_or(id)
}

/// Human-readable name of an OR connection peer: the part after `=` or `~`,
/// or the whole target when neither is present.
pub fn peer_display_name(target: &str) -> &str {
    target
        .split_once('=')
        .or_else(|| target.split_once('~'))
        .map(|(_, name)| name)
        .unwrap_or(target)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    Launched,
    Built,
    Extended,
    Failed,
    Closed,
    GuardWait,
    Other(String),
}

impl CircuitStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "LAUNCHED" => Self::Launched,
            "BUILT" => Self::Built,
            "EXTENDED" => Self::Extended,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            "GUARD_WAIT" => Self::GuardWait,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launched => write!(f, "LAUNCHED"),
            Self::Built => write!(f, "BUILT"),
            Self::Extended => write!(f, "EXTENDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Closed => write!(f, "CLOSED"),
            Self::GuardWait => write!(f, "GUARD_WAIT"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Circuit {
    pub id: String,
    pub status: CircuitStatus,
    pub path: Vec<Node>,
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Circuit ({}) {}: ", self.id, self.status)?;
        for (i, node) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, " > ")?;
            }
            write!(f, "{}", node.display_name)?;
        }
        Ok(())
    }
}

/// Severity of a log-message event (`NOTICE`, `WARN`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warn,
    Err,
}

impl Severity {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "NOTICE" => Some(Self::Notice),
            "WARN" => Some(Self::Warn),
            "ERR" => Some(Self::Err),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warn => "WARN",
            Self::Err => "ERR",
        };
        f.write_str(s)
    }
}

/// A control-channel event after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    Bandwidth(BandwidthSample),
    CircuitStatus(Circuit),
    StreamStatus {
        stream_id: String,
        status: String,
        target: String,
    },
    OrConnStatus {
        peer: String,
        status: String,
    },
    LogMessage {
        severity: Severity,
        text: String,
    },
    Unrecognized {
        kind: String,
        text: String,
    },
}

impl NormalizedEvent {
    /// Bootstrap percentage carried by a `Bootstrapped NN%` log message.
    pub fn bootstrap_progress(&self) -> Option<u8> {
        match self {
            Self::LogMessage { text, .. } => parse_bootstrap_progress(text),
            _ => None,
        }
    }

    /// Whether this event means the proxy has become usable.
    pub fn signals_ready(&self) -> bool {
        match self {
            Self::CircuitStatus(circuit) => circuit.status == CircuitStatus::Built,
            other => other.bootstrap_progress() == Some(100),
        }
    }
}

fn parse_bootstrap_progress(text: &str) -> Option<u8> {
    static PATTERN: std::sync::OnceLock<Option<regex::Regex>> = std::sync::OnceLock::new();
    let re = PATTERN
        .get_or_init(|| regex::Regex::new(r"Bootstrapped (\d{1,3})%").ok())
        .as_ref()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

impl fmt::Display for NormalizedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bandwidth(sample) => write!(f, "{sample}"),
            Self::CircuitStatus(circuit) => write!(f, "{circuit}"),
            Self::StreamStatus {
                stream_id, status, ..
            } => write!(f, "StreamStatus ({stream_id}): {status}"),
            Self::OrConnStatus { peer, status } => write!(f, "orConnStatus ({peer}): {status}"),
            Self::LogMessage { severity, text } => write!(f, "{severity}: {text}"),
            Self::Unrecognized { kind, text } => write!(f, "Message ({kind}): {text}"),
        }
    }
}
