//! Control-protocol reply framing
//!
//! A reply is one or more lines sharing a three-digit status code. The
//! fourth character of each line tells whether the reply continues:
//! `-` (mid-reply line), `+` (a dot-terminated data block follows) or
//! ` ` (final line).

use anyhow::{bail, Result};

/// Status code Tor uses for asynchronous event notifications.
pub const ASYNC_EVENT_STATUS: u16 = 650;

/// Status code for a successful synchronous reply.
pub const OK_STATUS: u16 = 250;

/// A fully assembled control-port reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == OK_STATUS
    }

    /// Whether this reply is an asynchronous event rather than a command reply.
    pub fn is_async(&self) -> bool {
        self.status == ASYNC_EVENT_STATUS
    }

    /// All reply lines joined with a single space.
    ///
    /// Multi-line events are flattened this way before being handed to
    /// event consumers, which only ever look at whitespace-separated fields.
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// Look up a `key=value` line (as produced by `GETINFO`).
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

/// Incremental reply assembler fed one raw line at a time.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    status: Option<u16>,
    lines: Vec<String>,
    in_data: bool,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing CRLF).
    ///
    /// Returns `Ok(Some(reply))` once the final line of a reply has been
    /// seen, `Ok(None)` while the reply is still incomplete.
    pub fn push_line(&mut self, raw: &str) -> Result<Option<Reply>> {
        let line = raw.trim_end_matches(['\r', '\n']);

        if self.in_data {
            if line == "." {
                self.in_data = false;
            } else {
                let unescaped = line.strip_prefix('.').unwrap_or(line);
                self.lines.push(unescaped.to_string());
            }
            return Ok(None);
        }

        if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
            bail!("control reply line too short: {line:?}");
        }
        let (code, rest) = line.split_at(3);
        let status: u16 = match code.parse() {
            Ok(s) => s,
            Err(_) => bail!("control reply line has no status code: {line:?}"),
        };
        let (separator, body) = rest.split_at(1);

        self.status.get_or_insert(status);
        self.lines.push(body.to_string());

        match separator {
            "-" => Ok(None),
            "+" => {
                self.in_data = true;
                Ok(None)
            }
            " " => {
                let reply = Reply {
                    status: self.status.take().unwrap_or(status),
                    lines: std::mem::take(&mut self.lines),
                };
                Ok(Some(reply))
            }
            other => {
                self.status = None;
                self.lines.clear();
                bail!("unknown control reply separator {other:?} in {line:?}")
            }
        }
    }
}
