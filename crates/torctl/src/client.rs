//! Control-port client
//!
//! A background reader task splits the incoming stream into synchronous
//! replies (paired with the command that is currently in flight) and
//! asynchronous `650` events (forwarded to a bounded channel that the
//! owner takes once via [`ControlClient::take_events`]).

use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::reply::{Reply, ReplyAssembler};
use crate::transport::{BoxedReader, BoxedWriter, ControlTransport};

/// Capacity of the async-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Signals understood by `SIGNAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Re-read the configuration file (SIGHUP).
    Reload,
    /// Controlled shutdown.
    Shutdown,
    /// Switch to clean circuits for new connections.
    NewNym,
    /// Immediate shutdown.
    Halt,
    ClearDnsCache,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reload => "RELOAD",
            Self::Shutdown => "SHUTDOWN",
            Self::NewNym => "NEWNYM",
            Self::Halt => "HALT",
            Self::ClearDnsCache => "CLEARDNSCACHE",
        };
        write!(f, "{s}")
    }
}

/// Writer plus reply receiver; locked together so a command and its reply
/// are always paired.
struct Exchange {
    writer: BoxedWriter,
    replies: mpsc::Receiver<Reply>,
}

pub struct ControlClient {
    exchange: Mutex<Exchange>,
    events: parking_lot::Mutex<Option<mpsc::Receiver<String>>>,
    reader_task: JoinHandle<()>,
}

impl ControlClient {
    /// Wrap a connected transport and start the reader task.
    pub fn new(transport: Box<dyn ControlTransport>) -> Self {
        let (reader, writer) = transport.into_split();
        let (reply_tx, reply_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(read_loop(reader, reply_tx, event_tx));

        Self {
            exchange: Mutex::new(Exchange {
                writer,
                replies: reply_rx,
            }),
            events: parking_lot::Mutex::new(Some(event_rx)),
            reader_task,
        }
    }

    /// Take the async-event stream. Returns `None` after the first call.
    ///
    /// Each item is the event text without its `650` prefix, e.g.
    /// `"BW 1024 2048"`. The stream ends when the connection closes.
    pub fn take_events(&self) -> Option<mpsc::Receiver<String>> {
        self.events.lock().take()
    }

    /// Send a raw command and wait for its reply.
    ///
    /// Any non-250 reply is returned as an error.
    pub async fn send_command(&self, command: &str) -> Result<Reply> {
        let verb = command.split_whitespace().next().unwrap_or_default();
        let mut exchange = self.exchange.lock().await;

        debug!("Sending control command: {verb}");
        exchange
            .writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .with_context(|| format!("Failed to write {verb} to control port"))?;
        exchange
            .writer
            .flush()
            .await
            .context("Failed to flush control port")?;

        let reply = exchange
            .replies
            .recv()
            .await
            .with_context(|| format!("Control connection closed while waiting for {verb} reply"))?;

        if !reply.is_ok() {
            bail!("{verb} failed: {} {}", reply.status, reply.text());
        }
        Ok(reply)
    }

    /// Authenticate with the contents of a `CookieAuthFile`.
    pub async fn authenticate_cookie(&self, cookie_path: &Path) -> Result<()> {
        let cookie = std::fs::read(cookie_path)
            .with_context(|| format!("Failed to read control cookie {}", cookie_path.display()))?;
        self.send_command(&format!("AUTHENTICATE {}", hex::encode_upper(cookie)))
            .await?;
        Ok(())
    }

    /// Authenticate without credentials, or with a plain password.
    pub async fn authenticate(&self, password: Option<&str>) -> Result<()> {
        let command = match password {
            Some(password) => format!("AUTHENTICATE {}", quote(password)),
            None => "AUTHENTICATE".to_string(),
        };
        self.send_command(&command).await?;
        Ok(())
    }

    pub async fn set_events(&self, events: &[&str]) -> Result<()> {
        self.send_command(&format!("SETEVENTS {}", events.join(" ")))
            .await?;
        Ok(())
    }

    /// `SETCONF` one or more keys. An empty value resets the key to its default.
    pub async fn set_conf(&self, key_values: &[(&str, &str)]) -> Result<()> {
        let mut command = String::from("SETCONF");
        for (key, value) in key_values {
            command.push(' ');
            command.push_str(key);
            if !value.is_empty() {
                command.push('=');
                command.push_str(&quote(value));
            }
        }
        self.send_command(&command).await?;
        Ok(())
    }

    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.send_command(&format!("SIGNAL {signal}")).await?;
        Ok(())
    }

    /// Make the daemon exit when this control connection closes.
    pub async fn take_ownership(&self) -> Result<()> {
        self.send_command("TAKEOWNERSHIP").await?;
        Ok(())
    }

    pub async fn get_info(&self, key: &str) -> Result<String> {
        let reply = self.send_command(&format!("GETINFO {key}")).await?;
        reply
            .value_of(key)
            .map(str::to_string)
            .with_context(|| format!("GETINFO reply is missing {key}"))
    }

    /// Shut down the write half and stop the reader task.
    pub async fn close(&self) {
        let mut exchange = self.exchange.lock().await;
        let _ = exchange.writer.shutdown().await;
        self.reader_task.abort();
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Quote a value for use in a control command.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

async fn read_loop(
    mut reader: BoxedReader,
    reply_tx: mpsc::Sender<Reply>,
    event_tx: mpsc::Sender<String>,
) {
    let mut assembler = ReplyAssembler::new();
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Control connection closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Control connection read failed: {e}");
                break;
            }
        }

        let reply = match assembler.push_line(&line) {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping malformed control line: {e}");
                continue;
            }
        };

        if reply.is_async() {
            // Nobody listening is fine; events are best-effort.
            let _ = event_tx.send(reply.text()).await;
        } else if reply_tx.send(reply).await.is_err() {
            break;
        }
    }
}
