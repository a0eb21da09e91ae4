//! Control-port transports
//!
//! The control protocol is CRLF-delimited text over a byte stream. A
//! transport only has to hand the client a buffered reader and a writer;
//! framing is done by [`crate::reply::ReplyAssembler`].

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncBufRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Connect timeout for the local control port.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A byte stream to a Tor control port.
pub trait ControlTransport: Send {
    /// Split into independently owned read and write halves.
    fn into_split(self: Box<Self>) -> (BoxedReader, BoxedWriter);
}

/// TCP transport to a control port on the loopback interface.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        debug!("Connecting to control port {addr}");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .with_context(|| format!("Timed out connecting to control port {addr}"))?
            .with_context(|| format!("Failed to connect to control port {addr}"))?;
        stream
            .set_nodelay(true)
            .context("Failed to set TCP_NODELAY on control socket")?;
        Ok(Self { stream })
    }
}

impl ControlTransport for TcpTransport {
    fn into_split(self: Box<Self>) -> (BoxedReader, BoxedWriter) {
        let (read, write) = self.stream.into_split();
        (Box::new(BufReader::new(read)), Box::new(write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_transport_splits_into_working_halves() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"250 OK\r\n").await.unwrap();
        });

        let transport = Box::new(TcpTransport::connect(addr).await.unwrap());
        let (mut reader, _writer) = transport.into_split();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "250 OK\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_transport_reports_refused_connection() {
        // Bind then drop to obtain a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(TcpTransport::connect(addr).await.is_err());
    }
}
