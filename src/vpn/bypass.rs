//! Loopback SOCKS5 proxy that lets the proxy's own upstream connections
//! escape the tunnel on platforms without per-app routing.
//!
//! Supports the no-authentication method and the CONNECT command only.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct Running {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct SocksBypass {
    running: Mutex<Option<Running>>,
}

impl SocksBypass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `endpoint` and serve until [`stop`](Self::stop). A running
    /// instance is replaced. Returns the bound address.
    pub async fn start(&self, endpoint: SocketAddr) -> Result<SocketAddr> {
        self.stop().await;

        let listener = TcpListener::bind(endpoint)
            .await
            .with_context(|| format!("failed to bind SOCKS bypass on {endpoint}"))?;
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();
        let task = tokio::spawn(serve(listener, token.clone()));
        info!("SOCKS bypass listening on {local_addr}");

        *self.running.lock() = Some(Running {
            local_addr,
            token,
            task,
        });
        Ok(local_addr)
    }

    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.token.cancel();
            let _ = running.task.await;
            debug!("SOCKS bypass on {} stopped", running.local_addr);
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for SocksBypass {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
            running.task.abort();
        }
    }
}

async fn serve(listener: TcpListener, token: CancellationToken) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let token = token.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = token.cancelled() => {}
                            result = handle_client(stream) => {
                                if let Err(e) = result {
                                    debug!("SOCKS client {peer}: {e:#}");
                                }
                            }
                        }
                    });
                }
                Err(e) => debug!("SOCKS accept failed: {e}"),
            },
        }
    }
}

async fn handle_client(mut client: TcpStream) -> Result<()> {
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version {}", head[0]);
    }
    let mut methods = vec![0u8; usize::from(head[1])];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        client.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
        bail!("client offers no acceptable auth method");
    }
    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut req = [0u8; 4];
    client.read_exact(&mut req).await?;
    let host = match req[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            client.read_exact(&mut name).await?;
            String::from_utf8(name).context("domain is not UTF-8")?
        }
        other => {
            reply(&mut client, REPLY_ADDRESS_NOT_SUPPORTED, None).await?;
            bail!("unsupported address type {other}");
        }
    };
    let port = client.read_u16().await?;

    if req[1] != CMD_CONNECT {
        reply(&mut client, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
        bail!("unsupported command {}", req[1]);
    }

    let upstream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            reply(&mut client, REPLY_HOST_UNREACHABLE, None).await?;
            return Err(e).with_context(|| format!("connect to {host}:{port}"));
        }
        Err(_) => {
            reply(&mut client, REPLY_GENERAL_FAILURE, None).await?;
            bail!("connect to {host}:{port} timed out");
        }
    };
    let bound = upstream.local_addr().ok();
    reply(&mut client, REPLY_SUCCEEDED, bound).await?;

    let mut upstream = upstream;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

async fn reply(client: &mut TcpStream, code: u8, bound: Option<SocketAddr>) -> Result<()> {
    let mut msg = vec![SOCKS_VERSION, code, 0x00];
    match bound.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))) {
        SocketAddr::V4(addr) => {
            msg.push(ATYP_IPV4);
            msg.extend_from_slice(&addr.ip().octets());
            msg.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            msg.push(ATYP_IPV6);
            msg.extend_from_slice(&addr.ip().octets());
            msg.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    client.write_all(&msg).await?;
    Ok(())
}
