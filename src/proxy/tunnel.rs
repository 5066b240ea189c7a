//! Built-in engine: an HTTP `CONNECT` tunnelling proxy.
//!
//! Clients open a TCP connection, send `CONNECT host:port HTTP/1.1`, and once
//! the upstream is reached the proxy relays bytes in both directions. TLS is
//! passed through untouched; interception engines implement
//! [`ProxyEngine`](super::engine::ProxyEngine) the same way.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::engine::{ProxyEngine, ProxyInstance};

/// Largest request head we accept before giving up on a client.
const MAX_HEAD_LEN: usize = 8 * 1024;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a client gets to finish its request head.
const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Back-off after a failed accept (e.g. fd exhaustion) so the loop doesn't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Factory for [`TunnelProxy`] instances.
#[derive(Debug, Clone, Copy)]
pub struct TunnelEngine {
    connect_timeout: Duration,
    head_timeout: Duration,
}

impl TunnelEngine {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }

    /// Drop clients that haven't sent a full request head within `timeout`.
    pub fn with_head_timeout(mut self, timeout: Duration) -> Self {
        self.head_timeout = timeout;
        self
    }
}

impl Default for TunnelEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl ProxyEngine for TunnelEngine {
    type Instance = TunnelProxy;

    fn configure(&self, addr: SocketAddr) -> io::Result<TunnelProxy> {
        Ok(TunnelProxy {
            addr,
            settings: *self,
            running: None,
        })
    }
}

/// A `CONNECT` proxy bound to one address.
pub struct TunnelProxy {
    addr: SocketAddr,
    settings: TunnelEngine,
    running: Option<Running>,
}

/// Handles for a started accept loop.
struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyInstance for TunnelProxy {
    async fn start(&mut self) -> io::Result<()> {
        if self.running.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "proxy already started",
            ));
        }

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!("proxy listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, shutdown_rx, self.settings));

        self.running = Some(Running {
            local_addr,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    async fn close(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        // Wait for the loop to drop the listener so the port is free on return
        if let Err(e) = running.task.await {
            warn!("proxy accept loop ended abnormally: {}", e);
        }
        info!("proxy on {} stopped", running.local_addr);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }
}

impl Drop for TunnelProxy {
    fn drop(&mut self) {
        if let Some(ref running) = self.running {
            let _ = running.shutdown_tx.send(true);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    settings: TunnelEngine,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, settings).await {
                                debug!("connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    drop(listener);
    connections.shutdown().await;
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("client closed before sending a full request")]
    ClosedEarly,
    #[error("request head larger than 8 KiB")]
    HeadTooLarge,
    #[error("client sent no complete request head in time")]
    HeadTimeout,
    #[error("rejected request: {0}")]
    Rejected(Rejection),
    #[error("upstream {target} unreachable: {source}")]
    Upstream {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {target}")]
    UpstreamTimeout { target: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Why a request head was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    BadRequest,
    MethodNotAllowed,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::BadRequest => f.write_str("bad request"),
            Rejection::MethodNotAllowed => f.write_str("method not allowed"),
        }
    }
}

impl Rejection {
    fn response(self) -> &'static [u8] {
        match self {
            Rejection::BadRequest => RESPONSE_BAD_REQUEST,
            Rejection::MethodNotAllowed => RESPONSE_NOT_ALLOWED,
        }
    }
}

async fn handle_connection(
    mut client: TcpStream,
    settings: TunnelEngine,
) -> Result<(), TunnelError> {
    let head = tokio::time::timeout(settings.head_timeout, read_request_head(&mut client))
        .await
        .map_err(|_| TunnelError::HeadTimeout)?;

    let (head, leftover) = match head {
        Ok(parts) => parts,
        Err(TunnelError::HeadTooLarge) => {
            client.write_all(RESPONSE_BAD_REQUEST).await?;
            return Err(TunnelError::HeadTooLarge);
        }
        Err(e) => return Err(e),
    };

    let target = match parse_connect_target(&head) {
        Ok(target) => target,
        Err(rejection) => {
            client.write_all(rejection.response()).await?;
            return Err(TunnelError::Rejected(rejection));
        }
    };

    let connect = TcpStream::connect(&target);
    let mut upstream = match tokio::time::timeout(settings.connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            client.write_all(RESPONSE_BAD_GATEWAY).await?;
            return Err(TunnelError::Upstream { target, source });
        }
        Err(_) => {
            client.write_all(RESPONSE_BAD_GATEWAY).await?;
            return Err(TunnelError::UpstreamTimeout { target });
        }
    };

    client.write_all(RESPONSE_ESTABLISHED).await?;
    if !leftover.is_empty() {
        upstream.write_all(&leftover).await?;
    }

    let (sent, received) = copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(
        "tunnel to {} closed: {} bytes up, {} bytes down",
        target, sent, received
    );
    Ok(())
}

/// Read up to the blank line ending the request head.
///
/// Returns the head and any bytes the client already sent past it.
async fn read_request_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), TunnelError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(TunnelError::HeadTooLarge);
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::ClosedEarly);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Extract `host:port` from a `CONNECT` request head.
fn parse_connect_target(head: &[u8]) -> Result<String, Rejection> {
    let head = std::str::from_utf8(head).map_err(|_| Rejection::BadRequest)?;
    let request_line = head.lines().next().ok_or(Rejection::BadRequest)?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Rejection::BadRequest);
    };

    if !version.starts_with("HTTP/1.") {
        return Err(Rejection::BadRequest);
    }
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(Rejection::MethodNotAllowed);
    }

    let (host, port) = target.rsplit_once(':').ok_or(Rejection::BadRequest)?;
    if host.is_empty() || port.parse::<u16>().map_or(true, |p| p == 0) {
        return Err(Rejection::BadRequest);
    }

    Ok(target.to_string())
}
