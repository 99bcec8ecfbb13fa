//! One-message-per-connection transport over plain TCP or mutual TLS.
//!
//! A sender opens a connection, writes one encoded message and closes its write half. The
//! listener reads until EOF, decodes, and hands the message to a [`MessageHandler`]. Each
//! accepted connection is served on its own task, so a peer that stalls mid-handshake or
//! mid-message holds up nobody else. Handlers must therefore tolerate messages arriving in any
//! order.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, MAX_MESSAGE_BYTES};
use crate::tls::{is_tls_mismatch_error, TlsContext};

/// Receives every successfully decoded message on a listener.
///
/// Errors returned here are logged by the accept loop and never stop it.
pub trait MessageHandler<M>: Send + Sync + 'static {
    fn handle(&self, message: M) -> BoxFuture<'_, Result<()>>;
}

/// How `send_with_retry` behaves while a peer is unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed pause between attempts.
    pub delay: Duration,
    /// `None` retries until cancelled.
    pub max_attempts: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            delay: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

/// Plain-TCP or mutual-TLS message channel.
///
/// # Examples
///
/// ```ignore
/// let transport = Transport::plain();
/// transport.send("127.0.0.1:8001".parse()?, &request).await?;
/// ```
#[derive(Clone, Default)]
pub struct Transport {
    tls: Option<TlsContext>,
}

/// A running accept loop.
pub struct Listener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Listener {
    /// The bound address; useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the accept loop to exit after its shutdown token is cancelled.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|err| Error::Transport(io::Error::new(io::ErrorKind::Other, err)))
    }
}

impl Transport {
    pub fn plain() -> Self {
        Transport { tls: None }
    }

    pub fn tls(context: TlsContext) -> Self {
        Transport { tls: Some(context) }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Binds `addr` and spawns the accept loop on a background task.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to bind; port 0 picks a free port.
    /// * `name` - Label used in log lines.
    /// * `handler` - Receives each decoded message.
    /// * `shutdown` - Cancelling it closes the listening socket and abandons every connection
    ///   still being read or dispatched.
    pub async fn listen<M, H>(
        &self,
        addr: SocketAddr,
        name: &str,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<Listener>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        let name = name.to_string();
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("[{}] Listening on {}", name, local_addr);

        let task = tokio::spawn(accept_loop::<M, H>(
            listener,
            self.tls.clone(),
            handler,
            shutdown,
            name,
        ));
        Ok(Listener { local_addr, task })
    }

    /// Opens a connection to `addr`, writes one message and closes.
    pub async fn send<M: Serialize + Sync>(&self, addr: SocketAddr, message: &M) -> Result<()> {
        let bytes = protocol::encode(message)?;
        let stream = TcpStream::connect(addr).await?;
        match &self.tls {
            Some(context) => {
                let stream = context
                    .connector()
                    .connect(context.server_name(), stream)
                    .await
                    .map_err(|err| {
                        if is_tls_mismatch_error(&err) {
                            error!("Perhaps {} is not accepting TLS connections", addr);
                        }
                        Error::Tls(format!("handshake with {addr} failed: {err}"))
                    })?;
                write_message(stream, &bytes).await
            }
            None => write_message(stream, &bytes).await,
        }
    }

    /// Like [`Transport::send`], but waits and retries while the peer is unreachable.
    ///
    /// Only connection-level errors are retried; TLS and encoding failures return at once.
    /// Returns `Error::Cancelled` as soon as `shutdown` fires.
    pub async fn send_with_retry<M: Serialize + Sync>(
        &self,
        addr: SocketAddr,
        message: &M,
        policy: &RetryPolicy,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = shutdown.cancelled() => return Err(Error::Cancelled),
                result = self.send(addr, message) => result,
            };

            match result {
                Ok(()) => {
                    if attempt > 1 {
                        info!("Reached {} after {} attempts", addr, attempt);
                    }
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    if policy.max_attempts.is_some_and(|max| attempt >= max) {
                        warn!("⏳ {} still not available after {} attempts", addr, attempt);
                        return Err(err);
                    }
                    warn!(
                        "{} not ready ({}), retrying in {:?} (attempt {})",
                        addr, err, policy.delay, attempt
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(policy.delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn accept_loop<M, H>(
    listener: TcpListener,
    tls: Option<TlsContext>,
    handler: Arc<H>,
    shutdown: CancellationToken,
    name: String,
) where
    M: DeserializeOwned + Send + 'static,
    H: MessageHandler<M>,
{
    let mut connections = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = finished {
                    error!("[{}] Connection task failed: {}", name, err);
                }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("[{}] Server error: {}", name, err);
                    continue;
                }
            },
        };
        debug!("[{}] Accepted connection from {}", name, peer);

        let tls = tls.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        let name = name.clone();
        connections.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("[{}] Abandoned connection from {} on shutdown", name, peer);
                }
                _ = serve_connection::<M, H>(stream, peer, tls.as_ref(), handler.as_ref(), &name) => {}
            }
        });
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    info!("[{}] Clean shutdown.", name);
}

async fn serve_connection<M, H>(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<&TlsContext>,
    handler: &H,
    name: &str,
) where
    M: DeserializeOwned + Send + 'static,
    H: MessageHandler<M>,
{
    let bytes = match receive(stream, peer, tls).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("[{}] Dropped connection from {}: {}", name, peer, err);
            return;
        }
    };

    let message: M = match protocol::decode(&bytes) {
        Ok(message) => message,
        Err(err) => {
            error!("[{}] Failed to decode message from {}: {}", name, peer, err);
            return;
        }
    };

    if let Err(err) = handler.handle(message).await {
        error!("[{}] Failed to process message from {}: {}", name, peer, err);
    }
}

async fn receive(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<&TlsContext>,
) -> Result<Vec<u8>> {
    match tls {
        Some(context) => {
            let stream = context.acceptor().accept(stream).await.map_err(|err| {
                if is_tls_mismatch_error(&err) {
                    warn!("Perhaps {} is connecting without TLS", peer);
                }
                Error::Tls(format!("handshake with {peer} failed: {err}"))
            })?;
            read_message(stream).await
        }
        None => read_message(stream).await,
    }
}

async fn read_message<S: AsyncRead + Unpin>(stream: S) -> Result<Vec<u8>> {
    let mut limited = stream.take(MAX_MESSAGE_BYTES as u64 + 1);
    let mut buf = Vec::new();
    limited.read_to_end(&mut buf).await?;
    if buf.len() > MAX_MESSAGE_BYTES {
        return Err(Error::Codec(format!(
            "message exceeds {MAX_MESSAGE_BYTES} bytes"
        )));
    }
    Ok(buf)
}

async fn write_message<S: AsyncWrite + Unpin>(mut stream: S, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes).await?;
    stream.shutdown().await?;
    Ok(())
}
