//! Accepted connections and the accept loop
//!
//! TLS handshakes run on their own task per connection so a slow or hostile
//! client cannot stall the listener. At most `max_handshakes` of them run at
//! once; further sockets wait in the kernel backlog until a slot frees up.
//! Only connections that completed the handshake (client certificate
//! verified) reach tonic.
//!
//! Every connection also watches the transport's abort token. Once it fires,
//! reads and writes fail with `ConnectionAborted`, which tears down in-flight
//! calls on a forceful stop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::transport::server::Connected;
use tracing::{debug, warn};

use super::mtls::common_name;

/// Upper bound for a client to finish the TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshakes allowed in flight at once
pub const MAX_PENDING_HANDSHAKES: usize = 256;

/// Pause after a failed `accept()` so fd exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Per-connection facts, available to every request as an extension
#[derive(Debug, Clone, Default)]
pub struct ConnInfo {
    /// Remote socket address
    pub remote_addr: Option<SocketAddr>,
    /// Common name of the verified client certificate (TLS only)
    pub peer_common_name: Option<String>,
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// A connection handed to tonic
pub struct AgentConn {
    stream: Stream,
    info: ConnInfo,
    abort: Pin<Box<WaitForCancellationFutureOwned>>,
    aborted: bool,
}

impl AgentConn {
    fn new(stream: Stream, info: ConnInfo, abort: CancellationToken) -> Self {
        Self {
            stream,
            info,
            abort: Box::pin(abort.cancelled_owned()),
            aborted: false,
        }
    }

    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.aborted && self.abort.as_mut().poll(cx).is_ready() {
            self.aborted = true;
        }
        self.aborted
    }
}

fn aborted_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "transport stopped")
}

impl Connected for AgentConn {
    type ConnectInfo = ConnInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

impl AsyncRead for AgentConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        match &mut this.stream {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AgentConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        match &mut this.stream {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        match &mut this.stream {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Accept connections until `shutdown` fires, feeding ready ones into `tx`
///
/// With `tls` set, each connection must complete the handshake within
/// [`HANDSHAKE_TIMEOUT`]; failures are logged and dropped. A slot is taken
/// before `accept()`, so no more than `max_handshakes` sockets are ever
/// between accept and handover.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    tx: mpsc::Sender<io::Result<AgentConn>>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    max_handshakes: usize,
) {
    let acceptor = tls.map(TlsAcceptor::from);
    let slots = Arc::new(Semaphore::new(max_handshakes.max(1)));

    loop {
        let slot = tokio::select! {
            _ = shutdown.cancelled() => break,
            slot = slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };

        let (tcp, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        let abort = abort.clone();
        tokio::spawn(async move {
            let conn = match acceptor {
                None => AgentConn::new(
                    Stream::Plain(tcp),
                    ConnInfo {
                        remote_addr: Some(remote),
                        peer_common_name: None,
                    },
                    abort,
                ),
                Some(acceptor) => match handshake(&acceptor, tcp, remote).await {
                    Some(tls) => {
                        let info = ConnInfo {
                            remote_addr: Some(remote),
                            peer_common_name: peer_common_name(&tls),
                        };
                        AgentConn::new(Stream::Tls(Box::new(tls)), info, abort)
                    }
                    None => return,
                },
            };
            drop(slot);

            debug!(peer = %remote, "Connection accepted");
            // Receiver gone means the server already stopped
            let _ = tx.send(Ok(conn)).await;
        });
    }
}

async fn handshake(
    acceptor: &TlsAcceptor,
    tcp: TcpStream,
    remote: SocketAddr,
) -> Option<TlsStream<TcpStream>> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(tls)) => Some(tls),
        Ok(Err(e)) => {
            warn!(peer = %remote, error = %e, "TLS handshake rejected");
            None
        }
        Err(_) => {
            warn!(peer = %remote, "TLS handshake timed out");
            None
        }
    }
}

fn peer_common_name(tls: &TlsStream<TcpStream>) -> Option<String> {
    let (_, session) = tls.get_ref();
    let leaf = session.peer_certificates()?.first()?;
    common_name(leaf).ok().flatten()
}
