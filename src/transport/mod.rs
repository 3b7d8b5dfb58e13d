//! Secure RPC transport
//!
//! Owns the TCP listener, the TLS acceptor, and the interceptor chain, and
//! serves whatever [`Routes`] it is given.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──listen──▶ Listening ──graceful_stop──▶ Draining ──▶ Stopped
//!                         │                                        ▲
//!                         └───────────────stop─────────────────────┘
//! ```
//!
//! - `listen` blocks until the server stops or fails
//! - `graceful_stop` refuses new connections and lets in-flight calls finish
//! - `stop` aborts in-flight calls immediately
//!
//! Both stop calls are idempotent and may come from any task.

pub mod conn;
pub mod interceptor;
pub mod mtls;

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ServerConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::Server;
use tracing::{error, info, warn};

use self::conn::{accept_loop, MAX_PENDING_HANDSHAKES};
use self::interceptor::interceptor_chain;
use self::mtls::{MtlsError, TlsVersion, TrustBundle};

/// Connections that finished their handshake but were not yet picked up by tonic
const PENDING_CONNECTIONS: usize = 128;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound
        addr: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// `listen` was called on a transport that is already running or stopped
    #[error("transport cannot listen from state {0:?}")]
    InvalidState(TransportState),

    /// The server failed while serving
    #[error("server error: {0}")]
    Serve(#[from] tonic::transport::Error),
}

/// Where the transport is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Configured, not yet listening
    Created,
    /// Accepting connections
    Listening,
    /// Graceful stop requested, in-flight calls finishing
    Draining,
    /// No longer serving
    Stopped,
}

/// TLS settings resolved once at startup
#[derive(Clone)]
pub struct TransportConfig {
    tls: Option<Arc<ServerConfig>>,
}

impl TransportConfig {
    /// Resolve TLS settings from file paths
    ///
    /// With TLS enabled the three files are read once into a [`TrustBundle`].
    /// With TLS disabled the paths are ignored and the transport serves
    /// plaintext.
    pub fn configure(
        tls_enabled: bool,
        cert_file: &str,
        key_file: &str,
        ca_file: &str,
        min_version: TlsVersion,
    ) -> Result<Self, MtlsError> {
        if !tls_enabled {
            return Ok(Self::insecure());
        }
        let bundle = TrustBundle::load(cert_file, key_file, ca_file)?;
        Self::mutual_tls(&bundle, min_version)
    }

    /// Require client certificates chained to the bundle's roots
    pub fn mutual_tls(bundle: &TrustBundle, min_version: TlsVersion) -> Result<Self, MtlsError> {
        Ok(Self {
            tls: Some(bundle.server_config(min_version)?),
        })
    }

    /// Plaintext, for local testing only
    pub fn insecure() -> Self {
        Self { tls: None }
    }

    /// Whether connections are TLS-protected
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}

/// gRPC server with mTLS, logging, and panic containment
pub struct AgentTransport {
    config: TransportConfig,
    state: watch::Sender<TransportState>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl AgentTransport {
    /// Create a transport in the `Created` state
    pub fn new(config: TransportConfig) -> Self {
        let (state, _) = watch::channel(TransportState::Created);
        Self {
            config,
            state,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Wait until the transport reaches `target`
    ///
    /// Returns immediately if it is already there. States only move forward,
    /// so waiting for `Listening` also returns once the transport stopped.
    pub async fn wait_for(&self, target: TransportState) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == target || *state == TransportState::Stopped)
            .await;
    }

    /// Bind `addr` and serve `routes` until stopped
    ///
    /// A bind failure is returned at once; nothing is retried.
    pub async fn listen(&self, addr: SocketAddr, routes: Routes) -> Result<(), TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        self.serve(listener, routes).await
    }

    /// Serve `routes` on an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener, routes: Routes) -> Result<(), TransportError> {
        let started = self.state.send_if_modified(|state| {
            if *state == TransportState::Created {
                *state = TransportState::Listening;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(TransportError::InvalidState(self.state()));
        }

        let local_addr = listener.local_addr().ok();
        if self.config.tls_enabled() {
            info!(address = ?local_addr, tls = true, "gRPC server listening with mutual TLS");
        } else {
            warn!(
                address = ?local_addr,
                tls = false,
                "gRPC server listening WITHOUT TLS - plaintext mode is for local testing only"
            );
        }

        let (tx, rx) = mpsc::channel(PENDING_CONNECTIONS);
        let acceptor = tokio::spawn(accept_loop(
            listener,
            self.config.tls.clone(),
            tx,
            self.shutdown.clone(),
            self.abort.clone(),
            MAX_PENDING_HANDSHAKES,
        ));

        let server = Server::builder()
            .layer(interceptor_chain())
            .add_routes(routes)
            .serve_with_incoming_shutdown(
                ReceiverStream::new(rx),
                self.shutdown.clone().cancelled_owned(),
            );

        let result = tokio::select! {
            result = server => result.map_err(TransportError::from),
            _ = self.abort.cancelled() => {
                warn!("gRPC server stopped forcefully, in-flight calls aborted");
                Ok(())
            }
        };

        // The accept loop only watches `shutdown`
        self.shutdown.cancel();
        let _ = acceptor.await;

        self.state.send_replace(TransportState::Stopped);
        match &result {
            Ok(()) => info!("gRPC server stopped"),
            Err(e) => error!(error = %e, "gRPC server failed"),
        }
        result
    }

    /// Stop accepting, let in-flight calls finish
    pub fn graceful_stop(&self) {
        self.state.send_if_modified(|state| match *state {
            TransportState::Listening => {
                *state = TransportState::Draining;
                true
            }
            TransportState::Created => {
                *state = TransportState::Stopped;
                true
            }
            TransportState::Draining | TransportState::Stopped => false,
        });
        self.shutdown.cancel();
    }

    /// Stop immediately, aborting in-flight calls
    pub fn stop(&self) {
        self.state.send_if_modified(|state| {
            if *state == TransportState::Created {
                *state = TransportState::Stopped;
                true
            } else {
                false
            }
        });
        self.abort.cancel();
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::proto::agent_service_server::AgentServiceServer;
    use crate::service::ControlPlane;
    use crate::session::SessionStore;

    fn routes() -> Routes {
        let plane = ControlPlane::new(
            Arc::new(SessionStore::new(None)),
            Arc::new(crate::executor::MockCommandExecutor::new()),
        );
        Routes::new(AgentServiceServer::new(plane))
    }

    #[test]
    fn insecure_config_has_no_tls() {
        assert!(!TransportConfig::insecure().tls_enabled());
        let config = TransportConfig::configure(false, "", "", "", TlsVersion::Tls13).unwrap();
        assert!(!config.tls_enabled());
    }

    #[test]
    fn configure_with_missing_files_fails() {
        let result = TransportConfig::configure(
            true,
            "/nonexistent/agent.crt",
            "/nonexistent/agent.key",
            "/nonexistent/ca.crt",
            TlsVersion::Tls13,
        );
        assert!(matches!(result, Err(MtlsError::Read { .. })));
    }

    #[test]
    fn stop_before_listen_is_terminal() {
        let transport = AgentTransport::new(TransportConfig::insecure());
        assert_eq!(transport.state(), TransportState::Created);

        transport.graceful_stop();
        assert_eq!(transport.state(), TransportState::Stopped);

        // Idempotent
        transport.graceful_stop();
        transport.stop();
        assert_eq!(transport.state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn listen_after_stop_is_rejected() {
        let transport = AgentTransport::new(TransportConfig::insecure());
        transport.stop();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = transport.serve(listener, routes()).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::InvalidState(TransportState::Stopped)
        ));
    }

    #[tokio::test]
    async fn bind_failure_returned_immediately() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let transport = AgentTransport::new(TransportConfig::insecure());
        let err = transport.listen(addr, routes()).await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { addr: a, .. } if a == addr));
        assert_eq!(transport.state(), TransportState::Created);
    }

    #[tokio::test]
    async fn graceful_stop_moves_through_draining() {
        let transport = Arc::new(AgentTransport::new(TransportConfig::insecure()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let server = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.serve(listener, routes()).await })
        };

        tokio::time::timeout(Duration::from_secs(5), transport.wait_for(TransportState::Listening))
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Listening);

        transport.graceful_stop();
        assert!(matches!(
            transport.state(),
            TransportState::Draining | TransportState::Stopped
        ));

        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(transport.state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn forceful_stop_ends_listen() {
        let transport = Arc::new(AgentTransport::new(TransportConfig::insecure()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let server = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.serve(listener, routes()).await })
        };
        transport.wait_for(TransportState::Listening).await;

        transport.stop();
        transport.stop();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(transport.state(), TransportState::Stopped);
    }
}
