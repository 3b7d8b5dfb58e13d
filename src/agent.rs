//! Process wiring
//!
//! [`Agent`] turns an [`AgentConfig`] into running components: certificates,
//! transport, session registry, executor, and the control plane. [`Agent::run`]
//! serves until the shutdown signal, drains for up to
//! [`GRACEFUL_STOP_TIMEOUT`], then forces the transport down and stops the
//! registry's sweeper and the session gauge publisher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AgentConfig, CertificateProvisioning};
use crate::executor::ProcessExecutor;
use crate::metrics;
use crate::service::user_config::OcservUserConfigWriter;
use crate::service::ControlPlane;
use crate::session::SessionStore;
use crate::transport::{AgentTransport, TransportConfig};
use crate::Result;

/// How long in-flight calls get to finish after a shutdown signal
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully wired agent
pub struct Agent {
    config: AgentConfig,
    transport: Arc<AgentTransport>,
    plane: ControlPlane,
    sessions: Arc<SessionStore>,
    lifetime: CancellationToken,
}

impl Agent {
    /// Build every component from `config`
    ///
    /// Generates TLS material first when it is missing and allowed, so the
    /// transport can load it.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        match config.ensure_certificates()? {
            CertificateProvisioning::Disabled => {}
            CertificateProvisioning::Reused { problem: None } => {
                info!(cert = %config.tls.cert_file, "Using existing TLS material");
            }
            CertificateProvisioning::Reused {
                problem: Some(problem),
            } => {
                warn!(
                    cert = %config.tls.cert_file,
                    ca = %config.tls.ca_file,
                    problem = %problem,
                    "Existing TLS material does not verify, clients may reject it"
                );
            }
            CertificateProvisioning::Generated(material) => {
                info!(
                    subject = %material.subject,
                    ca_fingerprint = %material.ca_fingerprint,
                    cert_fingerprint = %material.cert_fingerprint,
                    valid_from = %material.valid_from,
                    valid_until = %material.valid_until,
                    "Generated bootstrap CA and agent certificate"
                );
            }
        }

        let transport = TransportConfig::configure(
            config.tls.enabled,
            &config.tls.cert_file,
            &config.tls.key_file,
            &config.tls.ca_file,
            config.tls.min_version,
        )?;

        let lifetime = CancellationToken::new();
        let sessions = Arc::new(SessionStore::with_cancellation(
            config.sessions.ttl(),
            lifetime.child_token(),
        ));
        let executor = Arc::new(ProcessExecutor::new(config.executor_config()));

        let mut plane = ControlPlane::new(sessions.clone(), executor);
        if let Some(dir) = &config.gateway.per_user_config_dir {
            plane = plane.with_user_config(dir, Arc::new(OcservUserConfigWriter));
        }

        Ok(Self {
            config,
            transport: Arc::new(AgentTransport::new(transport)),
            plane,
            sessions,
            lifetime,
        })
    }

    /// The transport, for observing its state
    pub fn transport(&self) -> &Arc<AgentTransport> {
        &self.transport
    }

    /// The session registry
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Serve until `shutdown` resolves or the transport fails
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.config.listen_addr()?;
        info!(
            agent_id = %self.config.agent_id,
            address = %addr,
            session_ttl = ?self.config.sessions.ttl(),
            "Starting agent"
        );

        let gauges = tokio::spawn(metrics::publish_session_gauges(
            self.sessions.clone(),
            metrics::SESSION_GAUGE_INTERVAL,
            self.lifetime.child_token(),
        ));

        let server = self.transport.listen(addr, self.plane.clone().into_routes());
        tokio::pin!(server);

        let result = tokio::select! {
            result = &mut server => result,
            _ = shutdown => {
                info!(timeout = ?GRACEFUL_STOP_TIMEOUT, "Shutdown requested, draining in-flight calls");
                self.transport.graceful_stop();
                match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, &mut server).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Drain timed out, aborting remaining calls");
                        self.transport.stop();
                        server.await
                    }
                }
            }
        };

        self.lifetime.cancel();
        if let Err(e) = gauges.await {
            warn!(error = %e, "Session gauge publisher failed");
        }
        self.sessions.shutdown().await;
        info!("Agent stopped");
        result.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportState;

    fn plaintext_config() -> AgentConfig {
        let mut config = AgentConfig::parse(
            "agent_id: test\nlisten_address: 127.0.0.1:0\ntls:\n  enabled: false\n",
            std::path::Path::new("test.yaml"),
        )
        .unwrap();
        config.sessions.ttl_secs = 60;
        config
    }

    #[tokio::test]
    async fn runs_until_shutdown_signal() {
        let agent = Agent::from_config(plaintext_config()).unwrap();
        let transport = agent.transport().clone();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(agent.run(async {
            let _ = rx.await;
        }));

        tokio::time::timeout(Duration::from_secs(5), transport.wait_for(TransportState::Listening))
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Listening);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(transport.state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn bind_failure_ends_run() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = plaintext_config();
        config.listen_address = taken.local_addr().unwrap().to_string();

        let agent = Agent::from_config(config).unwrap();
        let err = agent.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, crate::Error::Transport(_)));
    }

    /// Story: a fresh host with auto-generation on gets working mTLS material
    #[tokio::test]
    async fn story_tls_agent_bootstraps_its_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = plaintext_config();
        config.hostname = Some("gw01".to_string());
        config.tls.enabled = true;
        config.tls.cert_file = dir.path().join("agent.crt").display().to_string();
        config.tls.key_file = dir.path().join("agent.key").display().to_string();
        config.tls.ca_file = dir.path().join("ca.crt").display().to_string();

        let agent = Agent::from_config(config).unwrap();
        assert!(dir.path().join("agent.key").exists());
        assert_eq!(agent.transport().state(), TransportState::Created);
    }

    #[test]
    fn missing_material_without_auto_generate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = plaintext_config();
        config.tls.enabled = true;
        config.tls.auto_generate = false;
        config.tls.cert_file = dir.path().join("agent.crt").display().to_string();

        let result = Agent::from_config(config);
        assert!(matches!(result, Err(crate::Error::Mtls(_))));
    }
}
