//! gRPC service implementations
//!
//! [`ControlPlane`] implements both generated services on top of the session
//! registry and the command executor:
//!
//! - [`agent`]: `AgentService` (health, command execution)
//! - [`vpn`]: `VpnAgentService` (session notifications and session control)
//!
//! Handlers map domain errors to [`tonic::Status`] themselves. Policy and
//! execution failures of a command travel in the response payload; only
//! malformed requests and deadlines become transport errors.

pub mod agent;
pub mod user_config;
pub mod vpn;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tonic::metadata::MetadataMap;
use tonic::service::Routes;
use tonic::Status;

use crate::executor::{CommandExecutor, CommandOutput, ExecError};
use crate::proto::agent_service_server::AgentServiceServer;
use crate::proto::vpn_agent_service_server::VpnAgentServiceServer;
use crate::session::SessionStore;

use self::user_config::UserConfigWriter;

/// Request header carrying the caller's remaining time
const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Answer this long before the caller's deadline so our status wins over
/// tonic's own timeout, which reports `CANCELLED`
const DEADLINE_HEADROOM: Duration = Duration::from_millis(50);

/// Where per-user gateway configuration goes, and who writes it
#[derive(Clone)]
struct UserConfigTarget {
    dir: PathBuf,
    writer: Arc<dyn UserConfigWriter>,
}

/// State shared by every RPC handler
#[derive(Clone)]
pub struct ControlPlane {
    sessions: Arc<SessionStore>,
    executor: Arc<dyn CommandExecutor>,
    user_configs: Option<UserConfigTarget>,
    started_at: Instant,
}

impl ControlPlane {
    /// Create a control plane without per-user configuration support
    pub fn new(sessions: Arc<SessionStore>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            sessions,
            executor,
            user_configs: None,
            started_at: Instant::now(),
        }
    }

    /// Enable `UpdateUserRoutes`, writing files under `dir`
    pub fn with_user_config(
        mut self,
        dir: impl Into<PathBuf>,
        writer: Arc<dyn UserConfigWriter>,
    ) -> Self {
        self.user_configs = Some(UserConfigTarget {
            dir: dir.into(),
            writer,
        });
        self
    }

    /// The session registry the handlers write to
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Per-user configuration directory, if configured
    pub fn user_config_dir(&self) -> Option<&Path> {
        self.user_configs.as_ref().map(|t| t.dir.as_path())
    }

    /// Run a command bounded by the caller's deadline as well as the
    /// executor's own limit
    async fn run_command(
        &self,
        deadline: Option<Duration>,
        command_type: &str,
        args: &[String],
    ) -> Result<CommandOutput, ExecError> {
        let run = self.executor.execute(command_type, args);
        match deadline {
            None => run.await,
            Some(deadline) => tokio::time::timeout(deadline.saturating_sub(DEADLINE_HEADROOM), run)
                .await
                .map_err(|_| ExecError::DeadlineExceeded(deadline))?,
        }
    }

    /// Both services, ready to hand to the transport
    pub fn into_routes(self) -> Routes {
        Routes::new(AgentServiceServer::new(self.clone()))
            .add_service(VpnAgentServiceServer::new(self))
    }
}

/// Time the caller allows for this call, from its `grpc-timeout` header
pub fn caller_deadline(metadata: &MetadataMap) -> Option<Duration> {
    let value = metadata.get(GRPC_TIMEOUT_HEADER)?.to_str().ok()?;
    parse_grpc_timeout(value)
}

/// `grpc-timeout` is at most eight ASCII digits followed by a unit
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let split = value.len().checked_sub(1)?;
    if !value.is_char_boundary(split) {
        return None;
    }
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

/// Only deadlines are transport-level; everything else is reported in the payload
fn deadline_status(err: &ExecError) -> Option<Status> {
    match err {
        ExecError::DeadlineExceeded(limit) => Some(Status::deadline_exceeded(format!(
            "command did not finish within {:?}",
            limit
        ))),
        _ => None,
    }
}
