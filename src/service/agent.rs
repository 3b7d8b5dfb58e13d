//! `AgentService`: health checks and gateway command execution

use std::collections::HashMap;
use std::pin::Pin;
use std::time::SystemTime;

use futures::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, instrument, warn};

use crate::proto::agent_service_server::AgentService;
use crate::proto::{
    AgentMessage, CommandRequest, CommandResponse, ConfigUpdateRequest, ConfigUpdateResponse,
    HealthCheckRequest, HealthCheckResponse, LogEntry, LogStreamRequest, ServerMessage,
};

use super::{caller_deadline, deadline_status, ControlPlane};

/// Value reported for checks that exist in the schema but are not wired up yet
pub const NOT_IMPLEMENTED: &str = "not implemented";

/// Exit code reported when the command never ran
const NO_EXIT_CODE: i32 = -1;

impl ControlPlane {
    fn health_report(&self, tier: i32) -> Result<HealthCheckResponse, Status> {
        if !(1..=3).contains(&tier) {
            return Err(Status::invalid_argument(format!(
                "health check tier must be 1, 2, or 3, got {}",
                tier
            )));
        }

        let mut checks = HashMap::new();
        checks.insert("agent".to_string(), "ok".to_string());
        checks.insert("config".to_string(), "ok".to_string());
        checks.insert(
            "uptime".to_string(),
            format!("{}s", self.started_at.elapsed().as_secs()),
        );

        if tier >= 2 {
            checks.insert(
                "sessions".to_string(),
                format!("ok ({} active)", self.sessions.count()),
            );
            for placeholder in ["memory", "gateway_process"] {
                checks.insert(placeholder.to_string(), NOT_IMPLEMENTED.to_string());
            }
        }
        if tier == 3 {
            for placeholder in ["gateway_control", "config_dirs"] {
                checks.insert(placeholder.to_string(), NOT_IMPLEMENTED.to_string());
            }
        }

        let (healthy, status_message) = match tier {
            1 => (true, "agent is running"),
            2 => (true, "component checks passed; memory and gateway checks are placeholders"),
            _ => (false, "end-to-end checks are not implemented"),
        };

        Ok(HealthCheckResponse {
            healthy,
            status_message: status_message.to_string(),
            checks,
            timestamp: Some(prost_types::Timestamp::from(SystemTime::now())),
        })
    }
}

#[tonic::async_trait]
impl AgentService for ControlPlane {
    #[instrument(skip(self, request))]
    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let tier = request.into_inner().tier;
        self.health_report(tier).map(Response::new)
    }

    #[instrument(
        skip(self, request),
        fields(request_id = tracing::field::Empty, command_type = tracing::field::Empty)
    )]
    async fn execute_command(
        &self,
        request: Request<CommandRequest>,
    ) -> Result<Response<CommandResponse>, Status> {
        let deadline = caller_deadline(request.metadata());
        let req = request.into_inner();
        let span = tracing::Span::current();
        span.record("request_id", req.request_id.as_str());
        span.record("command_type", req.command_type.as_str());

        let response = match self
            .run_command(deadline, &req.command_type, &req.args)
            .await
        {
            Ok(output) => {
                info!(
                    success = output.success,
                    exit_code = output.exit_code,
                    "Command finished"
                );
                CommandResponse {
                    request_id: req.request_id,
                    success: output.success,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code,
                    error_message: output.error_message,
                }
            }
            Err(e) => {
                if let Some(status) = deadline_status(&e) {
                    warn!(error = %e, "Command timed out");
                    return Err(status);
                }
                warn!(error = %e, "Command rejected");
                CommandResponse {
                    request_id: req.request_id,
                    success: false,
                    exit_code: NO_EXIT_CODE,
                    error_message: e.to_string(),
                    ..Default::default()
                }
            }
        };

        Ok(Response::new(response))
    }

    async fn update_config(
        &self,
        _request: Request<ConfigUpdateRequest>,
    ) -> Result<Response<ConfigUpdateResponse>, Status> {
        Err(Status::unimplemented("UpdateConfig is not implemented"))
    }

    type StreamLogsStream = Pin<Box<dyn Stream<Item = Result<LogEntry, Status>> + Send + 'static>>;

    async fn stream_logs(
        &self,
        _request: Request<LogStreamRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        Err(Status::unimplemented("StreamLogs is not implemented"))
    }

    type AgentStreamStream =
        Pin<Box<dyn Stream<Item = Result<ServerMessage, Status>> + Send + 'static>>;

    async fn agent_stream(
        &self,
        _request: Request<Streaming<AgentMessage>>,
    ) -> Result<Response<Self::AgentStreamStream>, Status> {
        Err(Status::unimplemented("AgentStream is not implemented"))
    }
}
