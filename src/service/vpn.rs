//! `VpnAgentService`: session notifications and session control
//!
//! The gateway calls `NotifyConnect` and `NotifyDisconnect` from its connect
//! and disconnect hooks; the remote controller calls the rest. Registry
//! failures during notifications are logged and never block a client.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use crate::executor::{CommandOutput, ExecError};
use crate::proto::vpn_agent_service_server::VpnAgentService;
use crate::proto::{
    self, DisconnectUserRequest, DisconnectUserResponse, GetActiveSessionsRequest,
    GetActiveSessionsResponse, NotifyConnectRequest, NotifyConnectResponse,
    NotifyDisconnectRequest, NotifyDisconnectResponse, UpdateUserRoutesRequest,
    UpdateUserRoutesResponse,
};
use crate::session::VpnSession;

use super::user_config::UserRouteUpdate;
use super::{caller_deadline, deadline_status, ControlPlane};

/// Longest username accepted as a file name
const MAX_USERNAME_LEN: usize = 64;

/// Gateway control program used to drop live connections
const GATEWAY_CONTROL: &str = "occtl";

impl ControlPlane {
    /// Ask the gateway to drop every connection of `username`
    async fn disconnect_gateway_user(
        &self,
        username: &str,
        deadline: Option<Duration>,
    ) -> Result<CommandOutput, ExecError> {
        let args = ["disconnect", "user", username].map(String::from);
        self.run_command(deadline, GATEWAY_CONTROL, &args).await
    }
}

fn timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp::from(SystemTime::from(at))
}

fn to_proto(session: VpnSession, include_stats: bool) -> proto::VpnSession {
    let mut metadata = if include_stats {
        session.metadata
    } else {
        HashMap::new()
    };
    if include_stats {
        if let Some(last) = session.last_activity {
            metadata.insert(
                "last_activity".to_string(),
                last.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        if let Some(expires) = session.expires_at {
            metadata.insert(
                "expires_at".to_string(),
                expires.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
    }

    proto::VpnSession {
        session_id: session.session_id,
        username: session.username,
        client_ip: session.client_ip,
        vpn_ip: session.vpn_ip,
        device_id: session.device_id,
        connected_at: session.connected_at.map(timestamp),
        bytes_in: session.bytes_in,
        bytes_out: session.bytes_out,
        metadata,
    }
}

/// A username that can be used verbatim as a file name
fn is_safe_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_USERNAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'))
}

/// Best description of why a command that ran did not succeed
fn failure_message(output: &CommandOutput) -> String {
    if !output.error_message.is_empty() {
        output.error_message.clone()
    } else if !output.stderr.trim().is_empty() {
        output.stderr.trim().to_string()
    } else {
        format!("exited with code {}", output.exit_code)
    }
}

fn saturating_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[tonic::async_trait]
impl VpnAgentService for ControlPlane {
    #[instrument(skip(self, request))]
    async fn notify_connect(
        &self,
        request: Request<NotifyConnectRequest>,
    ) -> Result<Response<NotifyConnectResponse>, Status> {
        let req = request.into_inner();
        info!(
            session_id = %req.session_id,
            username = %req.username,
            client_ip = %req.client_ip,
            vpn_ip = %req.vpn_ip,
            "VPN client connected"
        );

        let session = VpnSession {
            session_id: req.session_id,
            username: req.username,
            client_ip: req.client_ip,
            vpn_ip: req.vpn_ip,
            device_id: req.device_id,
            metadata: req.metadata,
            ..Default::default()
        };
        let session_id = session.session_id.clone();

        // Admission is not gated on the registry
        match self.sessions.add(session) {
            Ok(()) => info!(
                session_id = %session_id,
                total_sessions = self.sessions.count(),
                "Session recorded"
            ),
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to record session"),
        }

        Ok(Response::new(NotifyConnectResponse {
            allowed: true,
            ..Default::default()
        }))
    }

    #[instrument(skip(self, request))]
    async fn notify_disconnect(
        &self,
        request: Request<NotifyDisconnectRequest>,
    ) -> Result<Response<NotifyDisconnectResponse>, Status> {
        let req = request.into_inner();
        info!(
            session_id = %req.session_id,
            username = %req.username,
            reason = %req.disconnect_reason,
            bytes_in = req.bytes_in,
            bytes_out = req.bytes_out,
            duration_secs = req.duration_seconds,
            "VPN client disconnected"
        );

        // Either call may race with expiry; absence is not an error here
        if let Err(e) = self
            .sessions
            .update_stats(&req.session_id, req.bytes_in, req.bytes_out)
        {
            if !e.is_unavailable() {
                warn!(session_id = %req.session_id, error = %e, "Failed to update session stats");
            }
        }
        match self.sessions.remove(&req.session_id) {
            Ok(()) => info!(
                session_id = %req.session_id,
                remaining_sessions = self.sessions.count(),
                "Session removed"
            ),
            Err(e) if e.is_unavailable() => {
                info!(session_id = %req.session_id, "Session already gone")
            }
            Err(e) => warn!(session_id = %req.session_id, error = %e, "Failed to remove session"),
        }

        Ok(Response::new(NotifyDisconnectResponse {
            acknowledged: true,
            message: "disconnect notification received".to_string(),
        }))
    }

    #[instrument(skip(self, request))]
    async fn get_active_sessions(
        &self,
        request: Request<GetActiveSessionsRequest>,
    ) -> Result<Response<GetActiveSessionsResponse>, Status> {
        let req = request.into_inner();
        let sessions = if req.username_filter.is_empty() {
            self.sessions.list()
        } else {
            self.sessions.list_by_username(&req.username_filter)
        };

        let sessions: Vec<_> = sessions
            .into_iter()
            .map(|s| to_proto(s, req.include_stats))
            .collect();
        info!(
            username_filter = %req.username_filter,
            count = sessions.len(),
            "Listed active sessions"
        );

        Ok(Response::new(GetActiveSessionsResponse {
            total_count: saturating_i32(sessions.len()),
            sessions,
        }))
    }

    #[instrument(skip(self, request))]
    async fn disconnect_user(
        &self,
        request: Request<DisconnectUserRequest>,
    ) -> Result<Response<DisconnectUserResponse>, Status> {
        let deadline = caller_deadline(request.metadata());
        let req = request.into_inner();
        if req.username.is_empty() {
            return Err(Status::invalid_argument("username is required"));
        }
        info!(username = %req.username, reason = %req.reason, "Disconnecting user");

        let response = match self.disconnect_gateway_user(&req.username, deadline).await {
            Ok(output) if output.success => {
                let removed = self.sessions.remove_by_username(&req.username);
                info!(username = %req.username, sessions = removed, "User disconnected");
                DisconnectUserResponse {
                    success: true,
                    sessions_disconnected: saturating_i32(removed),
                    error_message: String::new(),
                }
            }
            Ok(output) => {
                let message = failure_message(&output);
                warn!(username = %req.username, error = %message, "Gateway refused disconnect");
                DisconnectUserResponse {
                    success: false,
                    sessions_disconnected: 0,
                    error_message: message,
                }
            }
            Err(e) => {
                if let Some(status) = deadline_status(&e) {
                    return Err(status);
                }
                warn!(username = %req.username, error = %e, "Failed to disconnect user");
                DisconnectUserResponse {
                    success: false,
                    sessions_disconnected: 0,
                    error_message: e.to_string(),
                }
            }
        };

        Ok(Response::new(response))
    }

    #[instrument(skip(self, request))]
    async fn update_user_routes(
        &self,
        request: Request<UpdateUserRoutesRequest>,
    ) -> Result<Response<UpdateUserRoutesResponse>, Status> {
        let deadline = caller_deadline(request.metadata());
        let req = request.into_inner();
        if req.username.is_empty() {
            return Err(Status::invalid_argument("username is required"));
        }
        if !is_safe_username(&req.username) {
            return Err(Status::invalid_argument(format!(
                "username {:?} cannot be used as a configuration file name",
                req.username
            )));
        }

        let Some(target) = &self.user_configs else {
            return Ok(Response::new(UpdateUserRoutesResponse {
                success: false,
                error_message: "per-user configuration directory is not configured".to_string(),
                ..Default::default()
            }));
        };

        let path = target.dir.join(&req.username);
        info!(
            username = %req.username,
            path = %path.display(),
            routes = req.routes.len(),
            dns_servers = req.dns_servers.len(),
            "Updating user routes"
        );

        let update = UserRouteUpdate {
            username: req.username.clone(),
            routes: req.routes,
            dns_servers: req.dns_servers,
            directives: req.config_params.into_iter().collect(),
        };
        if let Err(e) = target.writer.write_user_config(&path, &update).await {
            warn!(username = %req.username, error = %e, "Failed to write user configuration");
            return Ok(Response::new(UpdateUserRoutesResponse {
                success: false,
                error_message: format!("failed to write user configuration: {}", e),
                ..Default::default()
            }));
        }

        let mut user_reconnected = false;
        if req.reload_if_connected && self.sessions.count_by_username(&req.username) > 0 {
            // The client picks up the new file when it reconnects
            match self.disconnect_gateway_user(&req.username, deadline).await {
                Ok(output) if output.success => {
                    let removed = self.sessions.remove_by_username(&req.username);
                    info!(username = %req.username, sessions = removed, "User disconnected to apply routes");
                    user_reconnected = true;
                }
                Ok(output) => warn!(
                    username = %req.username,
                    error = %failure_message(&output),
                    "Failed to disconnect user for reconnect"
                ),
                Err(e) => warn!(
                    username = %req.username,
                    error = %e,
                    "Failed to disconnect user for reconnect"
                ),
            }
        }

        Ok(Response::new(UpdateUserRoutesResponse {
            success: true,
            config_path: path.display().to_string(),
            user_reconnected,
            error_message: String::new(),
        }))
    }
}
