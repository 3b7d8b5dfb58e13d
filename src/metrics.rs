//! OpenTelemetry metrics for the agent
//!
//! Instruments come from the global meter, so nothing is exported until
//! [`crate::telemetry::init_metrics`] installs a provider. Until then every
//! recording is a no-op.
//!
//! - RPC calls (count and latency per method and status code)
//! - Gateway commands (count, latency, failures)
//! - Live sessions and connected users, sampled from the registry

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tonic::Code;

use crate::executor::{CommandOutput, ExecError};
use crate::session::{SessionStats, SessionStore};

/// How often the session gauges are refreshed from the registry
pub const SESSION_GAUGE_INTERVAL: Duration = Duration::from_secs(15);

/// Global meter for warden metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("warden"));

// ============================================================================
// RPC Metrics
// ============================================================================

/// Counter of RPC calls
///
/// Labels:
/// - `method`: full gRPC path
/// - `code`: gRPC status code name, or `transport_error`
pub static RPC_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("warden_grpc_requests_total")
        .with_description("Total number of gRPC calls handled")
        .with_unit("{requests}")
        .build()
});

/// Histogram of RPC latency
///
/// Labels: same as [`RPC_REQUESTS`]
pub static RPC_REQUEST_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("warden_grpc_request_duration_seconds")
        .with_description("Duration of gRPC calls in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Command Metrics
// ============================================================================

/// Counter of gateway commands
///
/// Labels:
/// - `command_type`: occtl, systemctl, ...
/// - `status`: success, failure, rejected, timeout, error
pub static COMMANDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("warden_commands_total")
        .with_description("Total number of gateway commands")
        .with_unit("{commands}")
        .build()
});

/// Histogram of gateway command duration
///
/// Labels: same as [`COMMANDS`]
pub static COMMAND_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("warden_command_duration_seconds")
        .with_description("Duration of gateway commands in seconds")
        .with_unit("s")
        .build()
});

/// Counter of commands that did not succeed
///
/// Labels:
/// - `command_type`: occtl, systemctl, ...
/// - `status`: failure, rejected, timeout, error
pub static COMMAND_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("warden_command_errors_total")
        .with_description("Total number of gateway commands that did not succeed")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Session Metrics
// ============================================================================

/// Gauge of live VPN sessions
pub static ACTIVE_SESSIONS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("warden_active_sessions")
        .with_description("Number of live VPN sessions")
        .with_unit("{sessions}")
        .build()
});

/// Gauge of distinct users with at least one live session
pub static CONNECTED_USERS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("warden_connected_users")
        .with_description("Number of users with a live VPN session")
        .with_unit("{users}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Label for how a command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Ran and exited zero
    Success,
    /// Ran and exited non-zero
    Failure,
    /// Refused by the allow-list or argument checks
    Rejected,
    /// Killed after its time limit
    Timeout,
    /// Could not be started
    Error,
}

impl CommandStatus {
    /// Classify an executor result
    pub fn of(result: &Result<CommandOutput, ExecError>) -> Self {
        match result {
            Ok(output) if output.success => Self::Success,
            Ok(_) => Self::Failure,
            Err(ExecError::NotAllowed(_) | ExecError::InvalidArguments(_)) => Self::Rejected,
            Err(ExecError::DeadlineExceeded(_)) => Self::Timeout,
            Err(ExecError::Spawn { .. }) => Self::Error,
        }
    }

    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// Label value for a gRPC status code
pub fn code_label(code: Option<Code>) -> String {
    match code {
        Some(code) => format!("{:?}", code),
        None => "transport_error".to_string(),
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record one finished RPC call; `None` means the transport failed
pub fn record_rpc(method: &str, code: Option<Code>, elapsed: Duration) {
    let labels = [
        KeyValue::new("method", method.to_string()),
        KeyValue::new("code", code_label(code)),
    ];
    RPC_REQUESTS.add(1, &labels);
    RPC_REQUEST_DURATION.record(elapsed.as_secs_f64(), &labels);
}

/// Times a gateway command from start to result
pub struct CommandTimer {
    command_type: String,
    start: Instant,
}

impl CommandTimer {
    /// Start timing `command_type`
    pub fn start(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            start: Instant::now(),
        }
    }

    /// Record the outcome and return its label
    pub fn finish(self, result: &Result<CommandOutput, ExecError>) -> CommandStatus {
        let status = CommandStatus::of(result);
        let labels = [
            KeyValue::new("command_type", self.command_type),
            KeyValue::new("status", status.as_str()),
        ];

        COMMANDS.add(1, &labels);
        COMMAND_DURATION.record(self.start.elapsed().as_secs_f64(), &labels);
        if status != CommandStatus::Success {
            COMMAND_ERRORS.add(1, &labels);
        }
        status
    }
}

/// Publish session gauges from a registry snapshot
pub fn record_sessions(stats: &SessionStats) {
    ACTIVE_SESSIONS.record(saturating_i64(stats.total_sessions), &[]);
    CONNECTED_USERS.record(saturating_i64(stats.sessions_by_user.len()), &[]);
}

/// Refresh the session gauges every `every` until `cancel` fires
pub async fn publish_session_gauges(
    sessions: Arc<SessionStore>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => record_sessions(&sessions.stats()),
        }
    }
}

fn saturating_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::VpnSession;

    #[test]
    fn command_status_classification() {
        let ok = Ok(CommandOutput {
            success: true,
            ..Default::default()
        });
        assert_eq!(CommandStatus::of(&ok), CommandStatus::Success);

        let failed = Ok(CommandOutput {
            success: false,
            exit_code: 1,
            ..Default::default()
        });
        assert_eq!(CommandStatus::of(&failed), CommandStatus::Failure);

        let rejected = Err(ExecError::NotAllowed("rm".to_string()));
        assert_eq!(CommandStatus::of(&rejected), CommandStatus::Rejected);

        let timeout = Err(ExecError::DeadlineExceeded(Duration::from_secs(1)));
        assert_eq!(CommandStatus::of(&timeout).as_str(), "timeout");
    }

    #[test]
    fn code_labels() {
        assert_eq!(code_label(Some(Code::Ok)), "Ok");
        assert_eq!(code_label(Some(Code::DeadlineExceeded)), "DeadlineExceeded");
        assert_eq!(code_label(None), "transport_error");
    }

    #[test]
    fn recording_without_provider_is_harmless() {
        record_rpc("/warden.agent.v1.AgentService/HealthCheck", Some(Code::Ok), Duration::from_millis(3));
        let status = CommandTimer::start("occtl").finish(&Err(ExecError::InvalidArguments(
            "bad".to_string(),
        )));
        assert_eq!(status, CommandStatus::Rejected);

        let store = SessionStore::new(None);
        store.add(VpnSession::new("s1", "alice")).unwrap();
        store.add(VpnSession::new("s2", "alice")).unwrap();
        record_sessions(&store.stats());
    }

    #[tokio::test]
    async fn gauge_publisher_stops_on_cancel() {
        let store = Arc::new(SessionStore::new(None));
        let cancel = CancellationToken::new();
        let publisher = tokio::spawn(publish_session_gauges(
            store,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .unwrap()
            .unwrap();
    }
}
