//! Gateway command execution
//!
//! Handlers never run programs directly. They go through [`CommandExecutor`],
//! which keeps the RPC layer testable and puts the command policy in one place.
//!
//! # Policy
//!
//! [`CommandPolicy`] runs before anything is spawned:
//!
//! - the command type must be on the allow-list
//! - every argument must pass [`validate_arguments`]
//!
//! [`ProcessExecutor`] then runs the mapped program directly (never through a
//! shell) with stdin closed, bounded by a hard timeout. `systemctl` is narrowed
//! further to a fixed set of actions on the gateway unit.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::metrics::CommandTimer;

/// Longest accepted argument, in bytes
pub const MAX_ARGUMENT_LEN: usize = 256;

/// Actions accepted for the `systemctl` command type
pub const SYSTEMCTL_ACTIONS: &[&str] = &["start", "stop", "restart", "reload", "status", "is-active"];

/// Characters a shell would interpret
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '>', '<', '$', '(', ')', '{', '}', '[', ']', '`',
];

/// Execution errors
#[derive(Debug, Error)]
pub enum ExecError {
    /// Command type is not on the allow-list
    #[error("command not allowed: {0}")]
    NotAllowed(String),

    /// An argument failed sanitisation
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The program did not finish in time and was killed
    #[error("command timed out after {0:?}")]
    DeadlineExceeded(Duration),

    /// The program could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// What a finished command produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status was zero
    pub success: bool,
    /// Captured stdout, lossily decoded
    pub stdout: String,
    /// Captured stderr, lossily decoded
    pub stderr: String,
    /// Exit code, `-1` when killed by a signal
    pub exit_code: i32,
    /// Human-readable failure summary, empty on success
    pub error_message: String,
}

/// Runs gateway commands on behalf of RPC handlers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command_type` with `args`
    ///
    /// Policy rejections and timeouts are errors; a program that runs and
    /// exits non-zero is an `Ok` with `success == false`.
    async fn execute(&self, command_type: &str, args: &[String]) -> Result<CommandOutput, ExecError>;
}

/// Allow-list plus argument sanitisation
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: HashSet<String>,
}

impl CommandPolicy {
    /// Policy allowing exactly `commands`
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: commands.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `command_type` is on the allow-list
    pub fn is_allowed(&self, command_type: &str) -> bool {
        self.allowed.contains(command_type)
    }

    /// Reject disallowed commands and unsafe arguments
    pub fn check(&self, command_type: &str, args: &[String]) -> Result<(), ExecError> {
        if !self.is_allowed(command_type) {
            return Err(ExecError::NotAllowed(command_type.to_string()));
        }
        validate_arguments(args)
    }
}

/// Reject arguments that could be abused if they ever reached a shell
///
/// Rejects shell metacharacters (escaped or not), CR/LF, control characters
/// other than TAB, `../`, a leading `-`, and anything over
/// [`MAX_ARGUMENT_LEN`] bytes.
pub fn validate_arguments(args: &[String]) -> Result<(), ExecError> {
    for arg in args {
        if arg.len() > MAX_ARGUMENT_LEN {
            return Err(ExecError::InvalidArguments(format!(
                "argument exceeds {} bytes",
                MAX_ARGUMENT_LEN
            )));
        }
        if arg.contains(SHELL_METACHARACTERS) {
            return Err(ExecError::InvalidArguments(format!(
                "argument contains shell metacharacters: {:?}",
                arg
            )));
        }
        if arg.chars().any(|c| c.is_control() && c != '\t') {
            return Err(ExecError::InvalidArguments(
                "argument contains control characters".to_string(),
            ));
        }
        if arg.contains("../") {
            return Err(ExecError::InvalidArguments(format!(
                "argument contains path traversal: {:?}",
                arg
            )));
        }
        if arg.starts_with('-') {
            return Err(ExecError::InvalidArguments(format!(
                "argument looks like a flag: {:?}",
                arg
            )));
        }
    }
    Ok(())
}

/// Settings for [`ProcessExecutor`]
#[derive(Debug, Clone)]
pub struct ProcessExecutorConfig {
    /// Command types callers may request
    pub allowed_commands: Vec<String>,
    /// Program to run per command type; unmapped types run by name from `PATH`
    pub programs: HashMap<String, PathBuf>,
    /// Run through `sudo -n -u <user>` when set
    pub sudo_user: Option<String>,
    /// Unit that `systemctl` actions apply to
    pub service_unit: String,
    /// Hard limit for a single command
    pub timeout: Duration,
}

/// Runs allow-listed programs with `tokio::process`
pub struct ProcessExecutor {
    policy: CommandPolicy,
    programs: HashMap<String, PathBuf>,
    sudo_user: Option<String>,
    service_unit: String,
    timeout: Duration,
}

impl ProcessExecutor {
    /// Create an executor from its settings
    pub fn new(config: ProcessExecutorConfig) -> Self {
        Self {
            policy: CommandPolicy::new(config.allowed_commands),
            programs: config.programs,
            sudo_user: config.sudo_user,
            service_unit: config.service_unit,
            timeout: config.timeout,
        }
    }

    /// Final argv for `command_type`, after command-specific narrowing
    fn command_line(&self, command_type: &str, args: &[String]) -> Result<Vec<String>, ExecError> {
        if command_type != "systemctl" {
            return Ok(args.to_vec());
        }

        match args {
            [action] if SYSTEMCTL_ACTIONS.contains(&action.as_str()) => {
                Ok(vec![action.clone(), self.service_unit.clone()])
            }
            [action] => Err(ExecError::InvalidArguments(format!(
                "unsupported systemctl action: {}",
                action
            ))),
            _ => Err(ExecError::InvalidArguments(
                "systemctl takes exactly one action".to_string(),
            )),
        }
    }

    fn build_command(&self, program: &str, args: &[String]) -> Command {
        let mut command = match &self.sudo_user {
            Some(user) => {
                let mut command = Command::new("sudo");
                command.args(["-n", "-u", user.as_str(), program]);
                command
            }
            None => Command::new(program),
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, command_type: &str, args: &[String]) -> Result<CommandOutput, ExecError> {
        let timer = CommandTimer::start(command_type);
        let result = self.run(command_type, args).await;
        let status = timer.finish(&result);
        debug!(command = %command_type, status = status.as_str(), "Command recorded");
        result
    }
}

impl ProcessExecutor {
    async fn run(&self, command_type: &str, args: &[String]) -> Result<CommandOutput, ExecError> {
        self.policy.check(command_type, args)?;
        let argv = self.command_line(command_type, args)?;

        let program = self
            .programs
            .get(command_type)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| command_type.to_string());

        info!(command = %command_type, args = ?argv, "Executing command");

        let mut command = self.build_command(&program, &argv);
        // kill_on_drop reaps the child when the timeout drops this future
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ExecError::DeadlineExceeded(self.timeout))?
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let success = output.status.success();
        debug!(command = %command_type, exit_code, success, "Command finished");

        Ok(CommandOutput {
            success,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
            error_message: if success {
                String::new()
            } else {
                format!("{} exited with status {}", command_type, exit_code)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn executor(allowed: &[&str], timeout: Duration) -> ProcessExecutor {
        ProcessExecutor::new(ProcessExecutorConfig {
            allowed_commands: args(allowed),
            programs: HashMap::new(),
            sudo_user: None,
            service_unit: "ocserv".to_string(),
            timeout,
        })
    }

    #[test]
    fn plain_arguments_pass() {
        assert!(validate_arguments(&args(&["show", "users"])).is_ok());
        assert!(validate_arguments(&args(&["disconnect", "user", "alice.smith@corp"])).is_ok());
        assert!(validate_arguments(&args(&["with\ttab"])).is_ok());
        assert!(validate_arguments(&[]).is_ok());
    }

    #[test]
    fn shell_injection_rejected() {
        for bad in [
            "a;b", "a|b", "a&b", "`id`", "$(id)", "a>b", "a<b", "{a}", "[a]", "\\;",
        ] {
            let err = validate_arguments(&args(&[bad])).unwrap_err();
            assert!(
                matches!(err, ExecError::InvalidArguments(_)),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn control_characters_rejected() {
        for bad in ["a\nb", "a\rb", "a\0b", "a\x07b", "a\x1bb"] {
            assert!(validate_arguments(&args(&[bad])).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn traversal_flags_and_length_rejected() {
        assert!(validate_arguments(&args(&["../../etc/passwd"])).is_err());
        assert!(validate_arguments(&args(&["--config=/tmp/x"])).is_err());
        assert!(validate_arguments(&args(&["-h"])).is_err());

        let long = "a".repeat(MAX_ARGUMENT_LEN + 1);
        assert!(validate_arguments(&[long]).is_err());
        let exact = "a".repeat(MAX_ARGUMENT_LEN);
        assert!(validate_arguments(&[exact]).is_ok());
    }

    #[test]
    fn policy_checks_allow_list_first() {
        let policy = CommandPolicy::new(["occtl"]);
        let err = policy.check("rm", &args(&["x"])).unwrap_err();
        assert_eq!(err.to_string(), "command not allowed: rm");

        let err = policy.check("occtl", &args(&["x;y"])).unwrap_err();
        assert!(err.to_string().starts_with("invalid arguments:"));
    }

    #[test]
    fn systemctl_is_narrowed_to_gateway_unit() {
        let exec = executor(&["systemctl"], Duration::from_secs(1));

        assert_eq!(
            exec.command_line("systemctl", &args(&["restart"])).unwrap(),
            args(&["restart", "ocserv"])
        );
        assert!(exec.command_line("systemctl", &args(&["mask"])).is_err());
        assert!(exec.command_line("systemctl", &args(&["restart", "sshd"])).is_err());
        assert!(exec.command_line("systemctl", &[]).is_err());
    }

    #[tokio::test]
    async fn disallowed_command_never_spawns() {
        let exec = executor(&["occtl"], Duration::from_secs(1));
        let err = exec.execute("sh", &args(&["x"])).await.unwrap_err();
        assert!(matches!(err, ExecError::NotAllowed(cmd) if cmd == "sh"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_command_captures_output() {
        let exec = executor(&["echo"], Duration::from_secs(5));
        let out = exec.execute("echo", &args(&["hello"])).await.unwrap();

        assert!(out.success);
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.error_message.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let exec = executor(&["false"], Duration::from_secs(5));
        let out = exec.execute("false", &[]).await.unwrap();

        assert!(!out.success);
        assert_ne!(out.exit_code, 0);
        assert!(out.error_message.contains("exited with status"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_hits_deadline() {
        let exec = executor(&["sleep"], Duration::from_millis(100));
        let err = exec.execute("sleep", &args(&["5"])).await.unwrap_err();
        assert!(matches!(err, ExecError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let mut exec = executor(&["occtl"], Duration::from_secs(1));
        exec.programs.insert(
            "occtl".to_string(),
            PathBuf::from("/nonexistent/warden-test/occtl"),
        );

        let err = exec.execute("occtl", &args(&["show", "users"])).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
