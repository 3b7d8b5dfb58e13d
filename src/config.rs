//! Agent configuration
//!
//! Loaded from a YAML file, then overridden from `WARDEN_*` environment
//! variables, then validated as a whole so an operator sees every problem at
//! once instead of fixing them one restart at a time.
//!
//! ```yaml
//! agent_id: gw-01
//! listen_address: 0.0.0.0:9090
//! tls:
//!   cert_file: /etc/warden/certs/agent.crt
//!   key_file: /etc/warden/certs/agent.key
//!   ca_file: /etc/warden/certs/ca.crt
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::ProcessExecutorConfig;
use crate::pki::{self, CertificateMaterial, MaterialPaths, PkiError};
use crate::transport::mtls::TlsVersion;

/// Default gRPC listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9090";

/// Default session lifetime without activity (24h)
pub const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;

/// Default upper bound for a single gateway command
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Standard variable naming the OTLP collector
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// Configuration file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// Configuration file
        path: PathBuf,
        /// Underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// One or more settings are invalid
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Complete agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Identifier reported to the controller
    pub agent_id: String,
    /// Host name used in certificate subjects; resolved from the system when unset
    pub hostname: Option<String>,
    /// `host:port` for the gRPC listener
    pub listen_address: String,
    /// TLS material and policy
    pub tls: TlsSettings,
    /// Session registry settings
    pub sessions: SessionSettings,
    /// Command execution policy
    pub security: SecuritySettings,
    /// Gateway programs and paths
    pub gateway: GatewaySettings,
    /// Log output
    pub logging: LoggingSettings,
    /// Metrics export
    pub telemetry: TelemetrySettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            hostname: None,
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            tls: TlsSettings::default(),
            sessions: SessionSettings::default(),
            security: SecuritySettings::default(),
            gateway: GatewaySettings::default(),
            logging: LoggingSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

/// TLS settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSettings {
    /// Serve mutual TLS; plaintext is for local testing only
    pub enabled: bool,
    /// Bootstrap a CA and leaf when the files are missing
    pub auto_generate: bool,
    /// Leaf certificate (PEM)
    pub cert_file: String,
    /// Leaf private key (PEM)
    pub key_file: String,
    /// Root certificate that client certificates must chain to (PEM)
    pub ca_file: String,
    /// Lowest protocol version accepted
    pub min_version: TlsVersion,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_generate: true,
            cert_file: "/etc/warden/certs/agent.crt".to_string(),
            key_file: "/etc/warden/certs/agent.key".to_string(),
            ca_file: "/etc/warden/certs/ca.crt".to_string(),
            min_version: TlsVersion::Tls13,
        }
    }
}

impl TlsSettings {
    /// The three files as a [`MaterialPaths`]
    pub fn material_paths(&self) -> MaterialPaths {
        MaterialPaths::new(&self.cert_file, &self.key_file, &self.ca_file)
    }
}

/// Session registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    /// Seconds a session lives without activity; `0` disables expiry
    pub ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }
}

impl SessionSettings {
    /// TTL for the registry, `None` when disabled
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

/// Command execution policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySettings {
    /// Command types `ExecuteCommand` may run
    pub allowed_commands: Vec<String>,
    /// Run commands as this user through `sudo -n -u`
    pub sudo_user: Option<String>,
    /// Hard limit for a single command, in seconds
    pub max_command_timeout_secs: u64,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            allowed_commands: vec!["occtl".to_string(), "systemctl".to_string()],
            sudo_user: None,
            max_command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

/// Gateway programs and paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySettings {
    /// Gateway control tool
    pub occtl_path: PathBuf,
    /// Service manager
    pub systemctl_path: PathBuf,
    /// Unit that `systemctl` commands act on
    pub service_unit: String,
    /// Directory for per-user configuration files; `UpdateUserRoutes` is disabled when unset
    pub per_user_config_dir: Option<PathBuf>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            occtl_path: PathBuf::from("/usr/bin/occtl"),
            systemctl_path: PathBuf::from("/usr/bin/systemctl"),
            service_unit: "ocserv".to_string(),
            per_user_config_dir: None,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    /// `json` or `text`
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl LoggingSettings {
    /// Whether to emit JSON lines
    pub fn json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Metrics export settings
///
/// Without an endpoint the instruments still exist but nothing is exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySettings {
    /// `service.name` resource attribute
    pub service_name: String,
    /// OTLP/gRPC collector, e.g. `http://otel-collector:4317`
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            service_name: "warden".to_string(),
            otlp_endpoint: None,
        }
    }
}

/// What [`AgentConfig::ensure_certificates`] did
#[derive(Debug)]
pub enum CertificateProvisioning {
    /// TLS is disabled, nothing to do
    Disabled,
    /// Existing files are used as they are
    Reused {
        /// Why the existing leaf looks unusable, if it does
        problem: Option<String>,
    },
    /// Files were missing and a fresh CA and leaf were written
    Generated(CertificateMaterial),
}

impl AgentConfig {
    /// Read, override from the environment, and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::parse(&content, path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without overrides or validation
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Apply `WARDEN_*` variables from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`, which maps variable names to values
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let targets: [(&str, &mut String); 6] = [
            ("WARDEN_AGENT_ID", &mut self.agent_id),
            ("WARDEN_LISTEN_ADDRESS", &mut self.listen_address),
            ("WARDEN_TLS_CERT_FILE", &mut self.tls.cert_file),
            ("WARDEN_TLS_KEY_FILE", &mut self.tls.key_file),
            ("WARDEN_TLS_CA_FILE", &mut self.tls.ca_file),
            ("WARDEN_LOG_LEVEL", &mut self.logging.level),
        ];
        for (name, target) in targets {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                *target = value;
            }
        }
        if let Some(endpoint) = lookup(OTLP_ENDPOINT_ENV).filter(|v| !v.is_empty()) {
            self.telemetry.otlp_endpoint = Some(endpoint);
        }
    }

    /// Check every setting, reporting all problems together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.agent_id.trim().is_empty() {
            problems.push("agent_id is required".to_string());
        }
        if self.listen_address.parse::<SocketAddr>().is_err() {
            problems.push(format!(
                "listen_address {:?} is not a valid host:port",
                self.listen_address
            ));
        }
        if self.tls.enabled {
            for (field, value) in [
                ("tls.cert_file", &self.tls.cert_file),
                ("tls.key_file", &self.tls.key_file),
                ("tls.ca_file", &self.tls.ca_file),
            ] {
                if value.is_empty() {
                    problems.push(format!("{} is required when TLS is enabled", field));
                }
            }
        }
        if self.security.allowed_commands.is_empty() {
            problems.push("security.allowed_commands must not be empty".to_string());
        }
        if self.security.max_command_timeout_secs == 0 {
            problems.push("security.max_command_timeout_secs must be positive".to_string());
        }
        if !matches!(self.logging.format.to_ascii_lowercase().as_str(), "json" | "text") {
            problems.push(format!(
                "logging.format must be json or text, got {:?}",
                self.logging.format
            ));
        }
        if self.telemetry.service_name.trim().is_empty() {
            problems.push("telemetry.service_name must not be empty".to_string());
        }
        if let Some(endpoint) = &self.telemetry.otlp_endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                problems.push(format!(
                    "telemetry.otlp_endpoint must be an http(s) URL, got {:?}",
                    endpoint
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_address.parse().map_err(|_| {
            ConfigError::Invalid(vec![format!(
                "listen_address {:?} is not a valid host:port",
                self.listen_address
            )])
        })
    }

    /// Configured host name, else the kernel's, else `localhost`
    pub fn resolved_hostname(&self) -> String {
        self.hostname
            .clone()
            .filter(|h| !h.trim().is_empty())
            .or_else(system_hostname)
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Make sure TLS material exists before the transport loads it
    ///
    /// Missing material is generated only when `tls.auto_generate` is on.
    /// Present material is never touched; a leaf that no longer verifies
    /// against the configured root is reported in the result.
    pub fn ensure_certificates(&self) -> Result<CertificateProvisioning, PkiError> {
        if !self.tls.enabled {
            return Ok(CertificateProvisioning::Disabled);
        }

        let paths = self.tls.material_paths();
        if paths.present() {
            return Ok(CertificateProvisioning::Reused {
                problem: check_existing(&paths),
            });
        }
        if !self.tls.auto_generate {
            // The transport reports which file is missing
            return Ok(CertificateProvisioning::Reused { problem: None });
        }

        let material = pki::bootstrap_files(&paths, &self.resolved_hostname())?;
        Ok(CertificateProvisioning::Generated(material))
    }

    /// Settings for the process executor
    pub fn executor_config(&self) -> ProcessExecutorConfig {
        let programs = HashMap::from([
            ("occtl".to_string(), self.gateway.occtl_path.clone()),
            ("systemctl".to_string(), self.gateway.systemctl_path.clone()),
        ]);
        ProcessExecutorConfig {
            allowed_commands: self.security.allowed_commands.clone(),
            programs,
            sudo_user: self.security.sudo_user.clone(),
            service_unit: self.gateway.service_unit.clone(),
            timeout: Duration::from_secs(self.security.max_command_timeout_secs),
        }
    }
}

/// Host name as the kernel reports it
fn system_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().trim().to_string())
        .filter(|h| !h.is_empty())
}

fn check_existing(paths: &MaterialPaths) -> Option<String> {
    let cert = std::fs::read_to_string(&paths.cert).ok()?;
    let ca = std::fs::read_to_string(&paths.ca_cert).ok()?;
    match pki::verify_signed_by(&cert, &ca) {
        Ok(result) => result.reason,
        Err(e) => Some(e.to_string()),
    }
}
