//! Warden - control-plane agent for a VPN gateway
//!
//! Warden runs next to the gateway process and exposes a mutually
//! authenticated gRPC API to a remote controller. The gateway reports client
//! connects and disconnects to it, and the controller uses it to list
//! sessions, drop users, push per-user routes, and run allow-listed commands.
//!
//! # Modules
//!
//! - [`pki`] - Bootstrap certificate authority and agent certificate
//! - [`transport`] - gRPC server with mTLS, call logging, and panic containment
//! - [`session`] - In-memory registry of live VPN sessions with TTL expiry
//! - [`service`] - gRPC handlers on top of the registry and executor
//! - [`executor`] - Allow-listed gateway command execution
//! - [`config`] - YAML configuration with environment overrides
//! - [`metrics`] - OpenTelemetry instruments for calls, commands, and sessions
//! - [`telemetry`] - Log subscriber and OTLP metrics export setup
//! - [`agent`] - Wiring everything together and running until shutdown
//! - [`proto`] - Generated protocol definitions
//! - [`error`] - Error types for the agent

#![deny(missing_docs)]

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pki;
pub mod proto;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/config.yaml";
