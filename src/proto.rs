//! gRPC protocol definitions for the agent API
//!
//! Generated from `proto/agent.proto`. Two services share one package:
//!
//! - `AgentService`: health checks and gateway command execution
//! - `VpnAgentService`: session notifications from the gateway and session
//!   control from the remote controller

#![allow(missing_docs)] // Generated code doesn't have docs
#![allow(clippy::doc_overindented_list_items)]

/// Generated protobuf and gRPC code
pub mod agent {
    /// Version 1 of the agent protocol
    pub mod v1 {
        tonic::include_proto!("warden.agent.v1");
    }
}

pub use agent::v1::*;
