//! Contracts of the external actors the control plane talks to. None of
//! these are implemented here; the CI server provides them and the tests use
//! in-memory fakes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use instaclone_common::protocol::ControlMessage;
pub use instaclone_common::buildlog::{BuildLogSink, LogSeverity};

use crate::error::CloudResult;

/// Account/credential lookup. The core only ever consumes resolved
/// credentials; storage and encryption live elsewhere.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, account_id: &str) -> Option<ResolvedCredentials>;
}

#[derive(Debug, Clone)]
pub struct ResolvedCredentials {
    /// vSphere SDK endpoint, e.g. `https://vcenter.example.com/sdk`.
    pub url: String,
    pub username: String,
    pub secret: String,
}

/// Build agent management surface: enough to stop the scheduler from
/// assigning work to an agent that is about to be powered off.
pub trait BuildAgentRegistry: Send + Sync {
    fn disable_agent(&self, agent_id: i64, reason: &str);
}

/// Placement manager lookup: agent pool id by name.
pub trait AgentPoolLookup: Send + Sync {
    fn pool_id_by_name(&self, name: &str) -> Option<i64>;
}

/// Delivery of a control message into a named agent process. The callback
/// half of the on-demand clone protocol rides on this.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn send(&self, agent_name: &str, message: ControlMessage) -> CloudResult<()>;
}

/// What the clone-request detector sees of a running build.
pub trait RunningBuild: Send + Sync {
    fn agent_name(&self) -> String;
    /// Configuration parameters of the agent the build runs on.
    fn agent_params(&self) -> HashMap<String, String>;
    fn log(&self) -> Arc<dyn BuildLogSink>;
    fn channel(&self) -> Arc<dyn AgentChannel>;
    /// Last-resort interruption when a terminal status cannot be delivered.
    fn interrupt(&self, reason: &str);
}
