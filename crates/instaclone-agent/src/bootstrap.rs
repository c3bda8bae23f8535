//! Guest-side self-configuration. A freshly booted clone carries its
//! bootstrap blob in guest metadata; this module reads it through the VMware
//! RPC tool and applies it to the local agent configuration. A template
//! machine without a blob is frozen instead (the freeze script quiesces the
//! VM as an instant-clone source) and resumes here as a fresh clone.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, warn};

use instaclone_common::{guestinfo, BootstrapConfig};

use crate::error::{AgentError, AgentResult};

/// Agent configuration parameter overriding the RPC tool location.
pub const RPC_TOOL_PARAMETER: &str = "instaclone.rpctool.path";
/// Agent configuration parameter naming the freeze script.
pub const FREEZE_SCRIPT_PARAMETER: &str = "instaclone.freeze.script";

const DEFAULT_RPC_TOOL_PATHS: &[&str] = &[
    "C:\\Program Files\\VMware\\VMware Tools\\rpctool.exe",
    "/usr/sbin/vmware-rpctool",
    "/usr/bin/vmware-rpctool",
    "/sbin/rpctool",
    "/Library/Application Support/VMware Tools/vmware-tools-daemon",
];

/// Local agent configuration the bootstrap writes into.
pub trait AgentConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);

    fn authorization_token(&self) -> Option<String> {
        self.get("authorizationToken")
    }

    fn set_agent_name(&self, name: &str) {
        self.set("name", name);
    }
}

/// Thin wrapper around the VMware guest RPC tool.
pub struct RpcTool {
    path: PathBuf,
}

impl RpcTool {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Configured path first, then the well-known install locations.
    pub fn locate(configured: Option<&str>) -> Option<Self> {
        if let Some(path) = configured {
            return Some(Self::at(path));
        }
        DEFAULT_RPC_TOOL_PATHS
            .iter()
            .map(Path::new)
            .find(|path| path.is_file())
            .map(Self::at)
    }

    /// Reads one guestinfo value; `None` when the key is unset or the tool
    /// reports failure.
    pub async fn info_get(&self, key: &str) -> AgentResult<Option<String>> {
        let output = Command::new(&self.path)
            .arg(format!("info-get {key}"))
            .output()
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    }
}

pub struct GuestBootstrap {
    rpc: RpcTool,
    freeze_script: Option<String>,
}

impl GuestBootstrap {
    pub fn new(rpc: RpcTool, freeze_script: Option<String>) -> Self {
        Self { rpc, freeze_script }
    }

    /// Applies the guest bootstrap blob to the agent configuration. Returns
    /// `false` when the machine carries no metadata and no freeze script is
    /// configured, i.e. it is not a managed VM.
    pub async fn initialize(&self, store: &dyn AgentConfigStore) -> AgentResult<bool> {
        let blob = match self.rpc.info_get(guestinfo::INSTANCE_CONFIG).await? {
            Some(blob) => blob,
            None => {
                let Some(script) = &self.freeze_script else {
                    info!("no instance config and {FREEZE_SCRIPT_PARAMETER} is unset");
                    return Ok(false);
                };
                if store.authorization_token().is_some_and(|t| !t.is_empty()) {
                    return Err(AgentError::Bootstrap(
                        "cannot freeze: remove the authorization token from the agent configuration first"
                            .to_string(),
                    ));
                }

                info!(script = %script, "executing the freeze script");
                let status = Command::new(script).status().await?;
                // Execution resumes here inside a fresh clone of the frozen
                // template, which carries new metadata.
                info!(code = status.code(), "freeze script completed");

                self.rpc
                    .info_get(guestinfo::INSTANCE_CONFIG)
                    .await?
                    .ok_or_else(|| {
                        AgentError::Bootstrap(
                            "missing instance config in an unfrozen machine".to_string(),
                        )
                    })?
            }
        };

        let config = BootstrapConfig::from_json(&blob)?;
        for (key, value) in &config.config_params {
            store.set(key, value);
        }
        if config.agent_name.is_empty() {
            warn!("bootstrap blob carries no agent name");
        } else {
            store.set_agent_name(&config.agent_name);
        }
        info!(agent = %config.agent_name, "agent configured from guest metadata");
        Ok(true)
    }
}
