// Re-export dependencies used in public interfaces of common types

pub use serde::{Deserialize, Serialize};
pub use uuid;

use std::collections::HashMap;

pub mod protocol;

/// Append-only build log contract, implemented by the CI server on the
/// control-plane side and by the agent-local logger on the build-step side.
pub mod buildlog {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LogSeverity {
        Normal,
        Error,
    }

    pub trait BuildLogSink: Send + Sync {
        fn append(&self, text: &str, severity: LogSeverity);
        fn flush(&self);

        fn info(&self, text: &str) {
            self.append(text, LogSeverity::Normal);
            self.flush();
        }

        fn error_line(&self, text: &str) {
            self.append(text, LogSeverity::Error);
            self.flush();
        }
    }
}

/// Keys of the guest metadata channel: key/value pairs written into the VM's
/// extra configuration by the control plane and read back from inside the
/// guest via the VMware RPC tool.
pub mod guestinfo {
    /// Uuid of the managed instance this VM belongs to.
    pub const INSTANCE_UUID: &str = "guestinfo.instaclone-instance-uuid";
    /// Uuid of the cloud profile that owns the instance.
    pub const PROFILE_UUID: &str = "guestinfo.instaclone-profile-uuid";
    /// Instance start time, milliseconds since the epoch.
    pub const INSTANCE_START_TIME: &str = "guestinfo.instaclone-instance-start-time";
    /// Bootstrap blob consumed by the in-guest agent, see [`BootstrapConfig`].
    ///
    /// [`BootstrapConfig`]: crate::BootstrapConfig
    pub const INSTANCE_CONFIG: &str = "guestinfo.instaclone-instance-config";
    /// Hostname assigned to the guest.
    pub const HOSTNAME: &str = "guestinfo.instaclone-hostname";
    /// Guest-reported lifecycle state, `ready` or `shutdown`.
    pub const INSTANCE_STATE: &str = "guestinfo.instaclone-instance-state";
    /// Control command written by the control plane; the guest reacts to it.
    pub const INSTANCE_CONTROL: &str = "guestinfo.instaclone-instance-control";

    pub const STATE_READY: &str = "ready";
    pub const STATE_SHUTDOWN: &str = "shutdown";
    pub const CONTROL_SHUTDOWN: &str = "shutdown";

    /// Keys carrying instance identity. Cleared when instant-cloning from a
    /// running instance so the new VM is not adopted as an existing one.
    pub const IDENTITY_KEYS: &[&str] = &[
        INSTANCE_UUID,
        PROFILE_UUID,
        INSTANCE_START_TIME,
        INSTANCE_CONFIG,
        HOSTNAME,
    ];
}

/// Agent configuration parameter linking a registered build agent back to the
/// instance it runs on.
pub const INSTANCE_UUID_AGENT_PARAM: &str = "instaclone.instance.uuid";

/// Bootstrap data embedded into [`guestinfo::INSTANCE_CONFIG`]. The in-guest
/// agent reads this blob at boot and configures itself from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    pub agent_name: String,
    pub auth_token: String,
    pub server_url: String,
    /// Extra configuration parameters applied verbatim to the agent. Always
    /// contains [`INSTANCE_UUID_AGENT_PARAM`].
    pub config_params: HashMap<String, String>,
}

impl BootstrapConfig {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn instance_uuid(&self) -> Option<&str> {
        self.config_params
            .get(INSTANCE_UUID_AGENT_PARAM)
            .map(String::as_str)
    }
}
