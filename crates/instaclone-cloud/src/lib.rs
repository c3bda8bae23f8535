//! Control plane of the instant-clone cloud: image/instance registries, the
//! per-instance lifecycle state machine, capacity and naming policy, and the
//! server side of the on-demand clone protocol.

pub mod client;
pub mod collaborators;
pub mod config;
pub mod detector;
pub mod error;
pub mod executor;
pub mod image;
pub mod instance;
pub mod naming;

pub use client::{session_for_account, AdmissionDecision, CloudClient, AT_CAPACITY_REASON};
pub use collaborators::{
    AgentChannel, AgentPoolLookup, BuildAgentRegistry, BuildLogSink, CredentialResolver,
    LogSeverity, ResolvedCredentials, RunningBuild,
};
pub use config::{AgentPoolRef, CloneTuning, ImageConfig};
pub use detector::CloneRequestDetector;
pub use error::{CloudError, CloudResult};
pub use image::CloudImage;
pub use instance::{CloneJob, CloudInstance, InstanceError, InstanceStatus, InstanceUserData};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use instaclone_vim::mock::MockPort;
    use instaclone_vim::{ManagedObjectRef, PropertyValue, VimSession};

    use crate::client::CloudClient;
    use crate::collaborators::{AgentPoolLookup, BuildAgentRegistry, BuildLogSink, LogSeverity};
    use crate::config::{CloneTuning, ImageConfig};

    pub const TEMPLATE_PATH: &str = "/dc/vm/img-template";
    pub const FOLDER_PATH: &str = "/dc/vm";
    pub const PROFILE_UUID: &str = "3f2c8f05-6f2e-4f55-9f6e-14b1d2a7c001";

    pub fn template_mor() -> ManagedObjectRef {
        ManagedObjectRef::new(ManagedObjectRef::VIRTUAL_MACHINE, "vm-template")
    }

    pub fn folder_mor() -> ManagedObjectRef {
        ManagedObjectRef::new(ManagedObjectRef::FOLDER, "group-v1")
    }

    /// Minimal inventory for an image named `img`: template VM, instance
    /// folder with no children, and an ethernet-less template device list.
    pub fn seed_image_inventory(port: &MockPort) {
        port.set_inventory(TEMPLATE_PATH, template_mor());
        port.set_inventory(FOLDER_PATH, folder_mor());
        port.push_property(&folder_mor(), "childEntity", PropertyValue::MorList(vec![]));
        port.push_property(
            &template_mor(),
            "config.hardware.device",
            PropertyValue::Ethernets(vec![]),
        );
    }

    pub fn image_config(max_instances: usize) -> ImageConfig {
        serde_json::from_value(serde_json::json!({
            "template": TEMPLATE_PATH,
            "maxInstances": max_instances,
        }))
        .unwrap()
    }

    /// Tuning with sub-millisecond waits so clone tests run instantly.
    pub fn fast_tuning() -> CloneTuning {
        CloneTuning {
            freeze_initial_delay: Duration::from_millis(1),
            freeze_poll_window: Duration::from_millis(50),
            freeze_poll_interval: Duration::from_millis(1),
            ..CloneTuning::default()
        }
    }

    pub async fn test_client(port: &Arc<MockPort>, max_instances: usize) -> Arc<CloudClient> {
        test_client_tuned(port, max_instances, fast_tuning()).await
    }

    pub async fn test_client_tuned(
        port: &Arc<MockPort>,
        max_instances: usize,
        tuning: CloneTuning,
    ) -> Arc<CloudClient> {
        let session = Arc::new(VimSession::new(
            Arc::clone(port) as Arc<dyn instaclone_vim::VimPort>,
            "ci",
            "secret",
        ));
        let configs = HashMap::from([("img".to_string(), image_config(max_instances))]);
        CloudClient::connect(
            session,
            PROFILE_UUID,
            configs,
            tuning,
            Arc::new(RecordingAgents::default()),
            Arc::new(StaticPools::default()),
        )
        .await
        .expect("test client should connect")
    }

    pub async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !predicate() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[derive(Default)]
    pub struct RecordingAgents {
        pub disabled: Mutex<Vec<(i64, String)>>,
    }

    impl BuildAgentRegistry for RecordingAgents {
        fn disable_agent(&self, agent_id: i64, reason: &str) {
            self.disabled
                .lock()
                .unwrap()
                .push((agent_id, reason.to_string()));
        }
    }

    #[derive(Default)]
    pub struct StaticPools {
        pub pools: HashMap<String, i64>,
    }

    impl AgentPoolLookup for StaticPools {
        fn pool_id_by_name(&self, name: &str) -> Option<i64> {
            self.pools.get(name).copied()
        }
    }

    #[derive(Default)]
    pub struct RecordingLog {
        pub lines: Mutex<Vec<(LogSeverity, String)>>,
    }

    impl RecordingLog {
        pub fn contains(&self, needle: &str) -> bool {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .any(|(_, line)| line.contains(needle))
        }
    }

    impl BuildLogSink for RecordingLog {
        fn append(&self, text: &str, severity: LogSeverity) {
            self.lines
                .lock()
                .unwrap()
                .push((severity, text.to_string()));
        }

        fn flush(&self) {}
    }
}
