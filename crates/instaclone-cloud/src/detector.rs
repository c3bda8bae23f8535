//! Control-plane side of the on-demand clone protocol: recognizes the clone
//! request marker in a build's log stream, dispatches the clone job and
//! guarantees that a terminal status callback reaches the blocked build step
//! whatever happens.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use instaclone_common::protocol::{CloneRequest, CloneStatus, ControlMessage};

use crate::client::CloudClient;
use crate::collaborators::RunningBuild;

#[derive(Clone)]
pub struct CloneRequestDetector {
    client: Arc<CloudClient>,
}

impl CloneRequestDetector {
    pub fn new(client: Arc<CloudClient>) -> Self {
        Self { client }
    }

    /// Feeds one build log line through the detector. Returns `true` when
    /// the line was a clone-request marker and has been handled; ordinary
    /// lines pass through untouched.
    pub async fn translate(&self, build: &Arc<dyn RunningBuild>, line: &str) -> bool {
        let Some(request) = CloneRequest::parse_marker(line) else {
            return false;
        };
        info!(
            agent = %build.agent_name(),
            correlation = %request.correlation_id,
            suffix = %request.name_suffix,
            "clone request marker received"
        );
        self.handle_request(build, request).await;
        true
    }

    async fn handle_request(&self, build: &Arc<dyn RunningBuild>, request: CloneRequest) {
        let log = build.log();

        let Some(instance) = self.client.find_instance_by_agent(&build.agent_params()) else {
            warn!(agent = %build.agent_name(), "no managed instance found for clone request");
            log.error_line(&format!(
                "Cannot create clone - no managed instance found for agent {}",
                build.agent_name()
            ));
            self.report(
                build,
                request.correlation_id,
                Err("no managed instance found".to_string()),
            )
            .await;
            return;
        };

        log.info(&format!(
            "Creating VM clone for agent {} from instance {}",
            build.agent_name(),
            instance.name()
        ));

        match instance.create_clone(&request.name_suffix, log.clone()) {
            Err(cause) => {
                warn!(instance = %instance.uuid(), error = %cause, "clone request rejected");
                log.error_line(&format!("Failed to start clone job: {cause}"));
                self.report(build, request.correlation_id, Err(cause.to_string()))
                    .await;
            }
            Ok(job) => {
                let detector = self.clone();
                let build = Arc::clone(build);
                let correlation_id = request.correlation_id;
                tokio::spawn(async move {
                    let outcome = job.join().await.map_err(|cause| cause.to_string());
                    detector.report(&build, correlation_id, outcome).await;
                });
            }
        }
    }

    /// Delivers the terminal status back into the agent process, with
    /// human-readable log lines for observability. A delivery failure is the
    /// one case that cannot be reported over the channel itself; the build
    /// is interrupted instead so the step never hangs until its timeout.
    async fn report(
        &self,
        build: &Arc<dyn RunningBuild>,
        correlation_id: Uuid,
        outcome: Result<(), String>,
    ) {
        let log = build.log();
        let status = match &outcome {
            Ok(()) => {
                log.info("Clone success");
                CloneStatus::Ok
            }
            Err(cause) => {
                log.error_line(&format!("Clone failed: {cause}"));
                CloneStatus::Fail
            }
        };
        log.info(&format!(
            "Clone job completed - correlation id {correlation_id}"
        ));

        let message = ControlMessage::clone_status(correlation_id, status);
        if let Err(cause) = build.channel().send(&build.agent_name(), message).await {
            error!(
                agent = %build.agent_name(),
                %correlation_id,
                error = %cause,
                "failed to deliver clone status callback"
            );
            log.error_line(&format!("Failed to deliver clone status: {cause}"));
            build.interrupt("failed to deliver clone status callback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AgentChannel, BuildLogSink, RunningBuild};
    use crate::error::{CloudError, CloudResult};
    use crate::testing::*;
    use async_trait::async_trait;
    use instaclone_common::protocol::CLONE_STATUS_METHOD;
    use instaclone_common::INSTANCE_UUID_AGENT_PARAM;
    use instaclone_vim::mock::MockPort;
    use instaclone_vim::types::{ManagedObjectRef, OptionValue, PropertyValue};
    use instaclone_common::guestinfo;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        pub sent: Mutex<Vec<(String, ControlMessage)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl AgentChannel for RecordingChannel {
        async fn send(&self, agent_name: &str, message: ControlMessage) -> CloudResult<()> {
            if self.fail {
                return Err(CloudError::Callback("connection lost".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((agent_name.to_string(), message));
            Ok(())
        }
    }

    struct FakeBuild {
        params: HashMap<String, String>,
        log: Arc<RecordingLog>,
        channel: Arc<RecordingChannel>,
        interruptions: Mutex<Vec<String>>,
    }

    impl FakeBuild {
        fn new(params: HashMap<String, String>, channel: Arc<RecordingChannel>) -> Arc<Self> {
            Arc::new(Self {
                params,
                log: Arc::new(RecordingLog::default()),
                channel,
                interruptions: Mutex::new(Vec::new()),
            })
        }
    }

    impl RunningBuild for FakeBuild {
        fn agent_name(&self) -> String {
            "agent-1".to_string()
        }

        fn agent_params(&self) -> HashMap<String, String> {
            self.params.clone()
        }

        fn log(&self) -> Arc<dyn BuildLogSink> {
            Arc::clone(&self.log) as Arc<dyn BuildLogSink>
        }

        fn channel(&self) -> Arc<dyn AgentChannel> {
            Arc::clone(&self.channel) as Arc<dyn AgentChannel>
        }

        fn interrupt(&self, reason: &str) {
            self.interruptions.lock().unwrap().push(reason.to_string());
        }
    }

    /// Adopted running instance reachable through agent parameters.
    async fn adopted_instance_harness(
        port: &Arc<MockPort>,
    ) -> (Arc<crate::client::CloudClient>, HashMap<String, String>) {
        let source_vm = ManagedObjectRef::new(ManagedObjectRef::VIRTUAL_MACHINE, "vm-src");
        let instance_uuid = uuid::Uuid::new_v4();

        port.set_inventory(TEMPLATE_PATH, template_mor());
        port.set_inventory(FOLDER_PATH, folder_mor());
        port.push_property(
            &folder_mor(),
            "childEntity",
            PropertyValue::MorList(vec![source_vm.clone()]),
        );
        port.push_property(&source_vm, crate::image::FROZEN_PROPERTY, PropertyValue::Bool(false));
        port.push_property(
            &source_vm,
            "config.extraConfig",
            PropertyValue::Options(vec![
                OptionValue::new(guestinfo::INSTANCE_UUID, instance_uuid.to_string()),
                OptionValue::new(guestinfo::PROFILE_UUID, PROFILE_UUID),
            ]),
        );
        port.push_property(&source_vm, "name", PropertyValue::Str("img-src".into()));
        port.push_property(
            &source_vm,
            "config.hardware.device",
            PropertyValue::Ethernets(vec![]),
        );

        let client = test_client(port, 10).await;
        let params = HashMap::from([(
            INSTANCE_UUID_AGENT_PARAM.to_string(),
            instance_uuid.to_string(),
        )]);
        (client, params)
    }

    #[tokio::test]
    async fn ordinary_lines_pass_through() {
        let port = Arc::new(MockPort::new());
        seed_image_inventory(&port);
        let client = test_client(&port, 10).await;
        let detector = CloneRequestDetector::new(client);

        let channel = Arc::new(RecordingChannel::default());
        let build = FakeBuild::new(HashMap::new(), Arc::clone(&channel));
        let build: Arc<dyn RunningBuild> = build;

        assert!(!detector.translate(&build, "compiling 42 crates").await);
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_instance_still_delivers_terminal_status() {
        let port = Arc::new(MockPort::new());
        seed_image_inventory(&port);
        let client = test_client(&port, 10).await;
        let detector = CloneRequestDetector::new(client);

        let channel = Arc::new(RecordingChannel::default());
        let build = FakeBuild::new(HashMap::new(), Arc::clone(&channel));
        let fake = Arc::clone(&build);
        let build: Arc<dyn RunningBuild> = build;

        let request = CloneRequest::new("nightly");
        let marker = request.to_marker().unwrap();
        assert!(detector.translate(&build, &marker).await);

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (agent, message) = &sent[0];
        assert_eq!(agent, "agent-1");
        assert_eq!(message.method, CLONE_STATUS_METHOD);
        assert_eq!(message.correlation_id, request.correlation_id);
        assert_eq!(message.parse_clone_status().unwrap(), CloneStatus::Fail);
        assert!(fake.log.contains("no managed instance found"));
    }

    #[tokio::test]
    async fn successful_clone_reports_ok_with_same_correlation_id() {
        let port = Arc::new(MockPort::new());
        let (client, params) = adopted_instance_harness(&port).await;

        let new_vm = ManagedObjectRef::new(ManagedObjectRef::VIRTUAL_MACHINE, "vm-new");
        port.script_clone_ok(new_vm.clone());
        port.push_property(&new_vm, crate::image::FROZEN_PROPERTY, PropertyValue::Bool(true));

        let detector = CloneRequestDetector::new(client);
        let channel = Arc::new(RecordingChannel::default());
        let build = FakeBuild::new(params, Arc::clone(&channel));
        let fake = Arc::clone(&build);
        let build: Arc<dyn RunningBuild> = build;

        let request = CloneRequest::new("");
        assert!(
            detector
                .translate(&build, &request.to_marker().unwrap())
                .await
        );

        wait_until("status callback", || !channel.sent.lock().unwrap().is_empty()).await;
        let sent = channel.sent.lock().unwrap();
        let (_, message) = &sent[0];
        assert_eq!(message.correlation_id, request.correlation_id);
        assert_eq!(message.parse_clone_status().unwrap(), CloneStatus::Ok);
        assert!(fake.log.contains("Clone success"));
    }

    #[tokio::test]
    async fn ineligible_instance_reports_fail_synchronously() {
        let port = Arc::new(MockPort::new());
        let (client, params) = adopted_instance_harness(&port).await;

        // push the instance out of RUNNING before the request arrives
        let instance = client.find_instance_by_agent(&params).unwrap();
        let vm = instance.vm_ref().unwrap();
        port.push_property(
            &vm,
            &crate::instance::guest_state_property(),
            PropertyValue::Str(guestinfo::STATE_SHUTDOWN.into()),
        );
        instance.terminate();

        let detector = CloneRequestDetector::new(client);
        let channel = Arc::new(RecordingChannel::default());
        let build = FakeBuild::new(params, Arc::clone(&channel));
        let build: Arc<dyn RunningBuild> = build;

        let request = CloneRequest::new("");
        detector
            .translate(&build, &request.to_marker().unwrap())
            .await;

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1.parse_clone_status().unwrap(),
            CloneStatus::Fail
        );
    }

    #[tokio::test]
    async fn undeliverable_callback_interrupts_the_build() {
        let port = Arc::new(MockPort::new());
        seed_image_inventory(&port);
        let client = test_client(&port, 10).await;
        let detector = CloneRequestDetector::new(client);

        let channel = Arc::new(RecordingChannel {
            fail: true,
            ..RecordingChannel::default()
        });
        let build = FakeBuild::new(HashMap::new(), Arc::clone(&channel));
        let fake = Arc::clone(&build);
        let build: Arc<dyn RunningBuild> = build;

        let request = CloneRequest::new("");
        detector
            .translate(&build, &request.to_marker().unwrap())
            .await;

        let interruptions = fake.interruptions.lock().unwrap();
        assert_eq!(interruptions.len(), 1);
        assert!(interruptions[0].contains("clone status"));
    }
}
