//! The per-profile cloud client: builds images from configuration, recovers
//! already-running instances after a control-plane restart, enforces the
//! capacity policy and owns the execution pools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use instaclone_common::{guestinfo, INSTANCE_UUID_AGENT_PARAM};
use instaclone_vim::{ManagedObjectRef, SoapPort, VimSession};

use crate::collaborators::{
    AgentPoolLookup, BuildAgentRegistry, CredentialResolver,
};
use crate::config::{AgentPoolRef, CloneTuning, ImageConfig};
use crate::error::{CloudError, CloudResult};
use crate::executor::SerialExecutor;
use crate::image::{CloudImage, ImagePlacement, FROZEN_PROPERTY};
use crate::instance::{CloudInstance, InstanceUserData};

pub const AT_CAPACITY_REASON: &str = "all instance slots of the image are in use";

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Yes,
    No(String),
}

pub struct CloudClient {
    profile_uuid: String,
    session: Arc<VimSession>,
    images: DashMap<String, Arc<CloudImage>>,
    serial: SerialExecutor,
    agents: Arc<dyn BuildAgentRegistry>,
    disposed: AtomicBool,
    me: std::sync::Weak<CloudClient>,
}

impl CloudClient {
    /// Builds the client and its images from profile configuration, then
    /// reconciles each image against the hypervisor inventory so instances
    /// that survived a control-plane restart show up again.
    pub async fn connect(
        session: Arc<VimSession>,
        profile_uuid: impl Into<String>,
        image_configs: HashMap<String, ImageConfig>,
        tuning: CloneTuning,
        agents: Arc<dyn BuildAgentRegistry>,
        pools: Arc<dyn AgentPoolLookup>,
    ) -> CloudResult<Arc<Self>> {
        let profile_uuid = profile_uuid.into();
        let client = Arc::new_cyclic(|me| Self {
            profile_uuid,
            session,
            images: DashMap::new(),
            serial: SerialExecutor::new(),
            agents,
            disposed: AtomicBool::new(false),
            me: me.clone(),
        });

        info!(profile = %client.profile_uuid, images = image_configs.len(), "creating cloud client");
        for (image_name, config) in image_configs {
            client
                .setup_image(image_name, config, tuning.clone(), pools.as_ref())
                .await?;
        }
        Ok(client)
    }

    pub fn profile_uuid(&self) -> &str {
        &self.profile_uuid
    }

    pub fn session(&self) -> &VimSession {
        &self.session
    }

    pub(crate) fn session_arc(&self) -> Arc<VimSession> {
        Arc::clone(&self.session)
    }

    pub(crate) fn serial_executor(&self) -> &SerialExecutor {
        &self.serial
    }

    pub(crate) fn agents(&self) -> &dyn BuildAgentRegistry {
        self.agents.as_ref()
    }

    pub fn images(&self) -> Vec<Arc<CloudImage>> {
        self.images.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn find_image(&self, id: &str) -> Option<Arc<CloudImage>> {
        self.images.get(id).map(|e| Arc::clone(e.value()))
    }

    async fn setup_image(
        &self,
        image_name: String,
        config: ImageConfig,
        tuning: CloneTuning,
        pools: &dyn AgentPoolLookup,
    ) -> CloudResult<()> {
        let template = config.template.clone();
        let Some((parent, _)) = template.rsplit_once('/') else {
            return Err(CloudError::InvalidConfig(format!(
                "invalid template path: {template}"
            )));
        };

        // The fixed template must exist up front; a generation family is
        // resolved at clone time instead.
        if !template.ends_with(crate::naming::GENERATION_SEPARATOR) {
            let vm = self.find_path(&template).await?;
            if !vm.map(|m| m.is_vm()).unwrap_or(false) {
                return Err(CloudError::InvalidConfig(format!("not a VM: {template}")));
            }
        }

        let folder_path = config
            .instance_folder
            .clone()
            .unwrap_or_else(|| parent.to_string());
        let folder = self
            .find_path(&folder_path)
            .await?
            .filter(|m| m.is_folder())
            .ok_or_else(|| CloudError::InvalidConfig(format!("not a folder: {folder_path}")))?;

        let resource_pool = match &config.resource_pool {
            Some(path) => Some(
                self.find_path(path)
                    .await?
                    .filter(|m| m.kind == ManagedObjectRef::RESOURCE_POOL)
                    .ok_or_else(|| {
                        CloudError::InvalidConfig(format!("resource pool not found: {path}"))
                    })?,
            ),
            None => None,
        };

        let datastore = match &config.datastore {
            Some(path) => Some(
                self.find_path(path)
                    .await?
                    .filter(|m| m.kind == ManagedObjectRef::DATASTORE)
                    .ok_or_else(|| {
                        CloudError::InvalidConfig(format!("datastore not found: {path}"))
                    })?,
            ),
            None => None,
        };

        let agent_pool_id = match &config.agent_pool {
            Some(AgentPoolRef::Id(id)) => Some(*id),
            Some(AgentPoolRef::Name(name)) => pools.pool_id_by_name(name),
            None => None,
        };

        let image = Arc::new(CloudImage::new(
            image_name.clone(),
            image_name.clone(),
            template,
            ImagePlacement {
                instance_folder: folder,
                resource_pool,
                datastore,
            },
            config.network.clone(),
            config.max_instances,
            config.shutdown_timeout(),
            agent_pool_id,
            tuning,
            self.me.clone(),
        ));

        self.reconcile_image(&image).await?;
        self.images.insert(image_name, image);
        Ok(())
    }

    async fn find_path(&self, path: &str) -> CloudResult<Option<ManagedObjectRef>> {
        Ok(self
            .session
            .execute(|port| {
                let path = path.to_string();
                async move { port.find_by_inventory_path(&path).await }
            })
            .await?)
    }

    /// Re-adopts VMs in the image's instance folder that carry this
    /// profile's annotations. Frozen VMs are generation templates and are
    /// skipped; so is anything without a readable configuration.
    async fn reconcile_image(&self, image: &Arc<CloudImage>) -> CloudResult<()> {
        info!(image = %image.id(), "searching instance folder for existing instances");
        let children = self
            .session
            .get_property(image.instance_folder(), "childEntity")
            .await?
            .into_mor_list()
            .unwrap_or_default();

        let mut adopted = 0usize;
        for vm in children.into_iter().filter(ManagedObjectRef::is_vm) {
            let frozen = self
                .session
                .get_property(&vm, FROZEN_PROPERTY)
                .await
                .ok()
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if frozen {
                debug!(vm = %vm, "skipping frozen generation template");
                continue;
            }

            let Ok(extra) = self.session.get_property(&vm, "config.extraConfig").await else {
                continue;
            };
            let Some(options) = extra.into_options() else {
                continue;
            };
            let lookup = |key: &str| {
                options
                    .iter()
                    .find(|o| o.key == key)
                    .map(|o| o.value.clone())
            };

            let Some(instance_uuid) = lookup(guestinfo::INSTANCE_UUID) else {
                continue;
            };
            if lookup(guestinfo::PROFILE_UUID).as_deref() != Some(self.profile_uuid.as_str()) {
                continue;
            }
            let Ok(uuid) = Uuid::parse_str(&instance_uuid) else {
                warn!(vm = %vm, %instance_uuid, "unparseable instance uuid annotation");
                continue;
            };

            let name = self
                .session
                .get_property(&vm, "name")
                .await
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| image.name().to_string());
            let start_time = lookup(guestinfo::INSTANCE_START_TIME)
                .and_then(|raw| raw.parse::<i64>().ok())
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .unwrap_or_else(Utc::now);

            let instance = CloudInstance::adopt_running(
                image,
                self.session_arc(),
                uuid,
                name.clone(),
                vm,
                start_time,
            );
            image.insert_instance(&instance);
            adopted += 1;
            info!(image = %image.id(), %name, %uuid, "re-adopted running instance");
        }
        info!(image = %image.id(), adopted, "reconciliation finished");
        Ok(())
    }

    /// Capacity check with eviction: while the image is full, a terminal
    /// instance is dropped from the registry; a non-terminal instance is
    /// never evicted. Denial is a structured decision, not an error.
    pub fn can_start_instance(&self, image: &Arc<CloudImage>) -> AdmissionDecision {
        let _guard = image.admission_guard();
        self.evict_until_capacity(image)
    }

    fn evict_until_capacity(&self, image: &Arc<CloudImage>) -> AdmissionDecision {
        while image.instance_count() >= image.max_instances() {
            let victim = image
                .instances()
                .into_iter()
                .find(|instance| instance.status().is_terminal());
            match victim {
                Some(instance) => {
                    info!(
                        image = %image.id(),
                        instance = %instance.uuid(),
                        status = %instance.status(),
                        "evicting terminal instance to free capacity"
                    );
                    image.remove_instance(&instance.uuid());
                }
                None => return AdmissionDecision::No(AT_CAPACITY_REASON.to_string()),
            }
        }
        AdmissionDecision::Yes
    }

    /// Creates a fresh instance and schedules its power-on. Admission runs
    /// under the image's admission lock so concurrent starts cannot
    /// overshoot `max_instances`.
    pub fn start_instance(
        &self,
        image: &Arc<CloudImage>,
        user_data: InstanceUserData,
    ) -> CloudResult<Arc<CloudInstance>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(CloudError::Disposed);
        }
        let this = self.me.upgrade().ok_or(CloudError::Disposed)?;

        let _guard = image.admission_guard();
        if let AdmissionDecision::No(reason) = self.evict_until_capacity(image) {
            return Err(CloudError::CannotStart(reason));
        }

        info!(image = %image.id(), "starting new cloud instance");
        let instance = CloudInstance::start_fresh(&this, image, user_data);
        image.insert_instance(&instance);
        Ok(instance)
    }

    pub fn terminate_instance(&self, instance: &Arc<CloudInstance>) {
        instance.terminate();
    }

    /// Maps a registered build agent back to its instance via the uuid
    /// configuration parameter the bootstrap blob planted.
    pub fn find_instance_by_agent(
        &self,
        agent_params: &HashMap<String, String>,
    ) -> Option<Arc<CloudInstance>> {
        let uuid = agent_params
            .get(INSTANCE_UUID_AGENT_PARAM)
            .and_then(|raw| Uuid::parse_str(raw).ok())?;
        self.images
            .iter()
            .find_map(|entry| entry.value().find_instance(&uuid))
    }

    /// Records the agent id on the matching instance so termination can
    /// disable it before powering off.
    pub fn register_agent(
        &self,
        agent_params: &HashMap<String, String>,
        agent_id: i64,
    ) -> Option<Arc<CloudInstance>> {
        let instance = self.find_instance_by_agent(agent_params)?;
        instance.set_matched_agent(agent_id);
        Some(instance)
    }

    /// Closes the serial executor. Queued and in-flight power transitions
    /// are abandoned; clone jobs already running finish independently and
    /// log their own outcome.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            info!(profile = %self.profile_uuid, "disposing cloud client");
            self.serial.close();
        }
    }
}

impl Drop for CloudClient {
    fn drop(&mut self) {
        self.serial.close();
    }
}

/// Builds a session from resolved account credentials. The resolver is the
/// external credential store; the core never persists secrets.
pub fn session_for_account(
    resolver: &dyn CredentialResolver,
    account_id: &str,
) -> CloudResult<Arc<VimSession>> {
    let credentials = resolver.resolve(account_id).ok_or_else(|| {
        CloudError::InvalidConfig(format!("unknown vCenter account: {account_id}"))
    })?;
    let port = SoapPort::new(credentials.url).map_err(CloudError::Vim)?;
    Ok(Arc::new(VimSession::new(
        Arc::new(port),
        credentials.username,
        credentials.secret,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ResolvedCredentials;
    use crate::instance::{InstanceStatus, InstanceUserData};
    use crate::testing::*;
    use instaclone_vim::mock::MockPort;
    use instaclone_vim::types::{FaultKind, MethodFault, OptionValue, PropertyValue};
    use instaclone_vim::VimPort;

    fn user_data() -> InstanceUserData {
        InstanceUserData {
            agent_name: String::new(),
            auth_token: "tok".to_string(),
            server_url: "https://ci.example.com".to_string(),
            custom_params: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn admission_evicts_only_terminal_instances() {
        let port = Arc::new(MockPort::new());
        seed_image_inventory(&port);
        let client = test_client(&port, 1).await;
        let image = client.find_image("img").unwrap();

        // a failed start leaves a terminal instance behind
        port.script_clone_fault(MethodFault::new(
            FaultKind::Other("InsufficientResourcesFault".into()),
            "no room",
        ));
        let failed = client.start_instance(&image, user_data()).unwrap();
        wait_until("instance errored", || {
            failed.status() == InstanceStatus::Error
        })
        .await;

        assert_eq!(image.instance_count(), 1);
        assert_eq!(client.can_start_instance(&image), AdmissionDecision::Yes);
        assert_eq!(image.instance_count(), 0);

        // a healthy instance is never evicted
        let running = client.start_instance(&image, user_data()).unwrap();
        wait_until("instance running", || {
            running.status() == InstanceStatus::Running
        })
        .await;
        assert_eq!(
            client.can_start_instance(&image),
            AdmissionDecision::No(AT_CAPACITY_REASON.to_string())
        );
        assert!(image.find_instance(&running.uuid()).is_some());
    }

    #[tokio::test]
    async fn concurrent_starts_never_overshoot_capacity() {
        let port = Arc::new(MockPort::new());
        seed_image_inventory(&port);
        let client = test_client(&port, 3).await;
        let image = client.find_image("img").unwrap();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let client = Arc::clone(&client);
            let image = Arc::clone(&image);
            tasks.push(tokio::spawn(async move {
                client.start_instance(&image, user_data()).is_ok()
            }));
        }

        let mut started = 0;
        for task in tasks {
            if task.await.unwrap() {
                started += 1;
            }
        }

        assert_eq!(started, 3);
        assert_eq!(image.instance_count(), 3);
        for instance in image.instances() {
            wait_until("instance settled", || {
                instance.status() == InstanceStatus::Running
            })
            .await;
        }
    }

    #[tokio::test]
    async fn reconcile_readopts_only_own_unfrozen_instances() {
        let port = Arc::new(MockPort::new());
        port.set_inventory(TEMPLATE_PATH, template_mor());
        port.set_inventory(FOLDER_PATH, folder_mor());

        let frozen_vm = ManagedObjectRef::new(ManagedObjectRef::VIRTUAL_MACHINE, "vm-frozen");
        port.push_property(&frozen_vm, crate::image::FROZEN_PROPERTY, PropertyValue::Bool(true));

        let ours = ManagedObjectRef::new(ManagedObjectRef::VIRTUAL_MACHINE, "vm-ours");
        let ours_uuid = Uuid::new_v4();
        port.push_property(&ours, crate::image::FROZEN_PROPERTY, PropertyValue::Bool(false));
        port.push_property(
            &ours,
            "config.extraConfig",
            PropertyValue::Options(vec![
                OptionValue::new(guestinfo::INSTANCE_UUID, ours_uuid.to_string()),
                OptionValue::new(guestinfo::PROFILE_UUID, PROFILE_UUID),
                OptionValue::new(guestinfo::INSTANCE_START_TIME, "1700000000000"),
            ]),
        );
        port.push_property(&ours, "name", PropertyValue::Str("img-4".into()));

        let foreign = ManagedObjectRef::new(ManagedObjectRef::VIRTUAL_MACHINE, "vm-foreign");
        port.push_property(&foreign, crate::image::FROZEN_PROPERTY, PropertyValue::Bool(false));
        port.push_property(
            &foreign,
            "config.extraConfig",
            PropertyValue::Options(vec![
                OptionValue::new(guestinfo::INSTANCE_UUID, Uuid::new_v4().to_string()),
                OptionValue::new(guestinfo::PROFILE_UUID, "someone-else"),
            ]),
        );

        port.push_property(
            &folder_mor(),
            "childEntity",
            PropertyValue::MorList(vec![frozen_vm, ours.clone(), foreign]),
        );

        let client = test_client(&port, 10).await;
        let image = client.find_image("img").unwrap();

        assert_eq!(image.instance_count(), 1);
        let adopted = image.find_instance(&ours_uuid).unwrap();
        assert_eq!(adopted.status(), InstanceStatus::Running);
        assert_eq!(adopted.name(), "img-4");
        assert_eq!(adopted.vm_ref(), Some(ours));
        assert_eq!(adopted.start_time().timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn matched_agent_is_disabled_on_terminate() {
        let port = Arc::new(MockPort::new());
        seed_image_inventory(&port);

        let agents = Arc::new(RecordingAgents::default());
        let session = Arc::new(VimSession::new(
            Arc::clone(&port) as Arc<dyn VimPort>,
            "ci",
            "secret",
        ));
        let client = CloudClient::connect(
            session,
            PROFILE_UUID,
            HashMap::from([("img".to_string(), image_config(10))]),
            fast_tuning(),
            Arc::clone(&agents) as Arc<dyn BuildAgentRegistry>,
            Arc::new(StaticPools::default()),
        )
        .await
        .unwrap();
        let image = client.find_image("img").unwrap();

        let instance = client.start_instance(&image, user_data()).unwrap();
        wait_until("instance running", || {
            instance.status() == InstanceStatus::Running
        })
        .await;

        let params = HashMap::from([(
            INSTANCE_UUID_AGENT_PARAM.to_string(),
            instance.uuid().to_string(),
        )]);
        assert!(client.register_agent(&params, 42).is_some());
        assert_eq!(
            client.find_instance_by_agent(&params).unwrap().uuid(),
            instance.uuid()
        );

        let vm = instance.vm_ref().unwrap();
        port.push_property(
            &vm,
            &crate::instance::guest_state_property(),
            PropertyValue::Str(guestinfo::STATE_SHUTDOWN.into()),
        );
        client.terminate_instance(&instance);
        wait_until("instance removed", || {
            image.find_instance(&instance.uuid()).is_none()
        })
        .await;

        let disabled = agents.disabled.lock().unwrap();
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].0, 42);
    }

    #[tokio::test]
    async fn disposed_client_rejects_new_starts() {
        let port = Arc::new(MockPort::new());
        seed_image_inventory(&port);
        let client = test_client(&port, 10).await;
        let image = client.find_image("img").unwrap();

        client.dispose();
        let result = client.start_instance(&image, user_data());
        assert!(matches!(result, Err(CloudError::Disposed)));
    }

    #[tokio::test]
    async fn session_resolves_through_credential_store() {
        struct OneAccount;
        impl CredentialResolver for OneAccount {
            fn resolve(&self, account_id: &str) -> Option<ResolvedCredentials> {
                (account_id == "lab").then(|| ResolvedCredentials {
                    url: "https://vcenter.lab.example.com/sdk".to_string(),
                    username: "ci".to_string(),
                    secret: "secret".to_string(),
                })
            }
        }

        assert!(session_for_account(&OneAccount, "lab").is_ok());
        assert!(matches!(
            session_for_account(&OneAccount, "missing"),
            Err(CloudError::InvalidConfig(_))
        ));
    }
}
