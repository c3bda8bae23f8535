//! Cloud image: the template an instance family is cloned from, its
//! placement, capacity limit and the authoritative per-image instance map.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use instaclone_vim::{
    ManagedObjectRef, NetworkBacking, NicChange, RelocateSpec, VimError, VimSession,
};

use crate::client::CloudClient;
use crate::config::CloneTuning;
use crate::error::{CloudError, CloudResult};
use crate::instance::CloudInstance;
use crate::naming::{self, Generation};

/// Marker property set on a VM that was just used as an instant-clone
/// source; frozen VMs are generation templates, not live instances.
pub(crate) const FROZEN_PROPERTY: &str = "runtime.instantCloneFrozen";

/// Resolved placement of an image's instances.
#[derive(Debug, Clone)]
pub struct ImagePlacement {
    pub instance_folder: ManagedObjectRef,
    pub resource_pool: Option<ManagedObjectRef>,
    pub datastore: Option<ManagedObjectRef>,
}

pub struct CloudImage {
    id: String,
    name: String,
    template: String,
    placement: ImagePlacement,
    networks: Vec<String>,
    max_instances: usize,
    shutdown_timeout: Duration,
    agent_pool_id: Option<i64>,
    tuning: CloneTuning,
    client: Weak<CloudClient>,

    instances: DashMap<Uuid, Arc<CloudInstance>>,
    name_counter: AtomicU64,
    admission: Mutex<()>,
}

#[allow(clippy::too_many_arguments)]
impl CloudImage {
    pub(crate) fn new(
        id: String,
        name: String,
        template: String,
        placement: ImagePlacement,
        networks: Vec<String>,
        max_instances: usize,
        shutdown_timeout: Duration,
        agent_pool_id: Option<i64>,
        tuning: CloneTuning,
        client: Weak<CloudClient>,
    ) -> Self {
        Self {
            id,
            name,
            template,
            placement,
            networks,
            max_instances,
            shutdown_timeout,
            agent_pool_id,
            tuning,
            client,
            instances: DashMap::new(),
            name_counter: AtomicU64::new(0),
            admission: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn agent_pool_id(&self) -> Option<i64> {
        self.agent_pool_id
    }

    pub fn tuning(&self) -> &CloneTuning {
        &self.tuning
    }

    pub(crate) fn instance_folder(&self) -> &ManagedObjectRef {
        &self.placement.instance_folder
    }

    pub(crate) fn client(&self) -> CloudResult<Arc<CloudClient>> {
        self.client.upgrade().ok_or(CloudError::Disposed)
    }

    /// Monotonically increasing per-image instance name.
    pub fn allocate_name(&self) -> String {
        let n = self.name_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.name, n)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instances(&self) -> Vec<Arc<CloudInstance>> {
        self.instances.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn find_instance(&self, uuid: &Uuid) -> Option<Arc<CloudInstance>> {
        self.instances.get(uuid).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn insert_instance(&self, instance: &Arc<CloudInstance>) {
        self.instances.insert(instance.uuid(), Arc::clone(instance));
    }

    pub(crate) fn remove_instance(&self, uuid: &Uuid) {
        self.instances.remove(uuid);
    }

    /// Serializes admission decisions; never held across hypervisor calls.
    pub(crate) fn admission_guard(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().unwrap()
    }

    /// The VM a fresh instance is cloned from: the configured template, or
    /// the highest-numbered frozen generation when the template path ends
    /// with the generation separator.
    pub(crate) async fn clone_source(&self, session: &VimSession) -> CloudResult<ManagedObjectRef> {
        if let Some(stripped) = self.template.strip_suffix(naming::GENERATION_SEPARATOR) {
            let family = stripped.rsplit('/').next().unwrap_or(stripped);
            let prefix = format!("{family}{}", naming::GENERATION_SEPARATOR);
            let newest = self
                .frozen_generations(session, &prefix)
                .await?
                .into_iter()
                .max_by_key(|g| g.number);
            newest.map(|g| g.mor).ok_or_else(|| {
                CloudError::InvalidConfig(format!(
                    "no frozen generation found for template {}",
                    self.template
                ))
            })
        } else {
            let template = self.template.clone();
            let found = session
                .execute(|port| {
                    let path = template.clone();
                    async move { port.find_by_inventory_path(&path).await }
                })
                .await?;
            match found {
                Some(mor) if mor.is_vm() => Ok(mor),
                _ => Err(CloudError::InvalidConfig(format!(
                    "not a VM: {}",
                    self.template
                ))),
            }
        }
    }

    /// Frozen same-family siblings in the instance folder, recognized by the
    /// name prefix and a positive generation number.
    pub(crate) async fn frozen_generations(
        &self,
        session: &VimSession,
        prefix: &str,
    ) -> CloudResult<Vec<Generation>> {
        let children = session
            .get_property(self.instance_folder(), "childEntity")
            .await?
            .into_mor_list()
            .ok_or_else(|| unexpected_shape("childEntity"))?;
        debug!(
            folder = %self.instance_folder(),
            count = children.len(),
            "scanning instance folder for frozen generations"
        );

        let mut generations = Vec::new();
        for vm in children.into_iter().filter(ManagedObjectRef::is_vm) {
            let name = match session.get_property(&vm, "name").await {
                Ok(value) => value.as_str().unwrap_or_default().to_string(),
                Err(error) => {
                    debug!(vm = %vm, %error, "skipping VM without readable name");
                    continue;
                }
            };
            if !name.starts_with(prefix) {
                continue;
            }
            let Some(number) = naming::generation_number(&name) else {
                debug!(%name, "name carries no generation number");
                continue;
            };
            let frozen = session
                .get_property(&vm, FROZEN_PROPERTY)
                .await?
                .as_bool()
                .unwrap_or(false);
            if !frozen {
                debug!(%name, "ignoring generation candidate, not frozen");
                continue;
            }
            generations.push(Generation { mor: vm, name, number });
        }
        Ok(generations)
    }

    /// Placement spec for a clone of `source`: target folder/pool/datastore
    /// plus the rewiring of the source's ethernet cards onto the image's
    /// networks, in device order.
    pub(crate) async fn relocate_spec(
        &self,
        session: &VimSession,
        source: &ManagedObjectRef,
    ) -> CloudResult<RelocateSpec> {
        let devices = session
            .get_property(source, "config.hardware.device")
            .await?
            .into_ethernets()
            .ok_or_else(|| unexpected_shape("config.hardware.device"))?;

        let mut nic_changes = Vec::new();
        for (network_path, device) in self.networks.iter().zip(devices) {
            let network = session
                .execute(|port| {
                    let path = network_path.clone();
                    async move { port.find_by_inventory_path(&path).await }
                })
                .await?
                .ok_or_else(|| {
                    CloudError::InvalidConfig(format!("network not found: {network_path}"))
                })?;

            let backing = match network.kind.as_str() {
                ManagedObjectRef::NETWORK => NetworkBacking::Standard {
                    device_name: network_path
                        .rsplit('/')
                        .next()
                        .unwrap_or(network_path)
                        .to_string(),
                    network,
                },
                ManagedObjectRef::DISTRIBUTED_PORTGROUP => {
                    let portgroup_key = session
                        .get_property(&network, "key")
                        .await?
                        .as_str()
                        .ok_or_else(|| unexpected_shape("key"))?
                        .to_string();
                    let switch = session
                        .get_property(&network, "config.distributedVirtualSwitch")
                        .await?
                        .into_mor()
                        .ok_or_else(|| unexpected_shape("config.distributedVirtualSwitch"))?;
                    let switch_uuid = session
                        .get_property(&switch, "uuid")
                        .await?
                        .as_str()
                        .ok_or_else(|| unexpected_shape("uuid"))?
                        .to_string();
                    NetworkBacking::Distributed {
                        portgroup_key,
                        switch_uuid,
                    }
                }
                other => {
                    return Err(CloudError::InvalidConfig(format!(
                        "cannot connect a {other} to a network adapter"
                    )))
                }
            };
            nic_changes.push(NicChange { device, backing });
        }

        Ok(RelocateSpec {
            folder: self.placement.instance_folder.clone(),
            pool: self.placement.resource_pool.clone(),
            datastore: self.placement.datastore.clone(),
            nic_changes,
        })
    }
}

fn unexpected_shape(path: &str) -> CloudError {
    CloudError::Vim(VimError::Protocol(format!(
        "property '{path}' had an unexpected shape"
    )))
}
