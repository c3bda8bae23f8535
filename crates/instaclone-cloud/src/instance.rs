//! Per-instance lifecycle state machine. Power transitions run on the
//! client's serial executor; clone-from-self jobs run on the shared tokio
//! pool. All hypervisor calls go through the shared [`VimSession`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use instaclone_common::{guestinfo, BootstrapConfig, INSTANCE_UUID_AGENT_PARAM};
use instaclone_vim::{
    ConfigSpec, InstantCloneSpec, ManagedObjectRef, OptionValue, PowerState, TaskWaiter,
    VimError, VimSession,
};

use crate::collaborators::BuildLogSink;
use crate::error::{CloudError, CloudResult};
use crate::executor::JobHandle;
use crate::image::{CloudImage, FROZEN_PROPERTY};
use crate::naming;

const GUEST_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Pre-adoption placeholder; never observed on a constructed instance.
    Unknown,
    ScheduledToStart,
    Starting,
    Running,
    ScheduledToStop,
    Stopping,
    Stopped,
    Error,
    ErrorCannotStop,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Stopped | InstanceStatus::Error | InstanceStatus::ErrorCannotStop
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Last failure recorded on an instance.
#[derive(Debug, Clone)]
pub struct InstanceError {
    pub message: String,
}

/// Bootstrap parameters a fresh instance embeds into guest metadata.
#[derive(Debug, Clone)]
pub struct InstanceUserData {
    /// Agent name; falls back to the allocated VM name when empty.
    pub agent_name: String,
    pub auth_token: String,
    pub server_url: String,
    pub custom_params: HashMap<String, String>,
}

/// Handle of an asynchronous clone-from-self job.
pub struct CloneJob {
    handle: JoinHandle<CloudResult<()>>,
}

impl CloneJob {
    pub async fn join(self) -> CloudResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(_) => Err(CloudError::JobAborted),
        }
    }
}

pub struct CloudInstance {
    uuid: Uuid,
    start_time: DateTime<Utc>,
    image: Weak<CloudImage>,
    session: Arc<VimSession>,
    me: Weak<CloudInstance>,

    name: RwLock<String>,
    status: RwLock<InstanceStatus>,
    error_info: RwLock<Option<InstanceError>>,
    vm: RwLock<Option<ManagedObjectRef>>,
    matched_agent_id: RwLock<Option<i64>>,

    power_on: Mutex<Option<JobHandle>>,
    power_off: Mutex<Option<JobHandle>>,
}

impl CloudInstance {
    fn base(
        image: &Arc<CloudImage>,
        session: Arc<VimSession>,
        uuid: Uuid,
        start_time: DateTime<Utc>,
        name: String,
        status: InstanceStatus,
        vm: Option<ManagedObjectRef>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            uuid,
            start_time,
            image: Arc::downgrade(image),
            session,
            me: me.clone(),
            name: RwLock::new(name),
            status: RwLock::new(status),
            error_info: RwLock::new(None),
            vm: RwLock::new(vm),
            matched_agent_id: RwLock::new(None),
            power_on: Mutex::new(None),
            power_off: Mutex::new(None),
        })
    }

    /// Creates a fresh instance and queues its power-on job.
    pub(crate) fn start_fresh(
        client: &Arc<crate::client::CloudClient>,
        image: &Arc<CloudImage>,
        user_data: InstanceUserData,
    ) -> Arc<Self> {
        let instance = Self::base(
            image,
            client.session_arc(),
            Uuid::new_v4(),
            Utc::now(),
            image.name().to_string(),
            InstanceStatus::ScheduledToStart,
            None,
        );

        let job_instance = Arc::clone(&instance);
        let job_image = Arc::clone(image);
        let handle = client.serial_executor().submit(move |cancel| async move {
            job_instance.run_power_on(job_image, user_data, cancel).await;
        });
        *instance.power_on.lock().unwrap() = Some(handle);
        instance
    }

    /// Re-adopts a VM discovered during reconciliation as a running instance.
    pub(crate) fn adopt_running(
        image: &Arc<CloudImage>,
        session: Arc<VimSession>,
        uuid: Uuid,
        name: String,
        vm: ManagedObjectRef,
        start_time: DateTime<Utc>,
    ) -> Arc<Self> {
        Self::base(
            image,
            session,
            uuid,
            start_time,
            name,
            InstanceStatus::Running,
            Some(vm),
        )
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.read().unwrap()
    }

    pub fn error_info(&self) -> Option<InstanceError> {
        self.error_info.read().unwrap().clone()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn vm_ref(&self) -> Option<ManagedObjectRef> {
        self.vm.read().unwrap().clone()
    }

    pub fn matched_agent_id(&self) -> Option<i64> {
        *self.matched_agent_id.read().unwrap()
    }

    /// Records the build agent that registered from this instance.
    pub fn set_matched_agent(&self, agent_id: i64) {
        *self.matched_agent_id.write().unwrap() = Some(agent_id);
    }

    pub fn image_id(&self) -> Option<String> {
        self.image.upgrade().map(|image| image.id().to_string())
    }

    fn set_status(&self, status: InstanceStatus) {
        *self.status.write().unwrap() = status;
    }

    fn record_error(&self, error: &CloudError) {
        *self.error_info.write().unwrap() = Some(InstanceError {
            message: error.to_string(),
        });
    }

    fn image(&self) -> CloudResult<Arc<CloudImage>> {
        self.image.upgrade().ok_or(CloudError::Disposed)
    }

    fn client(&self) -> CloudResult<Arc<crate::client::CloudClient>> {
        self.image()?.client()
    }

    // --- fresh start ---

    async fn run_power_on(
        self: Arc<Self>,
        image: Arc<CloudImage>,
        user_data: InstanceUserData,
        cancel: CancellationToken,
    ) {
        self.set_status(InstanceStatus::Starting);
        match self.power_on_loop(&image, &user_data, &cancel).await {
            Ok(()) => {
                self.set_status(InstanceStatus::Running);
                info!(instance = %self.uuid, name = %self.name(), "instance is running");
            }
            Err(_) if cancel.is_cancelled() => {
                debug!(instance = %self.uuid, "start job cancelled");
            }
            Err(cause) => {
                error!(instance = %self.uuid, error = %cause, "failed to start instance");
                self.record_error(&cause);
                self.set_status(InstanceStatus::Error);
            }
        }
    }

    /// Allocates names until a clone succeeds; a duplicate-name fault is
    /// swallowed and retried with the next name, anything else aborts.
    async fn power_on_loop(
        &self,
        image: &Arc<CloudImage>,
        user_data: &InstanceUserData,
        cancel: &CancellationToken,
    ) -> CloudResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(CloudError::JobAborted);
            }
            let name = image.allocate_name();
            match self.instant_clone_fresh(image, &name, user_data).await {
                Ok(vm) => {
                    *self.vm.write().unwrap() = Some(vm);
                    *self.name.write().unwrap() = name;
                    return Ok(());
                }
                Err(cause) if cause.is_duplicate_name() => {
                    warn!(%name, "VM name already taken, retrying with a new one");
                }
                Err(cause) => return Err(cause),
            }
        }
    }

    async fn instant_clone_fresh(
        &self,
        image: &Arc<CloudImage>,
        name: &str,
        user_data: &InstanceUserData,
    ) -> CloudResult<ManagedObjectRef> {
        let source = image.clone_source(&self.session).await?;
        let location = image.relocate_spec(&self.session, &source).await?;
        let spec = InstantCloneSpec {
            name: name.to_string(),
            location,
            extra_config: self.fresh_metadata(image, name, user_data)?,
        };

        let task = self
            .session
            .execute(|port| {
                let source = source.clone();
                let spec = spec.clone();
                async move { port.instant_clone_task(&source, &spec).await }
            })
            .await?;

        TaskWaiter::new(&self.session)
            .wait(&task)
            .await?
            .ok_or_else(|| {
                CloudError::Vim(VimError::Protocol("clone task returned no VM".into()))
            })
    }

    /// Guest metadata of a fresh instance: identity annotations used to
    /// re-adopt it after a control-plane restart, plus the bootstrap blob
    /// the in-guest agent configures itself from.
    fn fresh_metadata(
        &self,
        image: &Arc<CloudImage>,
        name: &str,
        user_data: &InstanceUserData,
    ) -> CloudResult<Vec<OptionValue>> {
        let profile_uuid = image.client()?.profile_uuid().to_string();

        let mut config_params = user_data.custom_params.clone();
        config_params.insert(INSTANCE_UUID_AGENT_PARAM.to_string(), self.uuid.to_string());
        let agent_name = if user_data.agent_name.is_empty() {
            name.to_string()
        } else {
            user_data.agent_name.clone()
        };
        let blob = BootstrapConfig {
            agent_name,
            auth_token: user_data.auth_token.clone(),
            server_url: user_data.server_url.clone(),
            config_params,
        }
        .to_json()
        .map_err(|e| CloudError::InvalidConfig(format!("bootstrap blob: {e}")))?;

        Ok(vec![
            OptionValue::new(
                guestinfo::INSTANCE_START_TIME,
                self.start_time.timestamp_millis().to_string(),
            ),
            OptionValue::new(guestinfo::INSTANCE_UUID, self.uuid.to_string()),
            OptionValue::new(guestinfo::PROFILE_UUID, profile_uuid),
            OptionValue::new(guestinfo::INSTANCE_CONFIG, blob),
            OptionValue::new(guestinfo::HOSTNAME, name),
        ])
    }

    // --- termination ---

    /// Schedules the instance for termination. Idempotent: a second call
    /// while a stop job exists is a no-op. Cancels any in-flight start job
    /// before the stop job touches the hypervisor.
    pub fn terminate(&self) {
        let mut power_off = self.power_off.lock().unwrap();
        if power_off.is_some() {
            debug!(instance = %self.uuid, "stop already in flight");
            return;
        }
        self.set_status(InstanceStatus::ScheduledToStop);
        info!(instance = %self.uuid, name = %self.name(), "terminating cloud instance");

        if let Some(agent_id) = self.matched_agent_id() {
            if let Ok(client) = self.client() {
                client
                    .agents()
                    .disable_agent(agent_id, "Cloud instance is terminating");
            }
        }

        let start_job = self.power_on.lock().unwrap().take();
        if let Some(job) = &start_job {
            job.cancel();
        }

        let Ok(client) = self.client() else {
            warn!(instance = %self.uuid, "client disposed, stop job not scheduled");
            return;
        };
        let Some(instance) = self.me.upgrade() else {
            return;
        };
        let handle = client.serial_executor().submit(move |_cancel| async move {
            instance.run_power_off(start_job).await;
        });
        *power_off = Some(handle);
    }

    async fn run_power_off(self: Arc<Self>, start_job: Option<JobHandle>) {
        if let Some(job) = start_job {
            job.cancel_and_join().await;
        }
        self.set_status(InstanceStatus::Stopping);

        match self.shutdown_and_destroy().await {
            Ok(()) => {
                self.set_status(InstanceStatus::Stopped);
                if let Some(image) = self.image.upgrade() {
                    image.remove_instance(&self.uuid);
                }
                info!(instance = %self.uuid, "instance stopped and removed");
            }
            Err(cause) => {
                error!(instance = %self.uuid, error = %cause, "failed to stop instance");
                self.record_error(&cause);
                self.set_status(InstanceStatus::ErrorCannotStop);
            }
        }
    }

    async fn shutdown_and_destroy(&self) -> CloudResult<()> {
        let Some(vm) = self.vm_ref() else {
            debug!(instance = %self.uuid, "no VM was provisioned, nothing to destroy");
            return Ok(());
        };

        // The handshake is best effort; the VM goes down regardless.
        if let Err(cause) = self.graceful_guest_shutdown(&vm).await {
            warn!(instance = %self.uuid, error = %cause, "guest shutdown handshake failed");
        }

        self.power_off_and_destroy(&vm).await
    }

    /// Signals the guest and polls its reported state until it says
    /// `shutdown`, the per-image deadline elapses, or the VM leaves the
    /// powered-on state.
    async fn graceful_guest_shutdown(&self, vm: &ManagedObjectRef) -> CloudResult<()> {
        let image = self.image()?;

        let spec = ConfigSpec::set_extra_config(vec![OptionValue::new(
            guestinfo::INSTANCE_CONTROL,
            guestinfo::CONTROL_SHUTDOWN,
        )]);
        let task = self
            .session
            .execute(|port| {
                let vm = vm.clone();
                let spec = spec.clone();
                async move { port.reconfig_task(&vm, &spec).await }
            })
            .await?;
        TaskWaiter::new(&self.session).wait(&task).await?;

        let mut state = self.guest_state(vm).await;
        if state != guestinfo::STATE_READY && state != guestinfo::STATE_SHUTDOWN {
            let _ = self
                .session
                .execute(|port| {
                    let vm = vm.clone();
                    async move { port.shutdown_guest(&vm).await }
                })
                .await;
        }

        let deadline = tokio::time::Instant::now() + image.shutdown_timeout();
        while state != guestinfo::STATE_SHUTDOWN && tokio::time::Instant::now() < deadline {
            let power = self
                .session
                .get_property(vm, "runtime.powerState")
                .await
                .ok()
                .and_then(|v| v.as_str().and_then(PowerState::from_wire));
            if power != Some(PowerState::PoweredOn) {
                break;
            }
            tokio::time::sleep(GUEST_POLL_INTERVAL).await;
            state = self.guest_state(vm).await;
        }
        Ok(())
    }

    /// Powers the VM off (tolerated to fail, it may already be off) and
    /// destroys it (failure propagates).
    pub(crate) async fn power_off_and_destroy(&self, vm: &ManagedObjectRef) -> CloudResult<()> {
        let powered_off: CloudResult<()> = async {
            let task = self
                .session
                .execute(|port| {
                    let vm = vm.clone();
                    async move { port.power_off_task(&vm).await }
                })
                .await?;
            TaskWaiter::new(&self.session).wait(&task).await?;
            Ok(())
        }
        .await;
        if let Err(cause) = powered_off {
            info!(vm = %vm, error = %cause, "power off failed, may already be off");
        }

        let task = self
            .session
            .execute(|port| {
                let vm = vm.clone();
                async move { port.destroy_task(&vm).await }
            })
            .await?;
        TaskWaiter::new(&self.session).wait(&task).await?;
        Ok(())
    }

    async fn guest_state(&self, vm: &ManagedObjectRef) -> String {
        match self
            .session
            .get_property(vm, &guest_state_property())
            .await
        {
            Ok(value) => value.as_str().unwrap_or_default().to_string(),
            Err(_) => String::new(),
        }
    }

    // --- clone from self ---

    /// Starts an asynchronous clone of this instance. Rejected synchronously
    /// when the instance is not running or has no VM handle; no job is
    /// started in that case.
    pub fn create_clone(
        &self,
        name_suffix: &str,
        build_log: Arc<dyn BuildLogSink>,
    ) -> CloudResult<CloneJob> {
        let Some(vm) = self.vm_ref() else {
            warn!(instance = %self.uuid, "cannot clone, no VM reference available");
            return Err(CloudError::NotEligible(format!(
                "instance '{}' has no VM reference",
                self.name()
            )));
        };
        if self.status() != InstanceStatus::Running {
            warn!(instance = %self.uuid, status = %self.status(), "cannot clone, instance is not running");
            return Err(CloudError::NotEligible(format!(
                "instance '{}' is not in the RUNNING state",
                self.name()
            )));
        }
        let image = self.image()?;

        let instance = self.me.upgrade().ok_or(CloudError::Disposed)?;
        let suffix = name_suffix.to_string();
        let handle = tokio::spawn(async move {
            let result = instance
                .run_clone(image, vm, suffix, build_log)
                .await;
            if let Err(cause) = &result {
                error!(instance = %instance.uuid, error = %cause, "clone job failed");
            }
            result
        });
        Ok(CloneJob { handle })
    }

    async fn run_clone(
        &self,
        image: Arc<CloudImage>,
        source: ManagedObjectRef,
        suffix: String,
        build_log: Arc<dyn BuildLogSink>,
    ) -> CloudResult<()> {
        let sep_suffix = naming::separator_suffix(&suffix);
        let final_name = naming::generation_name(
            image.name(),
            &sep_suffix,
            Utc::now().timestamp_millis(),
        );
        let temp_name = format!("temp-{final_name}");
        info!(instance = %self.uuid, clone = %temp_name, "creating instant clone from running instance");

        if self.status() != InstanceStatus::Running {
            return Err(CloudError::NotEligible(format!(
                "instance '{}' left the RUNNING state",
                self.name()
            )));
        }

        build_log.info(&format!("Making clone with name {temp_name}"));
        let cleared = guestinfo::IDENTITY_KEYS
            .iter()
            .map(|key| OptionValue::new(*key, ""))
            .collect();
        let location = image.relocate_spec(&self.session, &source).await?;
        let spec = InstantCloneSpec {
            name: temp_name.clone(),
            location,
            extra_config: cleared,
        };
        let task = self
            .session
            .execute(|port| {
                let source = source.clone();
                let spec = spec.clone();
                async move { port.instant_clone_task(&source, &spec).await }
            })
            .await?;
        let new_vm = TaskWaiter::new(&self.session)
            .wait(&task)
            .await?
            .ok_or_else(|| {
                CloudError::Vim(VimError::Protocol("clone task returned no VM".into()))
            })?;

        build_log.info(&format!("Rebooting VM {temp_name}"));
        let task = self
            .session
            .execute(|port| {
                let vm = new_vm.clone();
                async move { port.reset_task(&vm).await }
            })
            .await?;
        TaskWaiter::new(&self.session).wait(&task).await?;

        build_log.info(&format!("Renaming VM {temp_name} to {final_name}"));
        let rename = ConfigSpec::rename(&final_name);
        let task = self
            .session
            .execute(|port| {
                let vm = new_vm.clone();
                let spec = rename.clone();
                async move { port.reconfig_task(&vm, &spec).await }
            })
            .await?;
        TaskWaiter::new(&self.session).wait(&task).await?;

        let tuning = image.tuning();
        let wait_total = tuning.freeze_initial_delay + tuning.freeze_poll_window;
        build_log.info(&format!(
            "Waiting for VM {final_name} to freeze, up to {} seconds",
            wait_total.as_secs()
        ));
        self.wait_for_freeze(&new_vm, &final_name).await?;

        build_log.info("Searching for superseded clone generations");
        self.retire_generations(&image, &sep_suffix, build_log.as_ref())
            .await?;

        info!(instance = %self.uuid, clone = %final_name, "instant clone finished and frozen");
        Ok(())
    }

    /// Fixed initial delay, then a bounded polling window; not freezing in
    /// time is fatal to the clone job.
    async fn wait_for_freeze(&self, vm: &ManagedObjectRef, name: &str) -> CloudResult<()> {
        let tuning = self.image()?.tuning().clone();
        tokio::time::sleep(tuning.freeze_initial_delay).await;
        let deadline = tokio::time::Instant::now() + tuning.freeze_poll_window;
        loop {
            let frozen = self
                .session
                .get_property(vm, FROZEN_PROPERTY)
                .await?
                .as_bool()
                .unwrap_or(false);
            if frozen {
                info!(clone = %name, "VM is frozen and ready for use");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CloudError::FreezeTimeout(name.to_string()));
            }
            tokio::time::sleep(tuning.freeze_poll_interval).await;
        }
    }

    /// Destroys frozen same-family generations beyond the retention count,
    /// newest first kept.
    async fn retire_generations(
        &self,
        image: &Arc<CloudImage>,
        sep_suffix: &str,
        build_log: &dyn BuildLogSink,
    ) -> CloudResult<()> {
        let prefix = naming::family_prefix(image.name(), sep_suffix);
        let mut generations = image.frozen_generations(&self.session, &prefix).await?;
        generations.sort_by(|a, b| b.number.cmp(&a.number));

        let tuning = image.tuning();
        for old in generations.into_iter().skip(tuning.generation_retention) {
            info!(vm = %old.name, "destroying superseded clone generation");
            build_log.info(&format!("Destroying superseded clone {}", old.name));
            match self.power_off_and_destroy(&old.mor).await {
                Ok(()) => {}
                Err(cause) if !tuning.cleanup_failure_fatal => {
                    warn!(vm = %old.name, error = %cause, "failed to destroy superseded clone");
                    build_log.error_line(&format!("Failed to destroy {}: {cause}", old.name));
                }
                Err(cause) => {
                    build_log.error_line(&format!("Failed to destroy {}: {cause}", old.name));
                    return Err(cause);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CloudInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudInstance")
            .field("uuid", &self.uuid)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

/// Property path of the guest-reported lifecycle state.
pub(crate) fn guest_state_property() -> String {
    format!(
        "config.extraConfig[\"{}\"].value",
        guestinfo::INSTANCE_STATE
    )
}
