//! Scripted in-memory [`VimPort`] used by unit and integration tests across
//! the workspace. Behavior is programmed per operation: property values are
//! served from sticky queues (the last value keeps being served), task
//! producing operations consume outcome queues and default to success.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{PropertyErrorKind, VimError, VimResult};
use crate::port::VimPort;
use crate::types::{
    ConfigSpec, InstantCloneSpec, ManagedObjectRef, MethodFault, PropertyValue, TaskInfo,
    TaskState,
};

type Outcome = Result<Option<ManagedObjectRef>, MethodFault>;

#[derive(Default)]
pub struct MockPort {
    pub login_calls: AtomicUsize,
    auth_faults: AtomicUsize,
    session_active: AtomicBool,

    inventory: Mutex<HashMap<String, ManagedObjectRef>>,
    properties: Mutex<HashMap<(String, String), VecDeque<PropertyValue>>>,
    tasks: Mutex<HashMap<String, VecDeque<TaskInfo>>>,
    task_seq: AtomicUsize,
    clone_seq: AtomicUsize,

    clone_outcomes: Mutex<VecDeque<Outcome>>,
    pending_clones: AtomicUsize,
    power_off_outcomes: Mutex<VecDeque<Outcome>>,
    destroy_outcomes: Mutex<VecDeque<Outcome>>,

    pub clone_calls: Mutex<Vec<InstantCloneSpec>>,
    pub power_offs: Mutex<Vec<String>>,
    pub destroys: Mutex<Vec<String>>,
    pub reconfigs: Mutex<Vec<(String, ConfigSpec)>>,
    pub resets: Mutex<Vec<String>>,
    pub guest_shutdowns: Mutex<Vec<String>>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` non-session operations fail with an auth fault.
    pub fn inject_auth_faults(&self, n: usize) {
        self.auth_faults.fetch_add(n, Ordering::SeqCst);
    }

    pub fn set_session_active(&self, active: bool) {
        self.session_active.store(active, Ordering::SeqCst);
    }

    pub fn set_inventory(&self, path: &str, mor: ManagedObjectRef) {
        self.inventory
            .lock()
            .unwrap()
            .insert(path.to_string(), mor);
    }

    /// Appends a value to the property queue of `(object, path)`. The queue
    /// drains to its last element, which then keeps being served.
    pub fn push_property(&self, object: &ManagedObjectRef, path: &str, value: PropertyValue) {
        self.properties
            .lock()
            .unwrap()
            .entry((object.value.clone(), path.to_string()))
            .or_default()
            .push_back(value);
    }

    pub fn clear_property(&self, object: &ManagedObjectRef, path: &str) {
        self.properties
            .lock()
            .unwrap()
            .remove(&(object.value.clone(), path.to_string()));
    }

    /// Registers a task with a scripted `info` snapshot and returns its ref.
    pub fn record_task(&self, info: TaskInfo) -> ManagedObjectRef {
        let task = self.next_task_ref();
        self.tasks
            .lock()
            .unwrap()
            .insert(task.value.clone(), VecDeque::from([info]));
        task
    }

    /// Appends a later `info` snapshot for an existing task.
    pub fn record_task_update(&self, task: &ManagedObjectRef, info: TaskInfo) {
        self.tasks
            .lock()
            .unwrap()
            .entry(task.value.clone())
            .or_default()
            .push_back(info);
    }

    /// Scripts the next instant-clone to fail its task with `fault`.
    pub fn script_clone_fault(&self, fault: MethodFault) {
        self.clone_outcomes.lock().unwrap().push_back(Err(fault));
    }

    /// Scripts the next instant-clone to produce `vm`.
    pub fn script_clone_ok(&self, vm: ManagedObjectRef) {
        self.clone_outcomes
            .lock()
            .unwrap()
            .push_back(Ok(Some(vm)));
    }

    /// Scripts the next instant-clone task to stay in the running state
    /// forever, for cancellation tests.
    pub fn script_clone_pending(&self) {
        self.pending_clones.fetch_add(1, Ordering::SeqCst);
    }

    pub fn script_destroy_fault(&self, fault: MethodFault) {
        self.destroy_outcomes.lock().unwrap().push_back(Err(fault));
    }

    pub fn script_power_off_fault(&self, fault: MethodFault) {
        self.power_off_outcomes
            .lock()
            .unwrap()
            .push_back(Err(fault));
    }

    pub fn destroyed_vms(&self) -> Vec<String> {
        self.destroys.lock().unwrap().clone()
    }

    fn next_task_ref(&self) -> ManagedObjectRef {
        let n = self.task_seq.fetch_add(1, Ordering::SeqCst);
        ManagedObjectRef::new(ManagedObjectRef::TASK, format!("task-{n}"))
    }

    fn finish_task(&self, outcome: Outcome) -> ManagedObjectRef {
        let info = match outcome {
            Ok(result) => TaskInfo {
                state: TaskState::Success,
                error: None,
                result,
            },
            Err(fault) => TaskInfo {
                state: TaskState::Error,
                error: Some(fault),
                result: None,
            },
        };
        self.record_task(info)
    }

    fn take_outcome(queue: &Mutex<VecDeque<Outcome>>) -> Option<Outcome> {
        queue.lock().unwrap().pop_front()
    }

    fn take_auth_fault(&self) -> VimResult<()> {
        let mut current = self.auth_faults.load(Ordering::SeqCst);
        while current > 0 {
            match self.auth_faults.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(VimError::Auth("session expired".into())),
                Err(actual) => current = actual,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VimPort for MockPort {
    async fn login(&self, _username: &str, _password: &str) -> VimResult<String> {
        let n = self.login_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("session-{n}"))
    }

    async fn session_is_active(&self, _key: &str, _username: &str) -> VimResult<bool> {
        Ok(self.session_active.load(Ordering::SeqCst))
    }

    async fn logout(&self) -> VimResult<()> {
        Ok(())
    }

    async fn find_by_inventory_path(&self, path: &str) -> VimResult<Option<ManagedObjectRef>> {
        self.take_auth_fault()?;
        Ok(self.inventory.lock().unwrap().get(path).cloned())
    }

    async fn retrieve_property(
        &self,
        obj: &ManagedObjectRef,
        path: &str,
    ) -> VimResult<PropertyValue> {
        self.take_auth_fault()?;

        if obj.kind == ManagedObjectRef::TASK && path == "info" {
            let mut tasks = self.tasks.lock().unwrap();
            let queue = tasks.get_mut(&obj.value).ok_or_else(|| {
                VimError::property(path, PropertyErrorKind::ObjectNotFound, "unknown task")
            })?;
            let info = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue
                    .front()
                    .cloned()
                    .ok_or_else(|| VimError::Protocol("task queue drained".into()))?
            };
            return Ok(PropertyValue::Task(info));
        }

        let mut properties = self.properties.lock().unwrap();
        let queue = properties
            .get_mut(&(obj.value.clone(), path.to_string()))
            .ok_or_else(|| {
                VimError::property(
                    path,
                    PropertyErrorKind::Other,
                    format!("no scripted property for {obj}"),
                )
            })?;
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| VimError::Protocol("property queue drained".into()))
        }
    }

    async fn instant_clone_task(
        &self,
        _source: &ManagedObjectRef,
        spec: &InstantCloneSpec,
    ) -> VimResult<ManagedObjectRef> {
        self.take_auth_fault()?;
        self.clone_calls.lock().unwrap().push(spec.clone());

        if self
            .pending_clones
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(self.record_task(TaskInfo {
                state: TaskState::Running,
                error: None,
                result: None,
            }));
        }

        let outcome = Self::take_outcome(&self.clone_outcomes).unwrap_or_else(|| {
            let n = self.clone_seq.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ManagedObjectRef::new(
                ManagedObjectRef::VIRTUAL_MACHINE,
                format!("vm-clone-{n}"),
            )))
        });
        Ok(self.finish_task(outcome))
    }

    async fn power_off_task(&self, vm: &ManagedObjectRef) -> VimResult<ManagedObjectRef> {
        self.take_auth_fault()?;
        self.power_offs.lock().unwrap().push(vm.value.clone());
        let outcome = Self::take_outcome(&self.power_off_outcomes).unwrap_or(Ok(None));
        Ok(self.finish_task(outcome))
    }

    async fn destroy_task(&self, vm: &ManagedObjectRef) -> VimResult<ManagedObjectRef> {
        self.take_auth_fault()?;
        self.destroys.lock().unwrap().push(vm.value.clone());
        let outcome = Self::take_outcome(&self.destroy_outcomes).unwrap_or(Ok(None));
        Ok(self.finish_task(outcome))
    }

    async fn reconfig_task(
        &self,
        vm: &ManagedObjectRef,
        spec: &ConfigSpec,
    ) -> VimResult<ManagedObjectRef> {
        self.take_auth_fault()?;
        self.reconfigs
            .lock()
            .unwrap()
            .push((vm.value.clone(), spec.clone()));
        Ok(self.finish_task(Ok(None)))
    }

    async fn reset_task(&self, vm: &ManagedObjectRef) -> VimResult<ManagedObjectRef> {
        self.take_auth_fault()?;
        self.resets.lock().unwrap().push(vm.value.clone());
        Ok(self.finish_task(Ok(None)))
    }

    async fn shutdown_guest(&self, vm: &ManagedObjectRef) -> VimResult<()> {
        self.take_auth_fault()?;
        self.guest_shutdowns.lock().unwrap().push(vm.value.clone());
        Ok(())
    }
}
