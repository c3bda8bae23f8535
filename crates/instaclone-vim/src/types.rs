//! Narrow typed view of the vim25 object model: only the objects, specs and
//! property shapes the control plane actually touches.

use std::fmt;

/// Reference to a server-side managed object, a `(type, id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedObjectRef {
    pub kind: String,
    pub value: String,
}

impl ManagedObjectRef {
    pub const VIRTUAL_MACHINE: &'static str = "VirtualMachine";
    pub const FOLDER: &'static str = "Folder";
    pub const RESOURCE_POOL: &'static str = "ResourcePool";
    pub const DATASTORE: &'static str = "Datastore";
    pub const TASK: &'static str = "Task";
    pub const NETWORK: &'static str = "Network";
    pub const DISTRIBUTED_PORTGROUP: &'static str = "DistributedVirtualPortgroup";

    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn is_vm(&self) -> bool {
        self.kind == Self::VIRTUAL_MACHINE
    }

    pub fn is_folder(&self) -> bool {
        self.kind == Self::FOLDER
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// A key/value entry of a VM's extra configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionValue {
    pub key: String,
    pub value: String,
}

impl OptionValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "queued" => TaskState::Queued,
            "running" => TaskState::Running,
            "success" => TaskState::Success,
            _ => TaskState::Error,
        }
    }
}

/// Classified hypervisor fault. `kind` drives recovery decisions, `message`
/// is the server-reported text kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodFault {
    pub kind: FaultKind,
    pub message: String,
}

impl MethodFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Other(String::new()), message)
    }
}

impl fmt::Display for MethodFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FaultKind::Other(name) if !name.is_empty() => {
                write!(f, "{}: {}", name, self.message)
            }
            _ => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    NotAuthenticated,
    DuplicateName,
    InvalidProperty,
    ManagedObjectNotFound,
    /// Any other fault; carries the wire type name.
    Other(String),
}

impl FaultKind {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "NotAuthenticated" | "NotAuthenticatedFault" | "NoPermission" => {
                FaultKind::NotAuthenticated
            }
            "DuplicateName" => FaultKind::DuplicateName,
            "InvalidProperty" => FaultKind::InvalidProperty,
            "ManagedObjectNotFound" => FaultKind::ManagedObjectNotFound,
            other => FaultKind::Other(other.to_string()),
        }
    }
}

/// Snapshot of a task's `info` property.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub state: TaskState,
    pub error: Option<MethodFault>,
    pub result: Option<ManagedObjectRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl PowerState {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "poweredOn" => Some(PowerState::PoweredOn),
            "poweredOff" => Some(PowerState::PoweredOff),
            "suspended" => Some(PowerState::Suspended),
            _ => None,
        }
    }
}

/// An ethernet device of a VM, the one device class the relocate spec edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetCard {
    /// Device key within the VM's hardware list.
    pub key: i32,
    /// Concrete wire type, e.g. `VirtualVmxnet3`.
    pub kind: String,
}

/// New backing for an ethernet card, standard or distributed switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkBacking {
    Standard {
        network: ManagedObjectRef,
        device_name: String,
    },
    Distributed {
        portgroup_key: String,
        switch_uuid: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NicChange {
    pub device: EthernetCard,
    pub backing: NetworkBacking,
}

/// Placement of a clone: target folder, optional pool/datastore, and the
/// network rewiring applied to the clone's ethernet cards.
#[derive(Debug, Clone, PartialEq)]
pub struct RelocateSpec {
    pub folder: ManagedObjectRef,
    pub pool: Option<ManagedObjectRef>,
    pub datastore: Option<ManagedObjectRef>,
    pub nic_changes: Vec<NicChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstantCloneSpec {
    pub name: String,
    pub location: RelocateSpec,
    pub extra_config: Vec<OptionValue>,
}

/// Reconfiguration request: rename and/or extra-config updates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSpec {
    pub name: Option<String>,
    pub extra_config: Vec<OptionValue>,
}

impl ConfigSpec {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            extra_config: Vec::new(),
        }
    }

    pub fn set_extra_config(entries: Vec<OptionValue>) -> Self {
        Self {
            name: None,
            extra_config: entries,
        }
    }
}

/// Typed result of a single-property fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Bool(bool),
    Mor(ManagedObjectRef),
    MorList(Vec<ManagedObjectRef>),
    Options(Vec<OptionValue>),
    Ethernets(Vec<EthernetCard>),
    Task(TaskInfo),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn into_mor(self) -> Option<ManagedObjectRef> {
        match self {
            PropertyValue::Mor(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_mor_list(self) -> Option<Vec<ManagedObjectRef>> {
        match self {
            PropertyValue::MorList(l) => Some(l),
            _ => None,
        }
    }

    pub fn into_options(self) -> Option<Vec<OptionValue>> {
        match self {
            PropertyValue::Options(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_ethernets(self) -> Option<Vec<EthernetCard>> {
        match self {
            PropertyValue::Ethernets(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_task(self) -> Option<TaskInfo> {
        match self {
            PropertyValue::Task(t) => Some(t),
            _ => None,
        }
    }
}
