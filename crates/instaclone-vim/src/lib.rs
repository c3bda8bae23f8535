//! vSphere client for the instaclone control plane: a narrow raw-port trait
//! over the Web Services API, a session wrapper that makes authentication
//! expiry invisible to callers, and a task poller for long-running
//! hypervisor operations.

pub mod error;
pub mod port;
pub mod session;
pub mod soap;
pub mod task;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use error::{PropertyErrorKind, VimError, VimResult};
pub use port::VimPort;
pub use session::VimSession;
pub use soap::SoapPort;
pub use task::TaskWaiter;
pub use types::{
    ConfigSpec, EthernetCard, FaultKind, InstantCloneSpec, ManagedObjectRef, MethodFault,
    NetworkBacking, NicChange, OptionValue, PowerState, PropertyValue, RelocateSpec, TaskInfo,
    TaskState,
};
