//! Build-agent side of the instant-clone cloud: the blocking clone build
//! step and its pending-future registry, the control-channel status handler,
//! and the guest bootstrap that configures a freshly cloned agent from VM
//! metadata.

pub mod bootstrap;
pub mod build_step;
pub mod error;
pub mod handler;
pub mod pending;

pub use bootstrap::{AgentConfigStore, GuestBootstrap, RpcTool};
pub use build_step::{CloneBuildStep, StepOutcome, DEFAULT_STEP_TIMEOUT};
pub use error::{AgentError, AgentResult};
pub use handler::StatusHandler;
pub use pending::PendingCloneRegistry;
