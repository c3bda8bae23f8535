use std::time::Duration;

use tracing::debug;

use crate::error::{VimError, VimResult};
use crate::session::VimSession;
use crate::types::{ManagedObjectRef, MethodFault, TaskState};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls a hypervisor task handle until it reaches a terminal state. Pure
/// state polling, cooperative waiting, no internal deadline; callers bound
/// the wait when they need to.
pub struct TaskWaiter<'a> {
    session: &'a VimSession,
    poll_interval: Duration,
}

impl<'a> TaskWaiter<'a> {
    pub fn new(session: &'a VimSession) -> Self {
        Self {
            session,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(session: &'a VimSession, poll_interval: Duration) -> Self {
        Self {
            session,
            poll_interval,
        }
    }

    /// Waits for the task to finish. Returns the task's result payload on
    /// success (for clone tasks, the new VM); fails with [`VimError::Task`]
    /// carrying the hypervisor-reported fault on error.
    pub async fn wait(&self, task: &ManagedObjectRef) -> VimResult<Option<ManagedObjectRef>> {
        loop {
            let info = self
                .session
                .get_property(task, "info")
                .await?
                .into_task()
                .ok_or_else(|| {
                    VimError::Protocol("task info property had an unexpected shape".into())
                })?;

            match info.state {
                TaskState::Success => return Ok(info.result),
                TaskState::Error => {
                    return Err(VimError::Task(info.error.unwrap_or_else(|| {
                        MethodFault::generic("task failed without fault detail")
                    })))
                }
                state => {
                    debug!(task = %task, ?state, "task still in flight");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
