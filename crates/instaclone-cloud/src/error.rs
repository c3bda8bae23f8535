use thiserror::Error;

use instaclone_vim::VimError;

pub type CloudResult<T> = std::result::Result<T, CloudError>;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error(transparent)]
    Vim(#[from] VimError),

    /// Clone-from-self precondition failed; reported synchronously, no job
    /// is started.
    #[error("instance not eligible for cloning: {0}")]
    NotEligible(String),

    /// Structured admission denial; not a hypervisor failure.
    #[error("cannot start new instance: {0}")]
    CannotStart(String),

    /// The freshly cloned VM did not reach the frozen state inside the
    /// configured window. Fatal to the clone job.
    #[error("VM '{0}' did not freeze within the time limit")]
    FreezeTimeout(String),

    #[error("invalid cloud profile configuration: {0}")]
    InvalidConfig(String),

    /// Status callback could not be delivered to the agent process.
    #[error("callback delivery failed: {0}")]
    Callback(String),

    #[error("cloud client is disposed")]
    Disposed,

    /// The clone job's task panicked or was torn down with the runtime.
    #[error("clone job was aborted")]
    JobAborted,
}

impl CloudError {
    pub fn is_duplicate_name(&self) -> bool {
        matches!(self, CloudError::Vim(e) if e.is_duplicate_name())
    }
}
