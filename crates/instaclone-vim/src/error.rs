use thiserror::Error;

use crate::types::{FaultKind, MethodFault};

pub type VimResult<T> = std::result::Result<T, VimError>;

#[derive(Error, Debug)]
pub enum VimError {
    /// Session-expiry class fault. Recovered inside [`VimSession::execute`]
    /// by re-login and retry; callers outside the session never observe it
    /// unless the cached session turns out to still be valid.
    ///
    /// [`VimSession::execute`]: crate::session::VimSession::execute
    #[error("not authenticated: {0}")]
    Auth(String),

    /// A task reached the ERROR state; carries the hypervisor-reported fault.
    #[error("task failed: {0}")]
    Task(MethodFault),

    /// A method invocation faulted directly (not via a task).
    #[error("method fault: {0}")]
    Fault(MethodFault),

    #[error("property '{path}' fetch failed ({kind:?}): {message}")]
    Property {
        path: String,
        kind: PropertyErrorKind,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response the client could not make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyErrorKind {
    /// The property path itself is wrong: a programming or configuration
    /// error, fails loudly.
    InvalidPath,
    ObjectNotFound,
    Other,
}

impl VimError {
    pub fn is_auth(&self) -> bool {
        matches!(self, VimError::Auth(_))
    }

    pub fn is_duplicate_name(&self) -> bool {
        matches!(
            self,
            VimError::Task(MethodFault {
                kind: FaultKind::DuplicateName,
                ..
            }) | VimError::Fault(MethodFault {
                kind: FaultKind::DuplicateName,
                ..
            })
        )
    }

    pub(crate) fn property(
        path: impl Into<String>,
        kind: PropertyErrorKind,
        message: impl Into<String>,
    ) -> Self {
        VimError::Property {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}
