//! The blocking clone build step: emits the request marker into the build
//! log and waits for the control plane's status callback, bounded by a
//! per-step timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use instaclone_common::buildlog::BuildLogSink;
use instaclone_common::protocol::{CloneRequest, CloneStatus};

use crate::pending::PendingCloneRegistry;

/// Floor default when the runner parameter is missing or invalid.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Runner parameter carrying the clone name suffix.
pub const NAME_SUFFIX_PARAMETER: &str = "cloneNameSuffix";
/// Runner parameter carrying the wait timeout in seconds.
pub const TIMEOUT_PARAMETER: &str = "cloneTimeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failed,
    Interrupted,
}

pub struct CloneBuildStep {
    registry: Arc<PendingCloneRegistry>,
    name_suffix: String,
    timeout: Duration,
}

impl CloneBuildStep {
    pub fn new(registry: Arc<PendingCloneRegistry>, name_suffix: impl Into<String>) -> Self {
        Self {
            registry,
            name_suffix: name_suffix.into(),
            timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parses the runner-supplied timeout; non-positive or unparseable
    /// values fall back to the default.
    pub fn timeout_from_param(raw: Option<&str>) -> Duration {
        raw.and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STEP_TIMEOUT)
    }

    /// Runs the step: registers a pending entry, emits the marker and blocks
    /// until the callback lands, the timeout elapses or the step is
    /// cancelled. The pending entry is removed on every exit path.
    pub async fn run(&self, log: &dyn BuildLogSink, cancel: &CancellationToken) -> StepOutcome {
        let request = CloneRequest::new(self.name_suffix.clone());
        let correlation_id = request.correlation_id;
        let marker = match request.to_marker() {
            Ok(marker) => marker,
            Err(cause) => {
                error!(error = %cause, "invalid clone request");
                log.error_line(&format!("Invalid clone request: {cause}"));
                return StepOutcome::Failed;
            }
        };

        let receiver = self.registry.register(correlation_id);
        info!(%correlation_id, suffix = %self.name_suffix, "requesting on-demand clone");
        log.info(&format!(
            "Requesting a new instant clone (correlation id {correlation_id})"
        ));
        log.info(&marker);
        log.info("Waiting for the clone to finish on the server side");

        tokio::select! {
            _ = cancel.cancelled() => {
                // Does not retract the remote job; it completes on its own.
                info!(%correlation_id, "build step interrupted");
                self.registry.cancel(&correlation_id);
                StepOutcome::Interrupted
            }
            result = tokio::time::timeout(self.timeout, receiver) => match result {
                Ok(Ok(CloneStatus::Ok)) => {
                    log.info("Clone finished successfully");
                    StepOutcome::Success
                }
                Ok(Ok(CloneStatus::Fail)) => {
                    log.error_line("Clone failed on the server side");
                    StepOutcome::Failed
                }
                Ok(Err(_)) => {
                    warn!(%correlation_id, "status channel closed without a callback");
                    log.error_line("Clone status channel closed unexpectedly");
                    self.registry.cancel(&correlation_id);
                    StepOutcome::Failed
                }
                Err(_) => {
                    warn!(%correlation_id, timeout = ?self.timeout, "timed out waiting for clone status");
                    log.error_line(&format!(
                        "Timed out after {} seconds waiting for the clone to finish",
                        self.timeout.as_secs()
                    ));
                    self.registry.cancel(&correlation_id);
                    StepOutcome::Failed
                }
            }
        }
    }
}
