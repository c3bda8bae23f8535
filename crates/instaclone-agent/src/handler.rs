//! Agent-side handler of the control channel: routes clone status callbacks
//! to the pending registry. Tolerant of anything malformed; terminal status
//! delivery is the control plane's obligation, not enforced here.

use std::sync::Arc;

use tracing::{debug, warn};

use instaclone_common::protocol::{ControlMessage, CLONE_STATUS_METHOD};

use crate::pending::PendingCloneRegistry;

pub struct StatusHandler {
    registry: Arc<PendingCloneRegistry>,
}

impl StatusHandler {
    pub fn new(registry: Arc<PendingCloneRegistry>) -> Self {
        Self { registry }
    }

    pub fn handle(&self, message: &ControlMessage) {
        if message.method != CLONE_STATUS_METHOD {
            debug!(method = %message.method, "ignoring unknown control method");
            return;
        }
        match message.parse_clone_status() {
            Ok(status) => {
                if !self.registry.resolve(&message.correlation_id, status) {
                    warn!(
                        correlation_id = %message.correlation_id,
                        "status callback without a pending build step"
                    );
                }
            }
            Err(cause) => {
                warn!(error = %cause, "unparseable clone status payload");
            }
        }
    }
}
