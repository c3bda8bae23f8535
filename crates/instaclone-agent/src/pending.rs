//! Pending-clone registry: one entry per in-flight build step, keyed by the
//! correlation id, resolved exactly once by the status callback. Entries are
//! removed on resolve, cancel and timeout so the map never grows across
//! build steps.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use instaclone_common::protocol::CloneStatus;

#[derive(Default)]
pub struct PendingCloneRegistry {
    pending: DashMap<Uuid, oneshot::Sender<CloneStatus>>,
}

impl PendingCloneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a build step and hands back the single-resolution future it
    /// blocks on.
    pub fn register(&self, correlation_id: Uuid) -> oneshot::Receiver<CloneStatus> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);
        rx
    }

    /// Resolves a pending entry with its terminal status. Returns `false`
    /// when no entry exists (already resolved, cancelled, or never ours).
    pub fn resolve(&self, correlation_id: &Uuid, status: CloneStatus) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, tx)) => tx.send(status).is_ok(),
            None => {
                debug!(%correlation_id, "no pending clone entry to resolve");
                false
            }
        }
    }

    /// Drops a pending entry without resolving it, e.g. on interrupt or
    /// timeout.
    pub fn cancel(&self, correlation_id: &Uuid) -> bool {
        self.pending.remove(correlation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
