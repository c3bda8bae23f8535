use async_trait::async_trait;

use crate::error::VimResult;
use crate::types::{ConfigSpec, InstantCloneSpec, ManagedObjectRef, PropertyValue};

/// The raw, stateless hypervisor operations the control plane needs. One
/// implementation speaks SOAP to a live vCenter ([`SoapPort`]); tests script
/// the trait directly.
///
/// Authentication failures surface as [`VimError::Auth`] from any call;
/// session recovery is layered on top by [`VimSession`], never here.
///
/// [`SoapPort`]: crate::soap::SoapPort
/// [`VimError::Auth`]: crate::error::VimError::Auth
/// [`VimSession`]: crate::session::VimSession
#[async_trait]
pub trait VimPort: Send + Sync {
    /// Authenticates and returns the new session key.
    async fn login(&self, username: &str, password: &str) -> VimResult<String>;

    async fn session_is_active(&self, key: &str, username: &str) -> VimResult<bool>;

    async fn logout(&self) -> VimResult<()>;

    /// Inventory-path lookup; `None` when nothing lives at the path.
    async fn find_by_inventory_path(&self, path: &str) -> VimResult<Option<ManagedObjectRef>>;

    /// Single-property read with the fault taxonomy of
    /// [`VimError::Property`](crate::error::VimError::Property).
    async fn retrieve_property(
        &self,
        obj: &ManagedObjectRef,
        path: &str,
    ) -> VimResult<PropertyValue>;

    /// Starts an instant clone of a running source VM; returns the task.
    async fn instant_clone_task(
        &self,
        source: &ManagedObjectRef,
        spec: &InstantCloneSpec,
    ) -> VimResult<ManagedObjectRef>;

    async fn power_off_task(&self, vm: &ManagedObjectRef) -> VimResult<ManagedObjectRef>;

    async fn destroy_task(&self, vm: &ManagedObjectRef) -> VimResult<ManagedObjectRef>;

    async fn reconfig_task(
        &self,
        vm: &ManagedObjectRef,
        spec: &ConfigSpec,
    ) -> VimResult<ManagedObjectRef>;

    async fn reset_task(&self, vm: &ManagedObjectRef) -> VimResult<ManagedObjectRef>;

    /// Asks the guest OS to shut down. Fire and forget, no task.
    async fn shutdown_guest(&self, vm: &ManagedObjectRef) -> VimResult<()>;
}
