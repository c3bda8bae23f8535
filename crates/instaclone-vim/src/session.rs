use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{VimError, VimResult};
use crate::port::VimPort;
use crate::types::{ManagedObjectRef, PropertyValue};

/// Authenticated request executor. Wraps every hypervisor call so that
/// session expiry is invisible to callers: an auth fault triggers a re-login
/// and one retry of the operation, repeatedly if the session keeps expiring.
/// Login is lazy; constructing a session performs no network call.
pub struct VimSession {
    port: Arc<dyn VimPort>,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

impl VimSession {
    pub fn new(port: Arc<dyn VimPort>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            port,
            username: username.into(),
            password: password.into(),
            token: Mutex::new(None),
        }
    }

    pub fn port(&self) -> Arc<dyn VimPort> {
        Arc::clone(&self.port)
    }

    /// Runs `op` against the port. Each auth fault re-validates the cached
    /// session first (a still-active session means the fault was spurious and
    /// propagates), then logs in and retries the operation. Any other error
    /// propagates immediately, never retried.
    pub async fn execute<T, F, Fut>(&self, op: F) -> VimResult<T>
    where
        F: Fn(Arc<dyn VimPort>) -> Fut,
        Fut: Future<Output = VimResult<T>>,
    {
        loop {
            match op(Arc::clone(&self.port)).await {
                Err(VimError::Auth(message)) => {
                    debug!("auth fault, attempting re-login");
                    self.relogin(&message).await?;
                }
                other => return other,
            }
        }
    }

    /// Single-property read with the `PropertyError` taxonomy; auth faults
    /// reported through the missing-property set are recovered here too.
    pub async fn get_property(
        &self,
        obj: &ManagedObjectRef,
        path: &str,
    ) -> VimResult<PropertyValue> {
        self.execute(|port| {
            let obj = obj.clone();
            let path = path.to_string();
            async move { port.retrieve_property(&obj, &path).await }
        })
        .await
    }

    /// Login/logout round-trip used by profile validation.
    pub async fn connection_login_test(&self) -> VimResult<()> {
        self.port.login(&self.username, &self.password).await?;
        if let Err(error) = self.port.logout().await {
            warn!(%error, "logout after connection test failed");
        }
        Ok(())
    }

    async fn relogin(&self, fault_message: &str) -> VimResult<()> {
        let mut token = self.token.lock().await;

        if let Some(key) = token.as_deref() {
            let active = self
                .port
                .session_is_active(key, &self.username)
                .await
                .unwrap_or(false);
            if active {
                // The session is fine; whatever faulted was not expiry.
                return Err(VimError::Auth(fault_message.to_string()));
            }
        }

        let key = self.port.login(&self.username, &self.password).await?;
        info!("hypervisor session established");
        *token = Some(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPort;
    use crate::types::{FaultKind, MethodFault};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn auth_fault_triggers_login_and_retry() {
        let port = Arc::new(MockPort::new());
        port.inject_auth_faults(1);
        port.set_inventory("/dc/vm/template", ManagedObjectRef::new("VirtualMachine", "vm-1"));

        let session = VimSession::new(port.clone(), "ci", "secret");
        let found = session
            .execute(|p| async move { p.find_by_inventory_path("/dc/vm/template").await })
            .await
            .unwrap();

        assert_eq!(found.unwrap().value, "vm-1");
        assert_eq!(port.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn every_auth_fault_is_recovered() {
        let port = Arc::new(MockPort::new());
        port.inject_auth_faults(3);
        port.set_inventory("/dc/vm/template", ManagedObjectRef::new("VirtualMachine", "vm-1"));

        let session = VimSession::new(port.clone(), "ci", "secret");
        let found = session
            .execute(|p| async move { p.find_by_inventory_path("/dc/vm/template").await })
            .await
            .unwrap();

        assert!(found.is_some());
        assert_eq!(port.login_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_auth_fault_propagates_without_retry() {
        let port = Arc::new(MockPort::new());
        let session = VimSession::new(port.clone(), "ci", "secret");

        let err = session
            .execute(|p| async move {
                let _ = p;
                Err::<(), _>(VimError::Fault(MethodFault::new(
                    FaultKind::Other("InvalidArgument".into()),
                    "bad spec",
                )))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, VimError::Fault(_)));
        assert_eq!(port.login_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn spurious_auth_fault_with_live_session_propagates() {
        let port = Arc::new(MockPort::new());
        port.set_inventory("/dc/vm/template", ManagedObjectRef::new("VirtualMachine", "vm-1"));

        let session = VimSession::new(port.clone(), "ci", "secret");

        // Establish a session first.
        port.inject_auth_faults(1);
        session
            .execute(|p| async move { p.find_by_inventory_path("/dc/vm/template").await })
            .await
            .unwrap();
        assert_eq!(port.login_calls.load(Ordering::SeqCst), 1);

        // Now the session is active server-side; another auth fault must not
        // trigger a redundant login.
        port.set_session_active(true);
        port.inject_auth_faults(1);
        let err = session
            .execute(|p| async move { p.find_by_inventory_path("/dc/vm/template").await })
            .await
            .unwrap_err();

        assert!(err.is_auth());
        assert_eq!(port.login_calls.load(Ordering::SeqCst), 1);
    }
}
