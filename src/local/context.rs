//! Per-browser-context handle over local storage.
//!
//! A `ClientContext` is the explicit replacement for ambient key/value
//! storage: every flow that touches the pending registration, the staged
//! profile-setup data or the persisted auth session goes through one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use super::{ContextId, LocalStorage, Slot};
use crate::identity::StoredSession;
use crate::registration::model::ProfileSetupStage;
use crate::registration::pending::PendingRegistrationStore;

/// Slot names used within a context scope.
pub mod slot_keys {
    /// Auth session persisted after sign-in or token exchange.
    pub const AUTH_SESSION: &str = "auth_session";
    /// The single pending registration envelope.
    pub const PENDING_REGISTRATION: &str = "pending_registration";
    /// Monotonic generation counter for pending registration writes.
    pub const PENDING_GENERATION: &str = "pending_registration.generation";
    /// Data staged for the profile-setup step.
    pub const PROFILE_SETUP: &str = "profile_setup";
}

/// Opens `ClientContext`s that share one storage backend.
///
/// Contexts opened for the same id share an async lock, so read-modify-write
/// sequences on that id's slots do not interleave within this process.
pub struct ClientContexts {
    storage: Arc<dyn LocalStorage>,
    locks: Mutex<HashMap<ContextId, Arc<AsyncMutex<()>>>>,
}

impl ClientContexts {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open the context for `id`.
    pub fn open(&self, id: ContextId) -> ClientContext {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            // Drop locks nobody holds a context for any more.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        ClientContext {
            id,
            storage: Arc::clone(&self.storage),
            lock,
        }
    }

    /// Open a context under a freshly minted id.
    pub fn open_new(&self) -> ClientContext {
        self.open(ContextId::generate())
    }
}

/// One browser context's slots.
#[derive(Clone)]
pub struct ClientContext {
    id: ContextId,
    storage: Arc<dyn LocalStorage>,
    lock: Arc<AsyncMutex<()>>,
}

impl ClientContext {
    pub fn id(&self) -> &ContextId {
        &self.id
    }

    /// Typed access to an arbitrary slot in this context.
    pub fn slot<T>(&self, key: &'static str) -> Slot<T>
    where
        T: Serialize + DeserializeOwned,
    {
        Slot::new(Arc::clone(&self.storage), self.id.clone(), key)
    }

    pub fn pending_registrations(&self) -> PendingRegistrationStore {
        PendingRegistrationStore::new(self.clone())
    }

    pub fn setup_stage(&self) -> Slot<ProfileSetupStage> {
        self.slot(slot_keys::PROFILE_SETUP)
    }

    pub fn auth_session(&self) -> Slot<StoredSession> {
        self.slot(slot_keys::AUTH_SESSION)
    }

    /// Serialize a read-modify-write sequence on this context's slots.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryStorage;

    #[tokio::test]
    async fn contexts_with_same_id_share_slots() {
        let contexts = ClientContexts::new(Arc::new(MemoryStorage::new()));
        let first = contexts.open_new();
        let second = contexts.open(first.id().clone());

        first
            .slot::<String>("greeting")
            .set(&"hello".to_string())
            .await
            .unwrap();
        assert_eq!(
            second.slot::<String>("greeting").get().await.unwrap(),
            Some("hello".to_string())
        );
        assert!(Arc::ptr_eq(&first.lock, &second.lock));
    }

    #[tokio::test]
    async fn distinct_contexts_do_not_share_slots() {
        let contexts = ClientContexts::new(Arc::new(MemoryStorage::new()));
        let a = contexts.open_new();
        let b = contexts.open_new();

        a.slot::<u32>("n").set(&7).await.unwrap();
        assert_eq!(b.slot::<u32>("n").get().await.unwrap(), None);
    }

    #[test]
    fn unused_locks_are_pruned() {
        let contexts = ClientContexts::new(Arc::new(MemoryStorage::new()));
        let ctx = contexts.open_new();
        drop(ctx);
        let _other = contexts.open_new();
        let locks = contexts.locks.lock().unwrap();
        assert_eq!(locks.len(), 1);
    }
}
