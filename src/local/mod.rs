//! Client-local durable storage.
//!
//! Each browser context gets its own scope of named slots, addressed by a
//! `ContextId`. Slots hold serialized text; `Slot<T>` layers typed JSON on
//! top. Backends: `MemoryStorage` here, and the libSQL backend in
//! `crate::store`.

pub mod context;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StorageError;

pub use context::{ClientContext, ClientContexts};

/// Longest context id accepted from a client.
const MAX_CONTEXT_ID_LEN: usize = 64;

/// Identifies one browser context (one client-local storage scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(String);

impl ContextId {
    /// Mint a fresh random context id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accept a client-supplied id if it is short and URL/cookie safe.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let ok = !raw.is_empty()
            && raw.len() <= MAX_CONTEXT_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        ok.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scoped key/value storage standing in for the browser's local storage.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    async fn get(&self, scope: &ContextId, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value`, replacing any previous value.
    async fn set(&self, scope: &ContextId, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a slot. Returns whether anything was removed.
    async fn remove(&self, scope: &ContextId, key: &str) -> Result<bool, StorageError>;
}

/// In-memory storage. Values live as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
    slots: RwLock<HashMap<(ContextId, String), String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn get(&self, scope: &ContextId, key: &str) -> Result<Option<String>, StorageError> {
        let slots = self.slots.read().await;
        Ok(slots.get(&(scope.clone(), key.to_string())).cloned())
    }

    async fn set(&self, scope: &ContextId, key: &str, value: &str) -> Result<(), StorageError> {
        let mut slots = self.slots.write().await;
        slots.insert((scope.clone(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove(&self, scope: &ContextId, key: &str) -> Result<bool, StorageError> {
        let mut slots = self.slots.write().await;
        Ok(slots.remove(&(scope.clone(), key.to_string())).is_some())
    }
}

/// A single named slot holding JSON-encoded `T`.
pub struct Slot<T> {
    storage: Arc<dyn LocalStorage>,
    scope: ContextId,
    key: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Slot<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(storage: Arc<dyn LocalStorage>, scope: ContextId, key: &'static str) -> Self {
        Self {
            storage,
            scope,
            key,
            _marker: PhantomData,
        }
    }

    /// Read the slot. A value that fails to decode is reported as `Corrupt`.
    pub async fn get(&self) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.storage.get(&self.scope, self.key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: self.key.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn set(&self, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|e| StorageError::Corrupt {
            key: self.key.to_string(),
            reason: e.to_string(),
        })?;
        self.storage.set(&self.scope, self.key, &raw).await
    }

    pub async fn remove(&self) -> Result<bool, StorageError> {
        self.storage.remove(&self.scope, self.key).await
    }
}
