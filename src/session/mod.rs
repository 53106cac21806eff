//! Tenant session registry
//!
//! The [`SessionStore`] is the process-local map from tenant id to live
//! session handle. It is owned by the [`supervisor::SessionManager`] and
//! injected into components that need client lookup — never a package-level
//! singleton, and never durable state.

pub mod supervisor;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::protocol::ProtocolClient;
use crate::{Error, Result};

pub use supervisor::SessionManager;

/// Connection status of one tenant session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected
    Uninitialized,
    /// Waiting for the tenant operator to enter a pairing code
    Pairing,
    /// Live
    Connected,
    /// Disconnected, a restart is scheduled
    Retrying,
    /// Terminal: needs a fresh pairing
    Disconnected,
}

impl SessionState {
    /// Store encoding
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Retrying => "retrying",
            Self::Disconnected => "disconnected",
        }
    }

    /// Decode the store encoding
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "uninitialized" => Some(Self::Uninitialized),
            "pairing" => Some(Self::Pairing),
            "connected" => Some(Self::Connected),
            "retrying" => Some(Self::Retrying),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Commands accepted by a running session supervisor task
#[derive(Debug, Clone, Copy)]
pub enum SessionCommand {
    /// Deauthenticate: protocol logout, credential wipe, terminal teardown
    Logout,
    /// Stop the supervisor without touching credentials (process shutdown)
    Stop,
}

/// Live handle of one tenant session
pub struct SessionHandle {
    tenant_id: i64,
    client: RwLock<Option<Arc<dyn ProtocolClient>>>,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(tenant_id: i64, commands: mpsc::Sender<SessionCommand>) -> Self {
        Self {
            tenant_id,
            client: RwLock::new(None),
            commands,
        }
    }

    /// Tenant this handle belongs to
    #[must_use]
    pub const fn tenant_id(&self) -> i64 {
        self.tenant_id
    }

    /// The current protocol client, if a connection is established
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotInitialized`] when no connection is live
    pub fn client(&self) -> Result<Arc<dyn ProtocolClient>> {
        self.client
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(Error::SessionNotInitialized(self.tenant_id))
    }

    pub(crate) fn set_client(&self, client: Arc<dyn ProtocolClient>) {
        *self
            .client
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(client);
    }

    pub(crate) fn clear_client(&self) {
        *self
            .client
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Send a command to the supervisor task
    ///
    /// # Errors
    ///
    /// Returns error when the supervisor has already stopped
    pub async fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Session(format!("session {} already stopped", self.tenant_id)))
    }
}

/// Concurrent registry of live tenant sessions
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<HashMap<i64, Arc<SessionHandle>>>,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle, replacing any previous one for the tenant
    pub fn insert(&self, handle: Arc<SessionHandle>) {
        self.write().insert(handle.tenant_id(), handle);
    }

    /// Register a handle only when the tenant has none; returns whether the
    /// handle was inserted
    pub fn insert_new(&self, handle: Arc<SessionHandle>) -> bool {
        let mut map = self.write();
        if map.contains_key(&handle.tenant_id()) {
            return false;
        }
        map.insert(handle.tenant_id(), handle);
        true
    }

    /// Look up a tenant's handle
    #[must_use]
    pub fn get(&self, tenant_id: i64) -> Option<Arc<SessionHandle>> {
        self.read().get(&tenant_id).cloned()
    }

    /// Look up a tenant's handle, failing when none is registered
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotInitialized`] when the tenant has no live
    /// session
    pub fn require(&self, tenant_id: i64) -> Result<Arc<SessionHandle>> {
        self.get(tenant_id)
            .ok_or(Error::SessionNotInitialized(tenant_id))
    }

    /// Remove a tenant's handle
    pub fn remove(&self, tenant_id: i64) -> Option<Arc<SessionHandle>> {
        self.write().remove(&tenant_id)
    }

    /// Ids of all registered tenants
    #[must_use]
    pub fn tenant_ids(&self) -> Vec<i64> {
        self.read().keys().copied().collect()
    }

    /// Number of registered sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<i64, Arc<SessionHandle>>> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, Arc<SessionHandle>>> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
