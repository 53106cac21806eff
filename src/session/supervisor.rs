//! Connection supervision
//!
//! One supervisor task per tenant drives the session state machine:
//!
//! ```text
//! uninitialized -> pairing -> connected -> retrying -> { pairing | disconnected }
//! ```
//!
//! Transport events arrive on a per-tenant channel. Authorization-revoked
//! and forbidden disconnects are terminal (credentials wiped, timers
//! cancelled, no restart); every other cause schedules a restart after a
//! fixed backoff. Pairing-code issuance is capped so a session that never
//! pairs cannot refresh codes forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::db::{DbPool, TenantRepo};
use crate::events::{EventBus, EventKind};
use crate::pipeline::MessagePipeline;
use crate::protocol::{MessageKey, SessionEvent, Transport};
use crate::routing::DispatchDebouncer;
use crate::{Error, Result};

use super::{SessionCommand, SessionHandle, SessionState, SessionStore};

/// What the supervisor loop does after an event pass ends
enum Flow {
    /// Restart the connection after the backoff
    Reconnect,
    /// Tear the session down and wipe credentials
    Terminal,
    /// Stop without touching credentials (process shutdown)
    Stop,
}

/// Owns the session store and supervises one connection per tenant
pub struct SessionManager {
    db: DbPool,
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    debouncer: Arc<DispatchDebouncer>,
    pipeline: Arc<MessagePipeline>,
    config: SessionConfig,
}

impl SessionManager {
    /// Create a manager
    #[must_use]
    pub fn new(
        db: DbPool,
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        bus: EventBus,
        debouncer: Arc<DispatchDebouncer>,
        pipeline: Arc<MessagePipeline>,
        config: SessionConfig,
    ) -> Self {
        Self {
            db,
            store,
            transport,
            bus,
            debouncer,
            pipeline,
            config,
        }
    }

    /// The session store owned by this manager
    #[must_use]
    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.store)
    }

    /// Establish or resume a tenant's session
    ///
    /// Idempotent: a second call while a session is live returns the
    /// existing handle. Protocol failures during setup surface as a
    /// rejected start; they never crash the host.
    ///
    /// # Errors
    ///
    /// Returns error when the tenant is unknown or the initial connect
    /// fails
    pub async fn start_session(self: &Arc<Self>, tenant_id: i64) -> Result<Arc<SessionHandle>> {
        if let Some(existing) = self.store.get(tenant_id) {
            tracing::debug!(tenant_id, "session already running");
            return Ok(existing);
        }

        let tenants = TenantRepo::new(self.db.clone());
        let tenant = tenants
            .get(tenant_id)?
            .ok_or_else(|| Error::NotFound(format!("tenant {tenant_id}")))?;

        let (command_tx, command_rx) = mpsc::channel(8);
        let handle = Arc::new(SessionHandle::new(tenant_id, command_tx));
        if !self.store.insert_new(Arc::clone(&handle)) {
            // Raced another starter; theirs wins
            return self.store.require(tenant_id);
        }

        tracing::info!(tenant_id, name = %tenant.name, "starting session");

        match self
            .transport
            .connect(tenant_id, tenant.credentials.as_deref())
            .await
        {
            Ok(connection) => {
                handle.set_client(Arc::clone(&connection.client));
                let manager = Arc::clone(self);
                let task_handle = Arc::clone(&handle);
                tokio::spawn(async move {
                    manager
                        .run_session(tenant_id, task_handle, connection.events, command_rx)
                        .await;
                });
                Ok(handle)
            }
            Err(e) => {
                self.store.remove(tenant_id);
                tracing::error!(tenant_id, error = %e, "session start rejected");
                Err(e)
            }
        }
    }

    /// Deauthenticate a tenant's session
    ///
    /// # Errors
    ///
    /// Returns error when no session is running
    pub async fn logout(&self, tenant_id: i64) -> Result<()> {
        self.store
            .require(tenant_id)?
            .command(SessionCommand::Logout)
            .await
    }

    /// Stop all sessions without touching credentials
    pub async fn stop_all(&self) {
        let stops = self.store.tenant_ids().into_iter().filter_map(|tenant_id| {
            let handle = self.store.get(tenant_id)?;
            Some(async move {
                if handle.command(SessionCommand::Stop).await.is_err() {
                    self.store.remove(tenant_id);
                }
            })
        });
        futures::future::join_all(stops).await;
    }

    async fn run_session(
        self: Arc<Self>,
        tenant_id: i64,
        handle: Arc<SessionHandle>,
        mut events: mpsc::Receiver<SessionEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        let tenants = TenantRepo::new(self.db.clone());

        loop {
            match self.drive(tenant_id, &handle, &mut events, &mut commands).await {
                Flow::Reconnect => {
                    handle.clear_client();
                    self.set_state(tenant_id, SessionState::Retrying);
                    tokio::time::sleep(Duration::from_secs(self.config.reconnect_delay_secs)).await;

                    let credentials = tenants
                        .get(tenant_id)
                        .ok()
                        .flatten()
                        .and_then(|t| t.credentials);
                    match self
                        .transport
                        .connect(tenant_id, credentials.as_deref())
                        .await
                    {
                        Ok(connection) => {
                            handle.set_client(Arc::clone(&connection.client));
                            events = connection.events;
                            tracing::info!(tenant_id, "session reconnect dialed");
                        }
                        Err(e) => {
                            // Loop again: the dead receiver yields another
                            // Reconnect pass after the backoff
                            tracing::warn!(tenant_id, error = %e, "reconnect failed");
                        }
                    }
                }
                Flow::Terminal => {
                    self.teardown(tenant_id).await;
                    return;
                }
                Flow::Stop => {
                    self.store.remove(tenant_id);
                    tracing::info!(tenant_id, "session stopped");
                    return;
                }
            }
        }
    }

    /// Consume events until the connection ends or a command arrives
    async fn drive(
        &self,
        tenant_id: i64,
        handle: &Arc<SessionHandle>,
        events: &mut mpsc::Receiver<SessionEvent>,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) -> Flow {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Logout) => {
                        if let Ok(client) = handle.client() {
                            if let Err(e) = client.logout().await {
                                tracing::warn!(tenant_id, error = %e, "protocol logout failed");
                            }
                        }
                        tracing::info!(tenant_id, "logout requested");
                        return Flow::Terminal;
                    }
                    Some(SessionCommand::Stop) | None => return Flow::Stop,
                },
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!(tenant_id, "event stream ended");
                        return Flow::Reconnect;
                    };
                    if let Some(flow) = self.handle_event(tenant_id, handle, event).await {
                        return flow;
                    }
                }
            }
        }
    }

    /// Process one session event; `Some(flow)` ends the event pass
    async fn handle_event(
        &self,
        tenant_id: i64,
        handle: &Arc<SessionHandle>,
        event: SessionEvent,
    ) -> Option<Flow> {
        let tenants = TenantRepo::new(self.db.clone());

        match event {
            SessionEvent::PairingCode { code } => {
                let retries = tenants
                    .get(tenant_id)
                    .ok()
                    .flatten()
                    .map_or(0, |t| t.pairing_retries);
                if retries >= self.config.pairing_code_limit {
                    tracing::warn!(
                        tenant_id,
                        retries,
                        "pairing-code ceiling reached, tearing session down"
                    );
                    return Some(Flow::Terminal);
                }

                if let Err(e) = tenants.record_pairing_code(tenant_id, &code) {
                    tracing::error!(tenant_id, error = %e, "pairing code persist failed");
                }
                self.bus.emit(EventKind::SessionUpdated {
                    tenant_id,
                    status: SessionState::Pairing,
                    pairing_code: Some(code),
                });
                tracing::info!(tenant_id, attempt = retries + 1, "pairing code issued");
            }

            SessionEvent::Open => {
                if let Err(e) = tenants.mark_connected(tenant_id) {
                    tracing::error!(tenant_id, error = %e, "connected status persist failed");
                }
                self.bus.emit(EventKind::SessionUpdated {
                    tenant_id,
                    status: SessionState::Connected,
                    pairing_code: None,
                });
                tracing::info!(tenant_id, "session connected");
            }

            SessionEvent::Closed { cause } => {
                if cause.is_terminal() {
                    tracing::warn!(tenant_id, ?cause, "terminal disconnect");
                    return Some(Flow::Terminal);
                }
                tracing::warn!(tenant_id, ?cause, "disconnected, restart scheduled");
                return Some(Flow::Reconnect);
            }

            SessionEvent::CredentialsRotated { credentials } => {
                // The supervisor is the only writer of the credential blob
                if let Err(e) = tenants.set_credentials(tenant_id, &credentials) {
                    tracing::error!(tenant_id, error = %e, "credential persist failed");
                }
            }

            SessionEvent::Messages { messages } => {
                self.acknowledge_inbound(handle, &messages).await;

                for message in messages {
                    let pipeline = Arc::clone(&self.pipeline);
                    let message_id = message.key.id.clone();
                    tokio::spawn(async move {
                        // Handler failures stay isolated from batch siblings
                        if let Err(e) = pipeline.handle_message(tenant_id, message).await {
                            tracing::error!(tenant_id, message_id = %message_id, error = %e, "message handling failed");
                        }
                    });
                }
            }

            SessionEvent::Acks { updates } => {
                let pipeline = Arc::clone(&self.pipeline);
                tokio::spawn(async move {
                    if let Err(e) = pipeline.handle_acks(tenant_id, &updates) {
                        tracing::error!(tenant_id, error = %e, "ack handling failed");
                    }
                });
            }

            SessionEvent::Call { call } => {
                let pipeline = Arc::clone(&self.pipeline);
                tokio::spawn(async move {
                    if let Err(e) = pipeline.handle_call(tenant_id, call).await {
                        tracing::error!(tenant_id, error = %e, "call handling failed");
                    }
                });
            }
        }

        None
    }

    /// Mark inbound messages as read on the protocol side (best-effort)
    async fn acknowledge_inbound(
        &self,
        handle: &Arc<SessionHandle>,
        messages: &[crate::protocol::RawMessage],
    ) {
        let keys: Vec<MessageKey> = messages
            .iter()
            .filter(|m| !m.key.from_me && !m.key.chat.is_status_broadcast())
            .map(|m| m.key.clone())
            .collect();
        if keys.is_empty() {
            return;
        }

        if let Ok(client) = handle.client() {
            if let Err(e) = client.read_receipts(&keys).await {
                tracing::debug!(error = %e, "read receipts failed");
            }
        }
    }

    /// Terminal teardown: wipe credentials, cancel the tenant's debounce
    /// timers, drop the handle, notify observers
    async fn teardown(&self, tenant_id: i64) {
        let tenants = TenantRepo::new(self.db.clone());
        if let Err(e) = tenants.wipe_session(tenant_id) {
            tracing::error!(tenant_id, error = %e, "session wipe failed");
        }
        self.debouncer.cancel_tenant(tenant_id);
        self.store.remove(tenant_id);
        self.bus.emit(EventKind::SessionUpdated {
            tenant_id,
            status: SessionState::Disconnected,
            pairing_code: None,
        });
        tracing::info!(tenant_id, "session torn down");
    }

    fn set_state(&self, tenant_id: i64, state: SessionState) {
        if let Err(e) = TenantRepo::new(self.db.clone()).set_status(tenant_id, state) {
            tracing::error!(tenant_id, error = %e, "status persist failed");
        }
        self.bus.emit(EventKind::SessionUpdated {
            tenant_id,
            status: state,
            pairing_code: None,
        });
    }
}
