//! Daemon - the engine service
//!
//! Wires the store, event bus, debouncer, pipeline, and session manager
//! together, resumes sessions for every already-authorized tenant, and runs
//! until interrupted.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::db::{self, DbPool, TenantRepo};
use crate::events::EventBus;
use crate::pipeline::MessagePipeline;
use crate::protocol::BridgeTransport;
use crate::routing::DispatchDebouncer;
use crate::session::{SessionManager, SessionStore};
use crate::{Config, Result};

/// The triage daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Create a daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be initialized
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.data_dir.join("triage.db");
        let db = db::init(&db_path)?;

        tracing::info!(path = %db_path.display(), "database initialized");
        Ok(Self { config, db })
    }

    /// The daemon's database pool
    #[must_use]
    pub fn db(&self) -> DbPool {
        self.db.clone()
    }

    /// Run until interrupted
    ///
    /// # Errors
    ///
    /// Returns error on fatal initialization failures; per-tenant session
    /// failures are logged and do not stop the daemon
    pub async fn run(self) -> Result<()> {
        let bus = EventBus::new();
        let store = Arc::new(SessionStore::new());
        let debouncer = Arc::new(DispatchDebouncer::new());
        let transport = Arc::new(BridgeTransport::new(
            self.config.bridge.base_url.clone(),
            self.config.bridge.api_token.clone(),
        ));

        let pipeline = Arc::new(MessagePipeline::new(
            self.db.clone(),
            bus.clone(),
            Arc::clone(&store),
            Arc::clone(&debouncer),
            self.config.routing.clone(),
            self.config.media_dir(),
        ));

        let manager = Arc::new(SessionManager::new(
            self.db.clone(),
            store,
            transport,
            bus,
            debouncer,
            pipeline,
            self.config.session,
        ));

        // Resume every tenant that already holds credentials; a rejected
        // start for one tenant never blocks the others
        let tenants = TenantRepo::new(self.db.clone());
        for tenant in tenants.list_authorized()? {
            if let Err(e) = manager.start_session(tenant.id).await {
                tracing::error!(tenant_id = tenant.id, error = %e, "session resume failed");
            }
        }
        tracing::info!(
            sessions = manager.store().len(),
            bridge = %self.config.bridge.base_url,
            "daemon running"
        );

        // Wait for ctrl-c
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });
        shutdown_rx.recv().await;

        tracing::info!("shutting down");
        manager.stop_all().await;
        tracing::info!("daemon stopped");
        Ok(())
    }
}
