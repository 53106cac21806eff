//! Shared test utilities

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use triage_engine::config::{RoutingConfig, SessionConfig};
use triage_engine::db::{self, DbPool, QueueRepo, SettingsRepo, Tenant, TenantRepo};
use triage_engine::pipeline::MessagePipeline;
use triage_engine::protocol::{
    ChatAddress, Connection, GroupMetadata, MediaPayload, MediaRef, MenuEntry, MessageKey,
    OutboundMedia, ProtocolClient, RawContent, RawMessage, SessionEvent, Transport,
};
use triage_engine::routing::DispatchDebouncer;
use triage_engine::session::{SessionManager, SessionStore};
use triage_engine::{EventBus, Result};

/// What kind of send a [`RecordingClient`] captured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Text,
    Buttons,
    List,
    Media,
}

/// One captured outbound send
#[derive(Debug, Clone)]
pub struct Sent {
    pub kind: SentKind,
    pub to: String,
    pub body: String,
    pub entry_count: usize,
}

/// Protocol client that records every send and serves attachments
pub struct RecordingClient {
    sent: Mutex<Vec<Sent>>,
    rejected_calls: Mutex<Vec<String>>,
    echo_counter: AtomicU64,
    /// Remaining download attempts that should fail
    pub download_failures: AtomicU32,
}

impl Default for RecordingClient {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            rejected_calls: Mutex::new(Vec::new()),
            echo_counter: AtomicU64::new(0),
            download_failures: AtomicU32::new(0),
        }
    }
}

impl RecordingClient {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Captured bodies with the automated-send marker stripped
    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|s| s.body.trim_start_matches('\u{200e}').to_string())
            .collect()
    }

    pub fn rejected_calls(&self) -> Vec<String> {
        self.rejected_calls.lock().unwrap().clone()
    }

    fn echo(&self, to: &ChatAddress, body: &str) -> RawMessage {
        let id = format!("echo-{}", self.echo_counter.fetch_add(1, Ordering::SeqCst));
        RawMessage::text(&id, to.clone(), true, body)
    }

    fn record(&self, kind: SentKind, to: &ChatAddress, body: &str, entry_count: usize) {
        self.sent.lock().unwrap().push(Sent {
            kind,
            to: to.jid().to_string(),
            body: body.to_string(),
            entry_count,
        });
    }
}

#[async_trait]
impl ProtocolClient for RecordingClient {
    async fn send_text(&self, to: &ChatAddress, body: &str) -> Result<RawMessage> {
        self.record(SentKind::Text, to, body, 0);
        Ok(self.echo(to, body))
    }

    async fn send_buttons(
        &self,
        to: &ChatAddress,
        body: &str,
        buttons: &[MenuEntry],
    ) -> Result<RawMessage> {
        self.record(SentKind::Buttons, to, body, buttons.len());
        Ok(self.echo(to, body))
    }

    async fn send_list(
        &self,
        to: &ChatAddress,
        body: &str,
        _button: &str,
        entries: &[MenuEntry],
    ) -> Result<RawMessage> {
        self.record(SentKind::List, to, body, entries.len());
        Ok(self.echo(to, body))
    }

    async fn send_media(&self, to: &ChatAddress, media: &OutboundMedia) -> Result<RawMessage> {
        self.record(SentKind::Media, to, &media.filename, 0);
        Ok(self.echo(to, &media.filename))
    }

    async fn download_attachment(&self, media: &MediaRef) -> Result<MediaPayload> {
        let remaining = self.download_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.download_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(triage_engine::Error::Protocol("stream reset".to_string()));
        }
        Ok(MediaPayload {
            bytes: b"attachment-bytes".to_vec(),
            mime_type: media.mime_type.clone(),
            filename: None,
        })
    }

    async fn read_receipts(&self, _keys: &[MessageKey]) -> Result<()> {
        Ok(())
    }

    async fn group_metadata(&self, chat: &ChatAddress) -> Result<GroupMetadata> {
        Ok(GroupMetadata {
            jid: chat.jid().to_string(),
            subject: "Test Group".to_string(),
        })
    }

    async fn reject_call(&self, call_id: &str) -> Result<()> {
        self.rejected_calls.lock().unwrap().push(call_id.to_string());
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }
}

/// Transport that always hands out the shared [`RecordingClient`]
pub struct TestTransport {
    client: Arc<RecordingClient>,
    event_txs: Mutex<VecDeque<mpsc::Sender<SessionEvent>>>,
}

impl TestTransport {
    pub fn new(client: Arc<RecordingClient>) -> Self {
        Self {
            client,
            event_txs: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn connect(&self, _tenant_id: i64, _credentials: Option<&str>) -> Result<Connection> {
        let (tx, rx) = mpsc::channel(64);
        tx.try_send(SessionEvent::Open).ok();
        self.event_txs.lock().unwrap().push_back(tx);
        Ok(Connection {
            client: self.client.clone(),
            events: rx,
        })
    }
}

/// Everything a routing test needs, wired the way the daemon wires it
pub struct TestContext {
    pub db: DbPool,
    pub bus: EventBus,
    pub manager: Arc<SessionManager>,
    pub pipeline: Arc<MessagePipeline>,
    pub debouncer: Arc<DispatchDebouncer>,
    pub client: Arc<RecordingClient>,
    pub tenant: Tenant,
    pub media_dir: tempfile::TempDir,
}

impl TestContext {
    pub fn tenants(&self) -> TenantRepo {
        TenantRepo::new(self.db.clone())
    }

    pub fn queues(&self) -> QueueRepo {
        QueueRepo::new(self.db.clone())
    }

    pub fn settings(&self) -> SettingsRepo {
        SettingsRepo::new(self.db.clone())
    }

    pub fn tickets(&self) -> db::TicketRepo {
        db::TicketRepo::new(self.db.clone())
    }

    pub fn messages(&self) -> db::MessageRepo {
        db::MessageRepo::new(self.db.clone())
    }

    pub fn contacts(&self) -> db::ContactRepo {
        db::ContactRepo::new(self.db.clone())
    }

    pub fn users(&self) -> db::UserRepo {
        db::UserRepo::new(self.db.clone())
    }
}

/// Set up a live engine over an in-memory database, with one tenant whose
/// session is already connected
pub async fn setup() -> TestContext {
    let db = db::init_memory().expect("failed to init test db");
    let bus = EventBus::new();
    let store = Arc::new(SessionStore::new());
    let debouncer = Arc::new(DispatchDebouncer::new());
    let client = Arc::new(RecordingClient::default());
    let media_dir = tempfile::tempdir().expect("failed to create media dir");

    let pipeline = Arc::new(MessagePipeline::new(
        db.clone(),
        bus.clone(),
        Arc::clone(&store),
        Arc::clone(&debouncer),
        RoutingConfig::default(),
        media_dir.path().to_path_buf(),
    ));

    let manager = Arc::new(SessionManager::new(
        db.clone(),
        store,
        Arc::new(TestTransport::new(Arc::clone(&client))),
        bus.clone(),
        Arc::clone(&debouncer),
        Arc::clone(&pipeline),
        SessionConfig::default(),
    ));

    let tenant = TenantRepo::new(db.clone()).create("test line").expect("create tenant");
    manager.start_session(tenant.id).await.expect("start session");

    TestContext {
        db,
        bus,
        manager,
        pipeline,
        debouncer,
        client,
        tenant,
        media_dir,
    }
}

/// Build an inbound text message from the given contact jid
pub fn inbound_text(id: &str, jid: &str, body: &str) -> RawMessage {
    RawMessage::text(id, ChatAddress::from_jid(jid), false, body)
}

/// Build an inbound document message
pub fn inbound_document(id: &str, jid: &str, filename: &str, media_id: &str) -> RawMessage {
    let mut msg = inbound_text(id, jid, "");
    msg.content = RawContent::Document {
        filename: Some(filename.to_string()),
        media: MediaRef {
            media_id: media_id.to_string(),
            mime_type: "application/pdf".to_string(),
        },
    };
    msg
}

/// Default direct-chat jid used by most tests
pub const CONTACT_JID: &str = "5511999000111@s.whatsapp.net";
