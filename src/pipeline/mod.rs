//! Inbound message pipeline
//!
//! One [`MessagePipeline::handle_message`] call per raw message: noise
//! filtering, dedup, contact resolution, ticket resolution, persistence,
//! then routing (rating replies, out-of-hours notices, chatbot menus).
//! Failures in one message never abort its batch siblings — the session
//! supervisor dispatches each message in its own task.

pub mod media;
pub mod normalizer;
pub mod outbound;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::RoutingConfig;
use crate::db::{
    Contact, ContactRepo, DbPool, MessageRepo, QueueRepo, ScheduleType, Settings, SettingsRepo,
    Tenant, TenantRepo, Ticket, TicketRepo,
};
use crate::events::{EventBus, EventKind};
use crate::protocol::{AckUpdate, GroupMetadata, IncomingCall, RawMessage};
use crate::routing::{ChatbotRouter, DispatchDebouncer, TicketResolver, TicketTransitions};
use crate::session::SessionStore;
use crate::{Error, Result, routing};

pub use media::{MediaFetcher, StoredMedia};
pub use normalizer::{AUTO_MARK, Normalizer};
pub use outbound::OutboundDispatcher;

/// Notice sent back when an inbound call is rejected
const CALL_REJECT_NOTICE: &str =
    "We do not take voice or video calls on this number. Please send a text message.";

/// Channel recorded on tickets created by this pipeline
const CHANNEL: &str = "whatsapp";

/// Seam for the external generative-text collaborator, consumed behind the
/// `EnableGPT` flag; no implementation ships in this crate
#[async_trait]
pub trait AutoResponder: Send + Sync {
    /// Produce a reply for a forwarded prompt, or `None` to stay silent
    async fn reply(&self, prompt: &str) -> Result<Option<String>>;
}

/// The inbound message pipeline
pub struct MessagePipeline {
    db: DbPool,
    bus: EventBus,
    store: Arc<SessionStore>,
    debouncer: Arc<DispatchDebouncer>,
    config: RoutingConfig,
    media: MediaFetcher,
    normalizer: Normalizer,
    outbound: OutboundDispatcher,
    resolver: TicketResolver,
    transitions: Arc<TicketTransitions>,
    chatbot: ChatbotRouter,
    responder: Option<Arc<dyn AutoResponder>>,
}

impl MessagePipeline {
    /// Wire up the pipeline and its routing components
    #[must_use]
    pub fn new(
        db: DbPool,
        bus: EventBus,
        store: Arc<SessionStore>,
        debouncer: Arc<DispatchDebouncer>,
        config: RoutingConfig,
        media_dir: std::path::PathBuf,
    ) -> Self {
        let outbound = OutboundDispatcher::new(db.clone(), bus.clone(), Arc::clone(&store));
        let transitions = Arc::new(TicketTransitions::new(
            db.clone(),
            bus.clone(),
            outbound.clone(),
        ));
        let chatbot = ChatbotRouter::new(
            db.clone(),
            outbound.clone(),
            Arc::clone(&debouncer),
            Arc::clone(&transitions),
            config.clone(),
        );

        Self {
            normalizer: Normalizer::new(db.clone(), bus.clone()),
            resolver: TicketResolver::new(db.clone()),
            media: MediaFetcher::new(media_dir),
            db,
            bus,
            store,
            debouncer,
            config,
            outbound,
            transitions,
            chatbot,
            responder: None,
        }
    }

    /// Attach an auto-responder implementation
    #[must_use]
    pub fn with_responder(mut self, responder: Arc<dyn AutoResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// The ticket state machine, shared with callers outside the pipeline
    /// (agent-facing layers drive transitions through this)
    #[must_use]
    pub fn transitions(&self) -> Arc<TicketTransitions> {
        Arc::clone(&self.transitions)
    }

    /// Handle one raw message end to end
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails; protocol-level send failures
    /// inside routing are logged, not propagated
    #[allow(clippy::too_many_lines)]
    pub async fn handle_message(&self, tenant_id: i64, msg: RawMessage) -> Result<()> {
        if normalizer::is_noise(&msg) {
            tracing::trace!(tenant_id, message_id = %msg.key.id, "noise event filtered");
            return Ok(());
        }

        let body = normalizer::body_of(&msg);
        let from_me = msg.key.from_me;

        // Echo of one of our own automated sends
        if from_me && normalizer::is_automated(&body) {
            return Ok(());
        }

        // Idempotence boundary: a redelivered id causes no side effect
        if MessageRepo::new(self.db.clone()).exists(tenant_id, &msg.key.id)? {
            tracing::debug!(tenant_id, message_id = %msg.key.id, "duplicate delivery dropped");
            return Ok(());
        }

        let settings = SettingsRepo::new(self.db.clone()).load(tenant_id)?;
        let is_group = msg.key.chat.is_group();
        if settings.ignore_groups && is_group {
            return Ok(());
        }

        let tenant = TenantRepo::new(self.db.clone())
            .get(tenant_id)?
            .ok_or_else(|| Error::NotFound(format!("tenant {tenant_id}")))?;

        let contact = self.resolve_contact(tenant_id, &msg, is_group).await?;
        let unread = u32::from(!from_me);
        let ticket = self
            .resolver
            .resolve(tenant_id, &contact, unread, CHANNEL, from_me)
            .await?;

        let inserted = self.persist(&ticket, &contact, &msg).await?;
        if !inserted {
            return Ok(());
        }

        if from_me {
            return Ok(());
        }

        // A conversation awaiting its rating consumes the reply here
        let tickets = TicketRepo::new(self.db.clone());
        let tracking = tickets.current_tracking(ticket.id, tenant_id)?;
        if tracking.rating_at.is_some() && !tracking.rated {
            self.transitions.handle_rating(&ticket, &body).await?;
            return Ok(());
        }

        if !is_group && self.out_of_hours(&tenant, &settings, &ticket)? {
            self.send_out_of_hours_notice(&tenant, &ticket, &contact)?;
            return Ok(());
        }

        if !is_group {
            // Refresh: resolution may have bumped counters
            let ticket = tickets.get(ticket.id)?.unwrap_or(ticket.clone());
            if ticket.user_id.is_none() {
                if ticket.queue_id.is_none() {
                    self.chatbot
                        .route(&tenant, &settings, &ticket, &contact, &msg)
                        .await?;
                } else {
                    self.chatbot
                        .route_options(&tenant, &settings, &ticket, &contact, &msg)
                        .await?;
                }
            }
        }

        if settings.enable_gpt {
            self.forward_to_responder(&ticket, &contact, &body).await;
        }

        Ok(())
    }

    /// Apply delivery-confirmation updates
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails
    pub fn handle_acks(&self, tenant_id: i64, updates: &[AckUpdate]) -> Result<()> {
        let messages = MessageRepo::new(self.db.clone());
        for update in updates {
            match messages.set_ack(tenant_id, &update.message_id, update.ack)? {
                Some(ticket_id) => self.bus.emit(EventKind::MessageUpdated {
                    tenant_id,
                    ticket_id,
                    message_id: update.message_id.clone(),
                }),
                None => {
                    tracing::trace!(tenant_id, message_id = %update.message_id, "ack for unknown message");
                }
            }
        }
        Ok(())
    }

    /// Handle an inbound call: reject and notify unless calls are enabled
    ///
    /// # Errors
    ///
    /// Returns error if settings cannot be read
    pub async fn handle_call(&self, tenant_id: i64, call: IncomingCall) -> Result<()> {
        let settings = SettingsRepo::new(self.db.clone()).load(tenant_id)?;
        if settings.calls {
            return Ok(());
        }

        let client = self.store.require(tenant_id)?.client()?;
        if let Err(e) = client.reject_call(&call.call_id).await {
            tracing::warn!(tenant_id, call_id = %call.call_id, error = %e, "call reject failed");
        }
        let notice = format!("{AUTO_MARK}{CALL_REJECT_NOTICE}");
        if let Err(e) = client.send_text(&call.from, &notice).await {
            tracing::warn!(tenant_id, error = %e, "call reject notice send failed");
        }
        tracing::info!(tenant_id, call_id = %call.call_id, "inbound call rejected");
        Ok(())
    }

    /// Upsert the conversation's contact (group subject for groups, push
    /// name or number for direct chats)
    async fn resolve_contact(
        &self,
        tenant_id: i64,
        msg: &RawMessage,
        is_group: bool,
    ) -> Result<Contact> {
        let contacts = ContactRepo::new(self.db.clone());
        let jid = msg.key.chat.jid();

        if is_group {
            let meta = match self.store.require(tenant_id)?.client()?.group_metadata(&msg.key.chat).await
            {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(tenant_id, error = %e, "group metadata fetch failed");
                    GroupMetadata {
                        jid: jid.to_string(),
                        subject: digits_of(jid),
                    }
                }
            };
            return contacts.upsert(tenant_id, &meta.jid, &meta.subject, None, true);
        }

        let name = msg
            .push_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| digits_of(jid));
        contacts.upsert(tenant_id, jid, &name, None, false)
    }

    /// Persist the message, downloading any attachment first; a failed
    /// download degrades to a body-only record
    async fn persist(&self, ticket: &Ticket, contact: &Contact, msg: &RawMessage) -> Result<bool> {
        let Some((media_ref, filename_hint)) = normalizer::media_of(&msg.content) else {
            return self.normalizer.record(ticket, Some(contact), msg, None);
        };

        let client = self.store.require(ticket.tenant_id)?.client()?;
        match self.media.fetch(&client, media_ref, filename_hint).await {
            Ok(stored) => self.normalizer.record(ticket, Some(contact), msg, Some(&stored)),
            Err(e) => {
                tracing::error!(
                    ticket_id = ticket.id,
                    media_id = %media_ref.media_id,
                    error = %e,
                    "attachment download exhausted retries, recording without bytes"
                );
                self.normalizer.record(ticket, Some(contact), msg, None)
            }
        }
    }

    fn out_of_hours(&self, tenant: &Tenant, settings: &Settings, ticket: &Ticket) -> Result<bool> {
        let now = Utc::now();
        let within = match settings.schedule_type {
            ScheduleType::Disabled => return Ok(false),
            ScheduleType::Company => routing::schedule::tenant_within_schedule(tenant, now),
            ScheduleType::Queue => match ticket.queue_id {
                Some(queue_id) => QueueRepo::new(self.db.clone())
                    .get(queue_id)?
                    .is_none_or(|queue| routing::schedule::queue_within_schedule(&queue, now)),
                // No queue yet: fall back to the tenant window
                None => routing::schedule::tenant_within_schedule(tenant, now),
            },
        };
        Ok(!within)
    }

    /// Debounced out-of-hours notice, skipped when it was already the last
    /// thing we said
    fn send_out_of_hours_notice(
        &self,
        tenant: &Tenant,
        ticket: &Ticket,
        contact: &Contact,
    ) -> Result<()> {
        let Some(notice) = tenant
            .out_of_hours_message
            .clone()
            .filter(|n| !n.trim().is_empty())
        else {
            return Ok(());
        };

        let marked = format!("{AUTO_MARK}{notice}");
        let last = MessageRepo::new(self.db.clone()).last_from_me_body(ticket.id)?;
        if last.as_deref() == Some(marked.as_str()) {
            return Ok(());
        }

        let outbound = self.outbound.clone();
        let ticket = ticket.clone();
        let contact = contact.clone();
        self.debouncer.schedule(
            ticket.tenant_id,
            ticket.id,
            Duration::from_millis(self.config.debounce_ms),
            async move {
                if let Err(e) = outbound.send_text(&ticket, &contact, &notice).await {
                    tracing::warn!(ticket_id = ticket.id, error = %e, "out-of-hours notice send failed");
                }
            },
        );
        Ok(())
    }

    async fn forward_to_responder(&self, ticket: &Ticket, contact: &Contact, body: &str) {
        let Some(responder) = &self.responder else {
            return;
        };
        let Some(prompt) = body.strip_prefix(self.config.assist_prefix.as_str()) else {
            return;
        };

        match responder.reply(prompt.trim()).await {
            Ok(Some(reply)) => {
                if let Err(e) = self.outbound.send_text(ticket, contact, &reply).await {
                    tracing::warn!(ticket_id = ticket.id, error = %e, "responder reply send failed");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(ticket_id = ticket.id, error = %e, "auto-responder failed"),
        }
    }
}

fn digits_of(jid: &str) -> String {
    jid.chars().filter(char::is_ascii_digit).collect()
}
