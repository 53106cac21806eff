//! Message normalization
//!
//! Turns raw protocol messages into stored [`crate::db::StoredMessage`]
//! rows: noise filtering, per-kind body extraction, quoted-message
//! resolution, and the tenant-scoped dedup that makes ingestion idempotent.

use crate::db::{Contact, DbPool, MessageRepo, NewMessage, Ticket, TicketRepo};
use crate::events::{EventBus, EventKind};
use crate::pipeline::media::StoredMedia;
use crate::protocol::{RawContent, RawMessage};
use crate::Result;

/// Invisible marker prefixed to automated sends so their echoes can be
/// recognized and skipped
pub const AUTO_MARK: char = '\u{200e}';

/// Whether a body carries the automated-send marker
#[must_use]
pub fn is_automated(body: &str) -> bool {
    body.starts_with(AUTO_MARK)
}

/// Protocol noise that never enters the pipeline: administrative stubs and
/// broadcast-status chatter
#[must_use]
pub fn is_noise(msg: &RawMessage) -> bool {
    if msg.key.chat.is_status_broadcast() {
        return true;
    }
    matches!(msg.content, RawContent::Stub { .. })
}

/// Short name of a content kind, used as the stored media type for
/// non-attachment messages
#[must_use]
pub fn kind_name(content: &RawContent) -> &'static str {
    match content {
        RawContent::Text { .. } => "text",
        RawContent::Image { .. } => "image",
        RawContent::Video { .. } => "video",
        RawContent::Audio { .. } => "audio",
        RawContent::Sticker { .. } => "sticker",
        RawContent::Document { .. } => "document",
        RawContent::ButtonReply { .. } => "button_reply",
        RawContent::ListReply { .. } => "list_reply",
        RawContent::Location { .. } => "location",
        RawContent::LiveLocation { .. } => "live_location",
        RawContent::ContactCard { .. } => "contact_card",
        RawContent::ContactList { .. } => "contact_list",
        RawContent::Reaction { .. } => "reaction",
        RawContent::Stub { .. } => "stub",
        RawContent::Unrecognized => "unrecognized",
    }
}

/// Extract a display body from a raw message
///
/// Every known kind maps to a best-effort string; an unrecognized kind logs
/// a diagnostic and yields an empty body instead of failing the message.
#[must_use]
pub fn body_of(msg: &RawMessage) -> String {
    match &msg.content {
        RawContent::Text { body } => body.clone(),
        RawContent::Image { caption, .. } | RawContent::Video { caption, .. } => {
            caption.clone().unwrap_or_default()
        }
        RawContent::Audio { .. } => String::new(),
        RawContent::Sticker { .. } => "sticker".to_string(),
        RawContent::Document { filename, .. } => filename.clone().unwrap_or_default(),
        RawContent::ButtonReply { display_text, .. } => display_text.clone(),
        RawContent::ListReply { title, .. } => title.clone(),
        RawContent::Location {
            latitude,
            longitude,
        } => format!("https://maps.google.com/maps?q={latitude}%2C{longitude}&z=17"),
        RawContent::LiveLocation {
            latitude,
            longitude,
        } => format!("Latitude: {latitude} - Longitude: {longitude}"),
        RawContent::ContactCard { vcard } => vcard.clone(),
        RawContent::ContactList { count } => format!("{count} shared contacts"),
        RawContent::Reaction { emoji, .. } => emoji.clone(),
        RawContent::Stub { .. } => String::new(),
        RawContent::Unrecognized => {
            tracing::warn!(
                message_id = %msg.key.id,
                payload = %msg.payload,
                "unrecognized message content kind"
            );
            String::new()
        }
    }
}

/// Attachment reference carried by a message, with its filename hint
#[must_use]
pub fn media_of(content: &RawContent) -> Option<(&crate::protocol::MediaRef, Option<&str>)> {
    match content {
        RawContent::Image { media, .. }
        | RawContent::Video { media, .. }
        | RawContent::Audio { media }
        | RawContent::Sticker { media } => Some((media, None)),
        RawContent::Document { media, filename } => Some((media, filename.as_deref())),
        _ => None,
    }
}

/// Persists normalized messages and their side effects
#[derive(Clone)]
pub struct Normalizer {
    db: DbPool,
    bus: EventBus,
}

impl Normalizer {
    /// Create a normalizer over the given store and bus
    #[must_use]
    pub const fn new(db: DbPool, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Record a message against its ticket
    ///
    /// Idempotent: returns `false` (and performs no side effect) when the
    /// protocol message id was already stored for this tenant. On insert,
    /// the owning ticket's last-message preview is refreshed and a
    /// `message-updated` event is emitted.
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails
    pub fn record(
        &self,
        ticket: &Ticket,
        contact: Option<&Contact>,
        msg: &RawMessage,
        stored_media: Option<&StoredMedia>,
    ) -> Result<bool> {
        let messages = MessageRepo::new(self.db.clone());
        let tickets = TicketRepo::new(self.db.clone());

        // Quoted back-reference is weak: absence is not an error
        let quoted_msg_id = msg
            .quoted_id
            .as_deref()
            .map(|id| messages.get(ticket.tenant_id, id))
            .transpose()?
            .flatten()
            .map(|quoted| quoted.id);

        let mut body = body_of(msg);
        if body.is_empty() {
            // A media message with no caption is previewed by its filename
            if let Some(stored) = stored_media {
                body.clone_from(&stored.filename);
            } else if let Some((_, hint)) = media_of(&msg.content) {
                body = hint.map_or_else(|| kind_name(&msg.content).to_string(), String::from);
            }
        }

        let media_type = stored_media.map_or_else(
            || kind_name(&msg.content).to_string(),
            |stored| {
                stored
                    .mime_type
                    .split('/')
                    .next()
                    .unwrap_or("application")
                    .to_string()
            },
        );

        let record = NewMessage {
            id: msg.key.id.clone(),
            tenant_id: ticket.tenant_id,
            ticket_id: ticket.id,
            contact_id: if msg.key.from_me {
                None
            } else {
                contact.map(|c| c.id)
            },
            body: body.clone(),
            from_me: msg.key.from_me,
            read: msg.key.from_me,
            media_url: stored_media.map(|stored| stored.filename.clone()),
            media_type: Some(media_type),
            quoted_msg_id,
            ack: msg.ack,
            remote_jid: Some(msg.key.chat.jid().to_string()),
            participant: msg.key.participant.clone(),
            payload_json: msg.payload.to_string(),
        };

        let inserted = messages.insert(&record)?;
        if !inserted {
            tracing::debug!(
                tenant_id = ticket.tenant_id,
                message_id = %msg.key.id,
                "duplicate protocol message id, dropped"
            );
            return Ok(false);
        }

        tickets.set_last_message(ticket.id, &body)?;
        self.bus.emit(EventKind::MessageUpdated {
            tenant_id: ticket.tenant_id,
            ticket_id: ticket.id,
            message_id: msg.key.id.clone(),
        });

        Ok(true)
    }
}
