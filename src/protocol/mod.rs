//! Messaging-protocol client surface
//!
//! The engine treats the underlying messaging protocol as an opaque
//! capability: a [`Transport`] dials one session per tenant and yields a
//! [`ProtocolClient`] plus a serial stream of [`SessionEvent`]s. The concrete
//! wire format lives behind the bridge adapter ([`bridge::BridgeTransport`]).

mod bridge;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use bridge::{BridgeClient, BridgeTransport};

use crate::Result;

/// Chat identity of the broadcast-status pseudo conversation
pub const STATUS_BROADCAST_JID: &str = "status@broadcast";

/// Address of a conversation, direct or group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "jid", rename_all = "snake_case")]
pub enum ChatAddress {
    /// One-on-one conversation, addressed by the contact identifier
    Direct(String),
    /// Group conversation, addressed by the group identifier
    Group(String),
}

impl ChatAddress {
    /// Classify a raw conversation identifier
    #[must_use]
    pub fn from_jid(jid: &str) -> Self {
        if jid.ends_with("@g.us") {
            Self::Group(jid.to_string())
        } else {
            Self::Direct(jid.to_string())
        }
    }

    /// The raw conversation identifier
    #[must_use]
    pub fn jid(&self) -> &str {
        match self {
            Self::Direct(jid) | Self::Group(jid) => jid,
        }
    }

    /// Whether this is a group conversation
    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// Whether this is the broadcast-status pseudo conversation
    #[must_use]
    pub fn is_status_broadcast(&self) -> bool {
        self.jid() == STATUS_BROADCAST_JID
    }
}

/// Identity of one protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageKey {
    /// External protocol message id (dedup scope: per tenant)
    pub id: String,
    /// Conversation the message belongs to
    pub chat: ChatAddress,
    /// Sender inside a group conversation
    #[serde(default)]
    pub participant: Option<String>,
    /// Whether the message was sent by this session's own number
    #[serde(default)]
    pub from_me: bool,
}

/// Reference to a downloadable attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    /// Opaque media identifier understood by the protocol client
    pub media_id: String,
    /// MIME type reported by the sender
    pub mime_type: String,
}

/// Administrative stub notices that never enter the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubKind {
    /// A message was revoked
    Revoke,
    /// A peer's device set changed
    DeviceChange,
    /// A peer's identity key changed
    IdentityChange,
    /// Undecryptable ciphertext placeholder
    Ciphertext,
    /// Any other administrative notice
    Other(String),
}

/// Content of a raw protocol message, one variant per content kind
///
/// Unknown kinds decode to [`RawContent::Unrecognized`] so novel protocol
/// shapes never stall the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawContent {
    /// Plain text
    Text {
        /// Message body
        body: String,
    },
    /// Image with optional caption
    Image {
        /// Caption text
        #[serde(default)]
        caption: Option<String>,
        /// Attachment reference
        media: MediaRef,
    },
    /// Video with optional caption
    Video {
        /// Caption text
        #[serde(default)]
        caption: Option<String>,
        /// Attachment reference
        media: MediaRef,
    },
    /// Voice note or audio file
    Audio {
        /// Attachment reference
        media: MediaRef,
    },
    /// Sticker
    Sticker {
        /// Attachment reference
        media: MediaRef,
    },
    /// Document with original filename
    Document {
        /// Original filename, if the sender provided one
        #[serde(default)]
        filename: Option<String>,
        /// Attachment reference
        media: MediaRef,
    },
    /// Reply to a native button prompt
    ButtonReply {
        /// Id of the selected button (1-based menu index as a string)
        selected_id: String,
        /// Display text of the selected button
        display_text: String,
    },
    /// Reply to a native selectable list
    ListReply {
        /// Row id of the selected entry (1-based menu index as a string)
        row_id: String,
        /// Title of the selected entry
        title: String,
    },
    /// Static location pin
    Location {
        /// Degrees latitude
        latitude: f64,
        /// Degrees longitude
        longitude: f64,
    },
    /// Live location update
    LiveLocation {
        /// Degrees latitude
        latitude: f64,
        /// Degrees longitude
        longitude: f64,
    },
    /// Shared contact card
    ContactCard {
        /// Raw vCard payload
        vcard: String,
    },
    /// Multiple shared contact cards
    ContactList {
        /// Number of cards shared
        count: u32,
    },
    /// Emoji reaction to an earlier message
    Reaction {
        /// Reaction emoji
        emoji: String,
        /// Id of the message being reacted to
        target_id: String,
    },
    /// Administrative stub notice
    Stub {
        /// Stub classification
        stub: StubKind,
    },
    /// Content kind this engine does not understand
    #[serde(other)]
    Unrecognized,
}

/// A raw inbound or outbound protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Message identity
    pub key: MessageKey,
    /// Sender display name, when the protocol provides one
    #[serde(default)]
    pub push_name: Option<String>,
    /// Protocol timestamp
    pub timestamp: DateTime<Utc>,
    /// Message content
    pub content: RawContent,
    /// Id of the message this one quotes, if any
    #[serde(default)]
    pub quoted_id: Option<String>,
    /// Delivery ack state at receipt time
    #[serde(default)]
    pub ack: AckState,
    /// Raw protocol payload snapshot for audit
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawMessage {
    /// Build a plain-text message (primarily for tests and send echoes)
    #[must_use]
    pub fn text(id: &str, chat: ChatAddress, from_me: bool, body: &str) -> Self {
        Self {
            key: MessageKey {
                id: id.to_string(),
                chat,
                participant: None,
                from_me,
            },
            push_name: None,
            timestamp: Utc::now(),
            content: RawContent::Text {
                body: body.to_string(),
            },
            quoted_id: None,
            ack: AckState::Pending,
            payload: serde_json::Value::Null,
        }
    }
}

/// Delivery acknowledgment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    /// Not yet accepted by the server
    #[default]
    Pending,
    /// Accepted by the server
    Sent,
    /// Delivered to the recipient device
    Delivered,
    /// Read by the recipient
    Read,
}

impl AckState {
    /// Integer encoding used in the message store
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// Decode the store encoding; unknown values clamp to [`AckState::Read`]
    #[must_use]
    pub const fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Self::Pending,
            1 => Self::Sent,
            2 => Self::Delivered,
            _ => Self::Read,
        }
    }
}

/// Asynchronous delivery-confirmation update for an earlier send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckUpdate {
    /// External protocol message id
    pub message_id: String,
    /// New ack state
    pub ack: AckState,
}

/// An inbound voice or video call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingCall {
    /// Protocol call identifier
    pub call_id: String,
    /// Caller conversation address
    pub from: ChatAddress,
}

/// Metadata of a group conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadata {
    /// Group conversation identifier
    pub jid: String,
    /// Group subject (display name)
    pub subject: String,
}

/// Why a session connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// Authorization revoked by the peer ("logged out") — terminal
    LoggedOut,
    /// Explicit rejection by the server — terminal, credentials wiped
    Forbidden,
    /// Server closed the connection
    ConnectionClosed,
    /// Connection lost mid-stream
    ConnectionLost,
    /// Another session replaced this one
    ConnectionReplaced,
    /// Connect or keepalive timed out
    TimedOut,
    /// Server requested a restart
    RestartRequired,
    /// Unmapped close code
    Other(u16),
}

impl DisconnectCause {
    /// Map a protocol close code
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::TimedOut,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    /// Terminal causes tear the session down instead of restarting it
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::LoggedOut | Self::Forbidden)
    }
}

/// One event on a tenant session's serial event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A fresh pairing code was issued
    PairingCode {
        /// The code to present to the tenant operator
        code: String,
    },
    /// The connection is established and authenticated
    Open,
    /// The connection closed
    Closed {
        /// Close cause
        cause: DisconnectCause,
    },
    /// The protocol rotated the session credentials
    CredentialsRotated {
        /// New opaque credential blob
        credentials: String,
    },
    /// A batch of inbound (or echoed outbound) messages
    Messages {
        /// Messages in delivery order
        messages: Vec<RawMessage>,
    },
    /// Delivery-confirmation updates
    Acks {
        /// Updates in delivery order
        updates: Vec<AckUpdate>,
    },
    /// An inbound voice or video call
    Call {
        /// Call details
        call: IncomingCall,
    },
}

/// Entry of a selectable menu (buttons or list rows)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuEntry {
    /// Reply id carried back in button/list replies
    pub id: String,
    /// Display title
    pub title: String,
}

/// Outbound media payload
#[derive(Debug, Clone)]
pub struct OutboundMedia {
    /// Raw bytes
    pub bytes: Vec<u8>,
    /// MIME type
    pub mime_type: String,
    /// Filename shown to the recipient
    pub filename: String,
    /// Optional caption
    pub caption: Option<String>,
}

/// Downloaded attachment payload
#[derive(Debug, Clone)]
pub struct MediaPayload {
    /// Raw bytes
    pub bytes: Vec<u8>,
    /// MIME type
    pub mime_type: String,
    /// Filename, if the protocol preserved one
    pub filename: Option<String>,
}

/// Capability surface of one live tenant session
///
/// Every send returns the echoed [`RawMessage`] so callers can record the
/// outbound message through the same path as inbound ones.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Send plain text
    async fn send_text(&self, to: &ChatAddress, body: &str) -> Result<RawMessage>;

    /// Send a native button prompt
    async fn send_buttons(
        &self,
        to: &ChatAddress,
        body: &str,
        buttons: &[MenuEntry],
    ) -> Result<RawMessage>;

    /// Send a native selectable list
    async fn send_list(
        &self,
        to: &ChatAddress,
        body: &str,
        button: &str,
        entries: &[MenuEntry],
    ) -> Result<RawMessage>;

    /// Send a media attachment
    async fn send_media(&self, to: &ChatAddress, media: &OutboundMedia) -> Result<RawMessage>;

    /// Download an attachment referenced by an inbound message
    async fn download_attachment(&self, media: &MediaRef) -> Result<MediaPayload>;

    /// Mark messages as read on the protocol side
    async fn read_receipts(&self, keys: &[MessageKey]) -> Result<()>;

    /// Fetch metadata of a group conversation
    async fn group_metadata(&self, chat: &ChatAddress) -> Result<GroupMetadata>;

    /// Reject an inbound call
    async fn reject_call(&self, call_id: &str) -> Result<()>;

    /// Log the session out, invalidating its credentials on the peer side
    async fn logout(&self) -> Result<()>;
}

/// An established session: client handle plus the serial event stream
pub struct Connection {
    /// Capability handle for outbound operations
    pub client: std::sync::Arc<dyn ProtocolClient>,
    /// Serial per-tenant event stream
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Dials one protocol session per tenant
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or resume, when `credentials` is `Some`) a session
    async fn connect(&self, tenant_id: i64, credentials: Option<&str>) -> Result<Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_address_classifies_groups() {
        assert!(ChatAddress::from_jid("12036304@g.us").is_group());
        assert!(!ChatAddress::from_jid("5511999@s.whatsapp.net").is_group());
    }

    #[test]
    fn status_broadcast_detected() {
        assert!(ChatAddress::from_jid(STATUS_BROADCAST_JID).is_status_broadcast());
        assert!(!ChatAddress::from_jid("5511999@s.whatsapp.net").is_status_broadcast());
    }

    #[test]
    fn terminal_causes() {
        assert!(DisconnectCause::LoggedOut.is_terminal());
        assert!(DisconnectCause::Forbidden.is_terminal());
        assert!(!DisconnectCause::ConnectionLost.is_terminal());
        assert!(!DisconnectCause::Other(599).is_terminal());
    }

    #[test]
    fn disconnect_cause_from_code() {
        assert_eq!(DisconnectCause::from_code(401), DisconnectCause::LoggedOut);
        assert_eq!(DisconnectCause::from_code(403), DisconnectCause::Forbidden);
        assert_eq!(DisconnectCause::from_code(515), DisconnectCause::RestartRequired);
        assert_eq!(DisconnectCause::from_code(777), DisconnectCause::Other(777));
    }

    #[test]
    fn ack_state_roundtrip() {
        assert_eq!(AckState::from_i64(AckState::Delivered.as_i64()), AckState::Delivered);
        assert_eq!(AckState::from_i64(-3), AckState::Pending);
        assert_eq!(AckState::from_i64(9), AckState::Read);
    }

    #[test]
    fn unknown_content_kind_decodes_to_unrecognized() {
        let value = serde_json::json!({ "kind": "pollCreation", "options": [] });
        let content: RawContent = serde_json::from_value(value).unwrap();
        assert!(matches!(content, RawContent::Unrecognized));
    }
}
