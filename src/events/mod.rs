//! Real-time event bus
//!
//! The engine broadcasts lifecycle events for the UI layer: session status
//! changes, ticket transitions (scoped by status "room" so observers can
//! move tickets between views), and message updates. Publishing is
//! best-effort — an event with no subscribers is simply dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::TicketStatus;
use crate::session::SessionState;

/// Default event channel capacity
const DEFAULT_CAPACITY: usize = 256;

/// A published event: envelope plus payload
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Unique event id
    pub id: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Event payload
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Lifecycle event payloads
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A tenant session changed state
    SessionUpdated {
        tenant_id: i64,
        #[serde(serialize_with = "serialize_session_state")]
        status: SessionState,
        /// Current pairing code, present while pairing
        pairing_code: Option<String>,
    },
    /// A ticket was created or transitioned
    TicketUpdated {
        tenant_id: i64,
        ticket_id: i64,
        /// Status room the ticket now belongs to
        #[serde(serialize_with = "serialize_ticket_status")]
        status: TicketStatus,
    },
    /// A ticket left a status room (status or assignment changed)
    TicketRemoved {
        tenant_id: i64,
        ticket_id: i64,
        /// Status room the ticket left
        #[serde(serialize_with = "serialize_ticket_status")]
        room: TicketStatus,
    },
    /// A message was stored or its ack state changed
    MessageUpdated {
        tenant_id: i64,
        ticket_id: i64,
        message_id: String,
    },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_session_state<S: serde::Serializer>(
    state: &SessionState,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(state.as_str())
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_ticket_status<S: serde::Serializer>(
    status: &TicketStatus,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(status.as_str())
}

/// Broadcast bus for engine lifecycle events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default capacity
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event (best-effort)
    pub fn emit(&self, kind: EventKind) {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
        };
        if let Err(e) = self.tx.send(event) {
            tracing::trace!(error = %e, "event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
