//! Triage Engine - conversation session and routing engine for a
//! multi-tenant support desk
//!
//! Each tenant "number" holds one persistent session to the messaging
//! protocol. Inbound events drive the message pipeline, which drives the
//! ticket state machine, which drives automated sends back through the
//! session.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Protocol Bridge (HTTP)                  │
//! └────────────────────┬────────────────────────────────┘
//!                      │ per-tenant event stream
//! ┌────────────────────▼────────────────────────────────┐
//! │  Session Manager   │  Session Store  │  Supervisors  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │  Pipeline: normalize │ dedup │ media │ persist       │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │  Routing: resolver │ state machine │ chatbot │ debounce │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod protocol;
pub mod retry;
pub mod routing;
pub mod session;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind};
pub use pipeline::{AutoResponder, MessagePipeline, OutboundDispatcher};
pub use routing::{
    ChatbotRouter, DispatchDebouncer, TicketResolver, TicketTransitions, TicketUpdate,
    TransitionOutcome,
};
pub use session::{SessionManager, SessionState, SessionStore};
