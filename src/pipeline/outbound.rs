//! Automated outbound sends
//!
//! Central helper for every automated message the engine produces (menus,
//! transition notices, rating prompts). Bodies are prefixed with the
//! automated-send marker and the protocol echo is recorded through the
//! normalizer, so automated traffic is visible on the ticket but its echo is
//! never re-processed.

use std::sync::Arc;

use crate::db::{Contact, DbPool, Ticket};
use crate::events::EventBus;
use crate::pipeline::normalizer::{AUTO_MARK, Normalizer};
use crate::protocol::{ChatAddress, MenuEntry};
use crate::session::SessionStore;
use crate::Result;

/// Label of the list-menu open button
const LIST_BUTTON_LABEL: &str = "Choose an option";

/// Sends automated messages for a ticket and records their echoes
#[derive(Clone)]
pub struct OutboundDispatcher {
    store: Arc<SessionStore>,
    normalizer: Normalizer,
}

impl OutboundDispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(db: DbPool, bus: EventBus, store: Arc<SessionStore>) -> Self {
        Self {
            store,
            normalizer: Normalizer::new(db, bus),
        }
    }

    /// Address of a ticket's conversation
    #[must_use]
    pub fn address_of(contact: &Contact) -> ChatAddress {
        if contact.is_group {
            ChatAddress::Group(contact.jid.clone())
        } else {
            ChatAddress::Direct(contact.jid.clone())
        }
    }

    /// Send automated text to the ticket's contact
    ///
    /// # Errors
    ///
    /// Returns error when no session is live or the send fails
    pub async fn send_text(&self, ticket: &Ticket, contact: &Contact, body: &str) -> Result<()> {
        let client = self.store.require(ticket.tenant_id)?.client()?;
        let marked = format!("{AUTO_MARK}{body}");
        let echo = client.send_text(&Self::address_of(contact), &marked).await?;
        self.normalizer.record(ticket, None, &echo, None)?;
        Ok(())
    }

    /// Send an automated button prompt
    ///
    /// # Errors
    ///
    /// Returns error when no session is live or the send fails
    pub async fn send_buttons(
        &self,
        ticket: &Ticket,
        contact: &Contact,
        body: &str,
        buttons: &[MenuEntry],
    ) -> Result<()> {
        let client = self.store.require(ticket.tenant_id)?.client()?;
        let marked = format!("{AUTO_MARK}{body}");
        let echo = client
            .send_buttons(&Self::address_of(contact), &marked, buttons)
            .await?;
        self.normalizer.record(ticket, None, &echo, None)?;
        Ok(())
    }

    /// Send an automated selectable list
    ///
    /// # Errors
    ///
    /// Returns error when no session is live or the send fails
    pub async fn send_list(
        &self,
        ticket: &Ticket,
        contact: &Contact,
        body: &str,
        entries: &[MenuEntry],
    ) -> Result<()> {
        let client = self.store.require(ticket.tenant_id)?.client()?;
        let marked = format!("{AUTO_MARK}{body}");
        let echo = client
            .send_list(&Self::address_of(contact), &marked, LIST_BUTTON_LABEL, entries)
            .await?;
        self.normalizer.record(ticket, None, &echo, None)?;
        Ok(())
    }
}
