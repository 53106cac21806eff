//! Ticket resolution
//!
//! Finds or creates the ticket owning a contact's conversation. This is the
//! single serialization point that keeps a contact at one open-or-pending
//! ticket: a per-(tenant, contact) async lock serializes concurrent message
//! handlers in-process, and the partial unique index backs it at the
//! database level.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{Contact, DbPool, Ticket, TicketRepo};
use crate::{Error, Result};

/// Find-or-create resolver for contact tickets
pub struct TicketResolver {
    db: DbPool,
    locks: Mutex<HashMap<(i64, i64), Arc<Mutex<()>>>>,
}

impl TicketResolver {
    /// Create a resolver
    #[must_use]
    pub fn new(db: DbPool) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the ticket for an inbound message
    ///
    /// Reuses the contact's open-or-pending ticket when one exists;
    /// otherwise reopens the latest closed ticket to `pending` (fresh
    /// tracking episode, agent and bot state cleared) unless the message is
    /// self-sent; otherwise creates a new pending ticket with its tracking
    /// row.
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails
    pub async fn resolve(
        &self,
        tenant_id: i64,
        contact: &Contact,
        unread: u32,
        channel: &str,
        from_me: bool,
    ) -> Result<Ticket> {
        let lock = self.contact_lock(tenant_id, contact.id).await;
        let _guard = lock.lock().await;

        let tickets = TicketRepo::new(self.db.clone());

        if let Some(ticket) = tickets.find_active_for_contact(tenant_id, contact.id)? {
            if !from_me && unread > 0 {
                tickets.add_unread(ticket.id, unread)?;
            }
            return tickets
                .get(ticket.id)?
                .ok_or_else(|| Error::Database("ticket vanished".to_string()));
        }

        if let Some(latest) = tickets.find_latest_for_contact(tenant_id, contact.id)? {
            // Self-sent messages never reopen a closed conversation
            if from_me {
                return Ok(latest);
            }

            tickets.reopen(latest.id, unread)?;
            tickets.create_tracking(latest.id, tenant_id)?;
            tracing::debug!(ticket_id = latest.id, "reopened closed ticket");
            return tickets
                .get(latest.id)?
                .ok_or_else(|| Error::Database("ticket vanished".to_string()));
        }

        match tickets.create(tenant_id, contact.id, channel, contact.is_group, unread) {
            Ok(ticket) => {
                tickets.create_tracking(ticket.id, tenant_id)?;
                Ok(ticket)
            }
            // Lost a cross-process race against the unique active-ticket
            // index: the winner's ticket is the one to use
            Err(Error::Sqlite(e)) if is_constraint_violation(&e) => tickets
                .find_active_for_contact(tenant_id, contact.id)?
                .ok_or(Error::Sqlite(e)),
            Err(e) => Err(e),
        }
    }

    async fn contact_lock(&self, tenant_id: i64, contact_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((tenant_id, contact_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
