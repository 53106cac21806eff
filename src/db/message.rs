//! Message repository
//!
//! Messages are keyed by the external protocol id scoped to tenant, and the
//! insert is idempotent: a redelivered id is silently ignored. Only the ack
//! state mutates after insert.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use super::{DbPool, conn, parse_datetime};
use crate::protocol::AckState;
use crate::{Error, Result};

/// A stored message
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// External protocol message id
    pub id: String,
    pub tenant_id: i64,
    pub ticket_id: i64,
    pub contact_id: Option<i64>,
    pub body: String,
    pub from_me: bool,
    pub read: bool,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    /// Weak back-reference to a quoted message
    pub quoted_msg_id: Option<String>,
    pub ack: AckState,
    pub created_at: DateTime<Utc>,
}

/// Fields for a message insert
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub tenant_id: i64,
    pub ticket_id: i64,
    pub contact_id: Option<i64>,
    pub body: String,
    pub from_me: bool,
    pub read: bool,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub quoted_msg_id: Option<String>,
    pub ack: AckState,
    pub remote_jid: Option<String>,
    pub participant: Option<String>,
    /// Raw protocol payload snapshot for audit
    pub payload_json: String,
}

const MESSAGE_COLUMNS: &str = "id, tenant_id, ticket_id, contact_id, body, from_me, read, \
     media_url, media_type, quoted_msg_id, ack, created_at";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        ticket_id: row.get(2)?,
        contact_id: row.get(3)?,
        body: row.get(4)?,
        from_me: row.get(5)?,
        read: row.get(6)?,
        media_url: row.get(7)?,
        media_type: row.get(8)?,
        quoted_msg_id: row.get(9)?,
        ack: AckState::from_i64(row.get(10)?),
        created_at: parse_datetime(&row.get::<_, String>(11)?),
    })
}

/// Message repository
#[derive(Clone)]
pub struct MessageRepo {
    pool: DbPool,
}

impl MessageRepo {
    /// Create a new message repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Whether a protocol message id was already ingested for this tenant
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn exists(&self, tenant_id: i64, id: &str) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE tenant_id = ?1 AND id = ?2",
            rusqlite::params![tenant_id, id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Idempotent insert: returns `false` when the id was already stored
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, message: &NewMessage) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages \
             (id, tenant_id, ticket_id, contact_id, body, from_me, read, media_url, media_type, \
              quoted_msg_id, ack, remote_jid, participant, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                message.id,
                message.tenant_id,
                message.ticket_id,
                message.contact_id,
                message.body,
                message.from_me,
                message.read,
                message.media_url,
                message.media_type,
                message.quoted_msg_id,
                message.ack.as_i64(),
                message.remote_jid,
                message.participant,
                message.payload_json,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Fetch one message
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, tenant_id: i64, id: &str) -> Result<Option<StoredMessage>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE tenant_id = ?1 AND id = ?2"),
            rusqlite::params![tenant_id, id],
            row_to_message,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }

    /// Update a message's ack state; returns the owning ticket id when the
    /// message exists
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_ack(&self, tenant_id: i64, id: &str, ack: AckState) -> Result<Option<i64>> {
        let conn = conn(&self.pool)?;
        let ticket_id: Option<i64> = conn
            .query_row(
                "SELECT ticket_id FROM messages WHERE tenant_id = ?1 AND id = ?2",
                rusqlite::params![tenant_id, id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::from(other)),
            })?;

        if ticket_id.is_some() {
            conn.execute(
                "UPDATE messages SET ack = ?1 WHERE tenant_id = ?2 AND id = ?3",
                rusqlite::params![ack.as_i64(), tenant_id, id],
            )?;
        }
        Ok(ticket_id)
    }

    /// Body of the latest agent-side message on a ticket
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn last_from_me_body(&self, ticket_id: i64) -> Result<Option<String>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            "SELECT body FROM messages WHERE ticket_id = ?1 AND from_me = 1 \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            [ticket_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }

    /// Mark every message on a ticket as read
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_ticket_read(&self, ticket_id: i64) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute("UPDATE messages SET read = 1 WHERE ticket_id = ?1", [ticket_id])?;
        Ok(())
    }

    /// Count messages on a ticket
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count_for_ticket(&self, ticket_id: i64) -> Result<usize> {
        let conn = conn(&self.pool)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE ticket_id = ?1",
            [ticket_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ContactRepo, TenantRepo, TicketRepo, init_memory};

    fn fixture() -> (MessageRepo, i64, i64) {
        let pool = init_memory().unwrap();
        let tenant = TenantRepo::new(pool.clone()).create("t").unwrap();
        let contact = ContactRepo::new(pool.clone())
            .upsert(tenant.id, "j", "c", None, false)
            .unwrap();
        let ticket = TicketRepo::new(pool.clone())
            .create(tenant.id, contact.id, "whatsapp", false, 0)
            .unwrap();
        (MessageRepo::new(pool), tenant.id, ticket.id)
    }

    fn new_message(tenant_id: i64, ticket_id: i64, id: &str) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            tenant_id,
            ticket_id,
            contact_id: None,
            body: "hello".to_string(),
            from_me: false,
            read: false,
            media_url: None,
            media_type: None,
            quoted_msg_id: None,
            ack: AckState::Pending,
            remote_jid: None,
            participant: None,
            payload_json: "{}".to_string(),
        }
    }

    #[test]
    fn duplicate_id_is_ignored() {
        let (repo, tenant_id, ticket_id) = fixture();
        let msg = new_message(tenant_id, ticket_id, "WAMID.1");

        assert!(repo.insert(&msg).unwrap());
        assert!(!repo.insert(&msg).unwrap());
        assert_eq!(repo.count_for_ticket(ticket_id).unwrap(), 1);
    }

    #[test]
    fn ack_updates_and_reports_ticket() {
        let (repo, tenant_id, ticket_id) = fixture();
        repo.insert(&new_message(tenant_id, ticket_id, "WAMID.2")).unwrap();

        let owner = repo.set_ack(tenant_id, "WAMID.2", AckState::Read).unwrap();
        assert_eq!(owner, Some(ticket_id));
        let stored = repo.get(tenant_id, "WAMID.2").unwrap().unwrap();
        assert_eq!(stored.ack, AckState::Read);

        assert_eq!(repo.set_ack(tenant_id, "missing", AckState::Read).unwrap(), None);
    }

    #[test]
    fn last_from_me_body_ignores_inbound() {
        let (repo, tenant_id, ticket_id) = fixture();
        repo.insert(&new_message(tenant_id, ticket_id, "in-1")).unwrap();

        let mut outbound = new_message(tenant_id, ticket_id, "out-1");
        outbound.from_me = true;
        outbound.body = "we are closed".to_string();
        repo.insert(&outbound).unwrap();

        assert_eq!(
            repo.last_from_me_body(ticket_id).unwrap().as_deref(),
            Some("we are closed")
        );
    }
}
