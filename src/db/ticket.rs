//! Ticket and ticket-tracking repository
//!
//! A ticket is one support conversation for a contact. Closure is a status,
//! never a deletion. Each episode (creation or reopen) gets its own tracking
//! row carrying the queue/start/rating/finish milestones.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use super::{DbPool, conn, parse_datetime};
use crate::{Error, Result};

/// Ticket lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    /// Waiting in a queue (or for queue selection)
    Pending,
    /// Claimed by an agent
    Open,
    /// Finished
    Closed,
}

impl TicketStatus {
    /// Store encoding
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Decode the store encoding
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A support conversation
#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: i64,
    pub tenant_id: i64,
    pub contact_id: i64,
    pub channel: String,
    pub status: TicketStatus,
    pub queue_id: Option<i64>,
    pub user_id: Option<i64>,
    /// Conversation currently driven by the chatbot menu
    pub is_bot: bool,
    /// Selected chatbot sub-option marker
    pub queue_option_id: Option<i64>,
    pub last_message: String,
    pub unread_count: u32,
    pub is_group: bool,
}

/// Milestones of one ticket episode
#[derive(Debug, Clone)]
pub struct TicketTracking {
    pub id: i64,
    pub ticket_id: i64,
    pub tenant_id: i64,
    /// Agent attending this episode
    pub user_id: Option<i64>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// When the rating prompt was sent; `Some` means "awaiting rating"
    /// until `rated` flips
    pub rating_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rated: bool,
    /// Clamped rating value, 1..=3
    pub rating: Option<i64>,
}

const TICKET_COLUMNS: &str = "id, tenant_id, contact_id, channel, status, queue_id, user_id, \
     is_bot, queue_option_id, last_message, unread_count, is_group";

fn row_to_ticket(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        contact_id: row.get(2)?,
        channel: row.get(3)?,
        status: TicketStatus::from_str(&row.get::<_, String>(4)?).unwrap_or(TicketStatus::Pending),
        queue_id: row.get(5)?,
        user_id: row.get(6)?,
        is_bot: row.get(7)?,
        queue_option_id: row.get(8)?,
        last_message: row.get(9)?,
        unread_count: row.get::<_, i64>(10)?.try_into().unwrap_or(0),
        is_group: row.get(11)?,
    })
}

const TRACKING_COLUMNS: &str =
    "id, ticket_id, tenant_id, user_id, queued_at, started_at, rating_at, finished_at, rated, rating";

fn row_to_tracking(row: &Row<'_>) -> rusqlite::Result<TicketTracking> {
    let opt_dt = |value: Option<String>| value.map(|s| parse_datetime(&s));
    Ok(TicketTracking {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        tenant_id: row.get(2)?,
        user_id: row.get(3)?,
        queued_at: opt_dt(row.get(4)?),
        started_at: opt_dt(row.get(5)?),
        rating_at: opt_dt(row.get(6)?),
        finished_at: opt_dt(row.get(7)?),
        rated: row.get(8)?,
        rating: row.get(9)?,
    })
}

fn to_rfc3339(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.to_rfc3339())
}

/// Ticket repository
#[derive(Clone)]
pub struct TicketRepo {
    pool: DbPool,
}

impl TicketRepo {
    /// Create a new ticket repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a pending ticket
    ///
    /// Fails with a constraint violation when the contact already holds an
    /// open or pending ticket (partial unique index); callers treat that as
    /// "lost the race" and re-query.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(
        &self,
        tenant_id: i64,
        contact_id: i64,
        channel: &str,
        is_group: bool,
        unread_count: u32,
    ) -> Result<Ticket> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT INTO tickets (tenant_id, contact_id, channel, status, is_group, unread_count) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
            rusqlite::params![tenant_id, contact_id, channel, is_group, unread_count],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get(id)?
            .ok_or_else(|| Error::Database("ticket vanished after insert".to_string()))
    }

    /// Fetch a ticket by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: i64) -> Result<Option<Ticket>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
            [id],
            row_to_ticket,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }

    /// Find the contact's open-or-pending ticket, if any
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_active_for_contact(
        &self,
        tenant_id: i64,
        contact_id: i64,
    ) -> Result<Option<Ticket>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets \
                 WHERE tenant_id = ?1 AND contact_id = ?2 AND status IN ('open', 'pending') \
                 LIMIT 1"
            ),
            rusqlite::params![tenant_id, contact_id],
            row_to_ticket,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }

    /// Find the contact's most recent ticket regardless of status
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_latest_for_contact(
        &self,
        tenant_id: i64,
        contact_id: i64,
    ) -> Result<Option<Ticket>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets \
                 WHERE tenant_id = ?1 AND contact_id = ?2 \
                 ORDER BY updated_at DESC, id DESC LIMIT 1"
            ),
            rusqlite::params![tenant_id, contact_id],
            row_to_ticket,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }

    /// Reopen a closed ticket to pending: clears agent, bot flag, and
    /// option marker; keeps the queue
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn reopen(&self, ticket_id: i64, unread_count: u32) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tickets SET status = 'pending', user_id = NULL, is_bot = 0, \
             queue_option_id = NULL, unread_count = ?1, updated_at = datetime('now') \
             WHERE id = ?2",
            rusqlite::params![unread_count, ticket_id],
        )?;
        Ok(())
    }

    /// Apply a transition: status, routing assignment, and bot markers
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn apply(
        &self,
        ticket_id: i64,
        status: TicketStatus,
        queue_id: Option<i64>,
        user_id: Option<i64>,
        is_bot: bool,
        queue_option_id: Option<i64>,
    ) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tickets SET status = ?1, queue_id = ?2, user_id = ?3, is_bot = ?4, \
             queue_option_id = ?5, updated_at = datetime('now') WHERE id = ?6",
            rusqlite::params![status.as_str(), queue_id, user_id, is_bot, queue_option_id, ticket_id],
        )?;
        Ok(())
    }

    /// Refresh the last-message preview
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_last_message(&self, ticket_id: i64, preview: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tickets SET last_message = ?1, updated_at = datetime('now') WHERE id = ?2",
            rusqlite::params![preview, ticket_id],
        )?;
        Ok(())
    }

    /// Bump the unread counter
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn add_unread(&self, ticket_id: i64, count: u32) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tickets SET unread_count = unread_count + ?1, updated_at = datetime('now') \
             WHERE id = ?2",
            rusqlite::params![count, ticket_id],
        )?;
        Ok(())
    }

    /// Zero the unread counter
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn clear_unread(&self, ticket_id: i64) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tickets SET unread_count = 0, updated_at = datetime('now') WHERE id = ?1",
            [ticket_id],
        )?;
        Ok(())
    }

    /// Count the contact's open-or-pending tickets
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count_active_for_contact(&self, tenant_id: i64, contact_id: i64) -> Result<usize> {
        let conn = conn(&self.pool)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tickets \
             WHERE tenant_id = ?1 AND contact_id = ?2 AND status IN ('open', 'pending')",
            rusqlite::params![tenant_id, contact_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    // -- Tracking episodes --

    /// Start a fresh tracking episode for a ticket
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create_tracking(&self, ticket_id: i64, tenant_id: i64) -> Result<TicketTracking> {
        let conn = conn(&self.pool)?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO ticket_trackings (ticket_id, tenant_id, queued_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![ticket_id, tenant_id, now],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.tracking_by_id(id)?
            .ok_or_else(|| Error::Database("tracking vanished after insert".to_string()))
    }

    /// The current (latest) tracking episode of a ticket, creating one when
    /// none exists yet
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn current_tracking(&self, ticket_id: i64, tenant_id: i64) -> Result<TicketTracking> {
        let existing = {
            let conn = conn(&self.pool)?;
            conn.query_row(
                &format!(
                    "SELECT {TRACKING_COLUMNS} FROM ticket_trackings \
                     WHERE ticket_id = ?1 ORDER BY id DESC LIMIT 1"
                ),
                [ticket_id],
                row_to_tracking,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::from(other)),
            })?
        };

        match existing {
            Some(tracking) => Ok(tracking),
            None => self.create_tracking(ticket_id, tenant_id),
        }
    }

    /// Persist a modified tracking episode
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn save_tracking(&self, tracking: &TicketTracking) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE ticket_trackings SET user_id = ?1, queued_at = ?2, started_at = ?3, \
             rating_at = ?4, finished_at = ?5, rated = ?6, rating = ?7 WHERE id = ?8",
            rusqlite::params![
                tracking.user_id,
                to_rfc3339(tracking.queued_at),
                to_rfc3339(tracking.started_at),
                to_rfc3339(tracking.rating_at),
                to_rfc3339(tracking.finished_at),
                tracking.rated,
                tracking.rating,
                tracking.id,
            ],
        )?;
        Ok(())
    }

    fn tracking_by_id(&self, id: i64) -> Result<Option<TicketTracking>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!("SELECT {TRACKING_COLUMNS} FROM ticket_trackings WHERE id = ?1"),
            [id],
            row_to_tracking,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }
}
