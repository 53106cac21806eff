//! Contact repository
//!
//! Contacts are conversation identities: direct peers and groups. They are
//! created or refreshed idempotently on first sight and never deleted here.

use rusqlite::Row;

use super::{DbPool, conn};
use crate::{Error, Result};

/// A conversation identity
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: i64,
    pub tenant_id: i64,
    /// External conversation identifier
    pub jid: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub is_group: bool,
}

fn row_to_contact(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        jid: row.get(2)?,
        name: row.get(3)?,
        avatar_url: row.get(4)?,
        is_group: row.get(5)?,
    })
}

const CONTACT_COLUMNS: &str = "id, tenant_id, jid, name, avatar_url, is_group";

/// Contact repository
#[derive(Clone)]
pub struct ContactRepo {
    pool: DbPool,
}

impl ContactRepo {
    /// Create a new contact repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a contact, keyed by `(tenant_id, jid)`
    ///
    /// The name is refreshed on every call; the avatar only when a new value
    /// is provided.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(
        &self,
        tenant_id: i64,
        jid: &str,
        name: &str,
        avatar_url: Option<&str>,
        is_group: bool,
    ) -> Result<Contact> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT INTO contacts (tenant_id, jid, name, avatar_url, is_group)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id, jid) DO UPDATE SET
                 name = excluded.name,
                 avatar_url = COALESCE(excluded.avatar_url, contacts.avatar_url),
                 updated_at = datetime('now')",
            rusqlite::params![tenant_id, jid, name, avatar_url, is_group],
        )?;

        conn.query_row(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = ?1 AND jid = ?2"),
            rusqlite::params![tenant_id, jid],
            row_to_contact,
        )
        .map_err(Error::from)
    }

    /// Fetch a contact by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: i64) -> Result<Option<Contact>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            [id],
            row_to_contact,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }
}
