//! Tenant repository
//!
//! A tenant row is one support-desk "number": its session status, its opaque
//! protocol credential blob, pairing state, and the automated-message
//! templates used by the routing engine. The credential blob is owned
//! exclusively by the connection supervisor.

use rusqlite::Row;

use super::{DbPool, conn};
use crate::session::SessionState;
use crate::{Error, Result};

/// A tenant number and its session state
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub status: SessionState,
    /// Opaque protocol credential blob; `None` until first pairing
    pub credentials: Option<String>,
    pub pairing_code: Option<String>,
    /// Consecutive pairing codes issued without a successful connect
    pub pairing_retries: u32,
    pub greeting_message: Option<String>,
    pub completion_message: Option<String>,
    pub rating_message: Option<String>,
    pub out_of_hours_message: Option<String>,
    /// Working hours start, "HH:MM"
    pub hours_start: Option<String>,
    /// Working hours end, "HH:MM"
    pub hours_end: Option<String>,
    /// Comma-separated working weekdays, Monday = 1
    pub workdays: String,
}

const TENANT_COLUMNS: &str = "id, name, status, credentials, pairing_code, pairing_retries, \
     greeting_message, completion_message, rating_message, out_of_hours_message, \
     hours_start, hours_end, workdays";

fn row_to_tenant(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        status: SessionState::from_str(&row.get::<_, String>(2)?)
            .unwrap_or(SessionState::Uninitialized),
        credentials: row.get(3)?,
        pairing_code: row.get(4)?,
        pairing_retries: row.get::<_, i64>(5)?.try_into().unwrap_or(0),
        greeting_message: row.get(6)?,
        completion_message: row.get(7)?,
        rating_message: row.get(8)?,
        out_of_hours_message: row.get(9)?,
        hours_start: row.get(10)?,
        hours_end: row.get(11)?,
        workdays: row.get(12)?,
    })
}

/// Tenant repository
#[derive(Clone)]
pub struct TenantRepo {
    pool: DbPool,
}

impl TenantRepo {
    /// Create a new tenant repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a tenant
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(&self, name: &str) -> Result<Tenant> {
        let conn = conn(&self.pool)?;
        conn.execute("INSERT INTO tenants (name) VALUES (?1)", [name])?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get(id)?
            .ok_or_else(|| Error::Database("tenant vanished after insert".to_string()))
    }

    /// Fetch a tenant by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: i64) -> Result<Option<Tenant>> {
        let conn = conn(&self.pool)?;
        let tenant = conn
            .query_row(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                [id],
                row_to_tenant,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(tenant)
    }

    /// List all tenants
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<Tenant>> {
        let conn = conn(&self.pool)?;
        let mut stmt =
            conn.prepare(&format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY id"))?;
        let tenants = stmt
            .query_map([], row_to_tenant)?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(tenants)
    }

    /// List tenants that already hold credentials and should be resumed on
    /// process start
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_authorized(&self) -> Result<Vec<Tenant>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE credentials IS NOT NULL ORDER BY id"
        ))?;
        let tenants = stmt
            .query_map([], row_to_tenant)?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(tenants)
    }

    /// Persist the session status
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_status(&self, id: i64, status: SessionState) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tenants SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            rusqlite::params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Persist a rotated credential blob
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_credentials(&self, id: i64, credentials: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tenants SET credentials = ?1, updated_at = datetime('now') WHERE id = ?2",
            rusqlite::params![credentials, id],
        )?;
        Ok(())
    }

    /// Record a freshly issued pairing code and bump the retry counter
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record_pairing_code(&self, id: i64, code: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tenants SET status = ?1, pairing_code = ?2, \
             pairing_retries = pairing_retries + 1, updated_at = datetime('now') WHERE id = ?3",
            rusqlite::params![SessionState::Pairing.as_str(), code, id],
        )?;
        Ok(())
    }

    /// Mark the session connected: clear pairing state, reset retries
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_connected(&self, id: i64) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tenants SET status = ?1, pairing_code = NULL, pairing_retries = 0, \
             updated_at = datetime('now') WHERE id = ?2",
            rusqlite::params![SessionState::Connected.as_str(), id],
        )?;
        Ok(())
    }

    /// Terminal teardown: wipe credentials and pairing state, mark the tenant
    /// as needing a fresh pairing
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn wipe_session(&self, id: i64) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tenants SET status = ?1, credentials = NULL, pairing_code = NULL, \
             pairing_retries = 0, updated_at = datetime('now') WHERE id = ?2",
            rusqlite::params![SessionState::Disconnected.as_str(), id],
        )?;
        Ok(())
    }

    /// Update the automated-message templates
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_messages(
        &self,
        id: i64,
        greeting: Option<&str>,
        completion: Option<&str>,
        rating: Option<&str>,
        out_of_hours: Option<&str>,
    ) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tenants SET greeting_message = ?1, completion_message = ?2, \
             rating_message = ?3, out_of_hours_message = ?4, updated_at = datetime('now') \
             WHERE id = ?5",
            rusqlite::params![greeting, completion, rating, out_of_hours, id],
        )?;
        Ok(())
    }

    /// Update the working-hours window
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_hours(
        &self,
        id: i64,
        start: Option<&str>,
        end: Option<&str>,
        workdays: &str,
    ) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE tenants SET hours_start = ?1, hours_end = ?2, workdays = ?3, \
             updated_at = datetime('now') WHERE id = ?4",
            rusqlite::params![start, end, workdays, id],
        )?;
        Ok(())
    }
}
