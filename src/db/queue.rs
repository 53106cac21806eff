//! Queue repository
//!
//! Queues and their chatbot sub-options are routing targets managed by the
//! CRUD layer; this engine only reads them (the create helpers exist for
//! that layer and for tests).

use rusqlite::Row;

use super::{DbPool, conn};
use crate::{Error, Result};

/// A routing target (department)
#[derive(Debug, Clone)]
pub struct Queue {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub greeting_message: String,
    /// Working hours start, "HH:MM" (used when schedule type is per-queue)
    pub hours_start: Option<String>,
    /// Working hours end, "HH:MM"
    pub hours_end: Option<String>,
    /// Comma-separated working weekdays, Monday = 1
    pub workdays: String,
}

/// A selectable chatbot sub-option of a queue
#[derive(Debug, Clone)]
pub struct QueueOption {
    pub id: i64,
    pub queue_id: i64,
    pub name: String,
    pub message: String,
}

fn row_to_queue(row: &Row<'_>) -> rusqlite::Result<Queue> {
    Ok(Queue {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        greeting_message: row.get(3)?,
        hours_start: row.get(4)?,
        hours_end: row.get(5)?,
        workdays: row.get(6)?,
    })
}

const QUEUE_COLUMNS: &str =
    "id, tenant_id, name, greeting_message, hours_start, hours_end, workdays";

/// Queue repository
#[derive(Clone)]
pub struct QueueRepo {
    pool: DbPool,
}

impl QueueRepo {
    /// Create a new queue repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// List a tenant's queues in menu order
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_tenant(&self, tenant_id: i64) -> Result<Vec<Queue>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queues WHERE tenant_id = ?1 ORDER BY position, id"
        ))?;
        let queues = stmt
            .query_map([tenant_id], row_to_queue)?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(queues)
    }

    /// Fetch a queue by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: i64) -> Result<Option<Queue>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            &format!("SELECT {QUEUE_COLUMNS} FROM queues WHERE id = ?1"),
            [id],
            row_to_queue,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }

    /// List a queue's chatbot sub-options in menu order
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn options_for_queue(&self, queue_id: i64) -> Result<Vec<QueueOption>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT id, queue_id, name, message FROM queue_options \
             WHERE queue_id = ?1 ORDER BY position, id",
        )?;
        let options = stmt
            .query_map([queue_id], |row| {
                Ok(QueueOption {
                    id: row.get(0)?,
                    queue_id: row.get(1)?,
                    name: row.get(2)?,
                    message: row.get(3)?,
                })
            })?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(options)
    }

    /// Create a queue
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(&self, tenant_id: i64, name: &str, greeting_message: &str) -> Result<Queue> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT INTO queues (tenant_id, name, greeting_message) VALUES (?1, ?2, ?3)",
            rusqlite::params![tenant_id, name, greeting_message],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get(id)?
            .ok_or_else(|| Error::Database("queue vanished after insert".to_string()))
    }

    /// Add a chatbot sub-option to a queue
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn add_option(&self, queue_id: i64, name: &str, message: &str) -> Result<QueueOption> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT INTO queue_options (queue_id, name, message) VALUES (?1, ?2, ?3)",
            rusqlite::params![queue_id, name, message],
        )?;
        Ok(QueueOption {
            id: conn.last_insert_rowid(),
            queue_id,
            name: name.to_string(),
            message: message.to_string(),
        })
    }
}
