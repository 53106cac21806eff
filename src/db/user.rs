//! Agent repository

use super::{DbPool, conn};
use crate::{Error, Result};

/// A human agent
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
}

/// Agent repository
#[derive(Clone)]
pub struct UserRepo {
    pool: DbPool,
}

impl UserRepo {
    /// Create a new user repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create an agent
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(&self, name: &str) -> Result<User> {
        let conn = conn(&self.pool)?;
        conn.execute("INSERT INTO users (name) VALUES (?1)", [name])?;
        Ok(User {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    /// Fetch an agent by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: i64) -> Result<Option<User>> {
        let conn = conn(&self.pool)?;
        conn.query_row("SELECT id, name FROM users WHERE id = ?1", [id], |row| {
            Ok(User {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }

    /// Display name for an optional agent id, "-" when unknown
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn display_name(&self, id: Option<i64>) -> Result<String> {
        Ok(match id {
            Some(id) => self.get(id)?.map_or_else(|| "-".to_string(), |u| u.name),
            None => "-".to_string(),
        })
    }
}
