//! Tenant-scoped settings
//!
//! Raw key/value flags live in the `settings` table (written by the CRUD
//! layer); [`Settings`] is the typed view this engine consumes.

use super::{DbPool, conn};
use crate::{Error, Result};

/// Chatbot menu presentation mode (`chatBotType` flag)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatbotMode {
    /// Plain numbered text
    #[default]
    Text,
    /// Native selectable buttons, falling back to text above the ceiling
    Button,
    /// Native selectable list
    List,
}

/// Out-of-hours handling mode (`scheduleType` flag)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleType {
    /// No working-hours handling
    #[default]
    Disabled,
    /// Hours are checked against the assigned queue
    Queue,
    /// Hours are checked against the tenant
    Company,
}

/// Raw settings repository
#[derive(Clone)]
pub struct SettingsRepo {
    pool: DbPool,
}

impl SettingsRepo {
    /// Create a new settings repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Read one flag
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, tenant_id: i64, key: &str) -> Result<Option<String>> {
        let conn = conn(&self.pool)?;
        conn.query_row(
            "SELECT value FROM settings WHERE tenant_id = ?1 AND key = ?2",
            rusqlite::params![tenant_id, key],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::from(other)),
        })
    }

    /// Write one flag
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set(&self, tenant_id: i64, key: &str, value: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT INTO settings (tenant_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id, key) DO UPDATE SET
                 value = excluded.value, updated_at = datetime('now')",
            rusqlite::params![tenant_id, key, value],
        )?;
        Ok(())
    }

    /// Load the typed settings view for a tenant
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn load(&self, tenant_id: i64) -> Result<Settings> {
        Ok(Settings {
            user_rating: self.flag_enabled(tenant_id, "userRating")?,
            msg_auto: self.flag_enabled(tenant_id, "msg_auto")?,
            calls: !self.flag_disabled(tenant_id, "call")?,
            ignore_groups: self.flag_enabled(tenant_id, "CheckMsgIsGroup")?,
            enable_gpt: self.flag_enabled(tenant_id, "EnableGPT")?,
            chatbot_mode: match self.get(tenant_id, "chatBotType")?.as_deref() {
                Some("button") => ChatbotMode::Button,
                Some("list") => ChatbotMode::List,
                _ => ChatbotMode::Text,
            },
            schedule_type: match self.get(tenant_id, "scheduleType")?.as_deref() {
                Some("queue") => ScheduleType::Queue,
                Some("company") => ScheduleType::Company,
                _ => ScheduleType::Disabled,
            },
        })
    }

    fn flag_enabled(&self, tenant_id: i64, key: &str) -> Result<bool> {
        Ok(self.get(tenant_id, key)?.as_deref() == Some("enabled"))
    }

    fn flag_disabled(&self, tenant_id: i64, key: &str) -> Result<bool> {
        Ok(self.get(tenant_id, key)?.as_deref() == Some("disabled"))
    }
}

/// Typed per-tenant settings consumed by the routing engine
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Ask contacts for a 1-3 rating on close
    pub user_rating: bool,
    /// Send the automated transition messages
    pub msg_auto: bool,
    /// Accept inbound calls; when false they are rejected with a notice
    pub calls: bool,
    /// Ignore group conversations entirely
    pub ignore_groups: bool,
    /// Forward prefixed prompts to the auto-responder seam
    pub enable_gpt: bool,
    /// Menu presentation mode
    pub chatbot_mode: ChatbotMode,
    /// Out-of-hours handling mode
    pub schedule_type: ScheduleType,
}
