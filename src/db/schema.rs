//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Tenant numbers: one protocol session each
        CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'uninitialized',
            credentials TEXT,
            pairing_code TEXT,
            pairing_retries INTEGER NOT NULL DEFAULT 0,
            greeting_message TEXT,
            completion_message TEXT,
            rating_message TEXT,
            out_of_hours_message TEXT,
            hours_start TEXT,
            hours_end TEXT,
            workdays TEXT NOT NULL DEFAULT '1,2,3,4,5',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Agents
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Conversation identities (direct contacts and groups)
        CREATE TABLE IF NOT EXISTS contacts (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            jid TEXT NOT NULL,
            name TEXT NOT NULL,
            avatar_url TEXT,
            is_group INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(tenant_id, jid)
        );

        CREATE INDEX IF NOT EXISTS idx_contacts_tenant ON contacts(tenant_id);

        -- Routing targets
        CREATE TABLE IF NOT EXISTS queues (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            name TEXT NOT NULL,
            greeting_message TEXT NOT NULL DEFAULT '',
            position INTEGER NOT NULL DEFAULT 0,
            hours_start TEXT,
            hours_end TEXT,
            workdays TEXT NOT NULL DEFAULT '1,2,3,4,5'
        );

        CREATE INDEX IF NOT EXISTS idx_queues_tenant ON queues(tenant_id);

        -- Chatbot sub-options of a queue
        CREATE TABLE IF NOT EXISTS queue_options (
            id INTEGER PRIMARY KEY,
            queue_id INTEGER NOT NULL REFERENCES queues(id),
            name TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            position INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_queue_options_queue ON queue_options(queue_id);

        -- Conversation episodes
        CREATE TABLE IF NOT EXISTS tickets (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            contact_id INTEGER NOT NULL REFERENCES contacts(id),
            channel TEXT NOT NULL DEFAULT 'whatsapp',
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'open', 'closed')),
            queue_id INTEGER REFERENCES queues(id),
            user_id INTEGER REFERENCES users(id),
            is_bot INTEGER NOT NULL DEFAULT 0,
            queue_option_id INTEGER,
            last_message TEXT NOT NULL DEFAULT '',
            unread_count INTEGER NOT NULL DEFAULT 0,
            is_group INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_tickets_tenant_status ON tickets(tenant_id, status);
        CREATE INDEX IF NOT EXISTS idx_tickets_contact ON tickets(tenant_id, contact_id);

        -- Messages, keyed by the external protocol id scoped to tenant.
        -- This primary key is the idempotent-ingestion boundary.
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT NOT NULL,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            ticket_id INTEGER NOT NULL REFERENCES tickets(id),
            contact_id INTEGER REFERENCES contacts(id),
            body TEXT NOT NULL,
            from_me INTEGER NOT NULL DEFAULT 0,
            read INTEGER NOT NULL DEFAULT 0,
            media_url TEXT,
            media_type TEXT,
            quoted_msg_id TEXT,
            ack INTEGER NOT NULL DEFAULT 0,
            remote_jid TEXT,
            participant TEXT,
            payload_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (tenant_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_ticket ON messages(ticket_id);

        -- Tenant-scoped key/value flags
        CREATE TABLE IF NOT EXISTS settings (
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (tenant_id, key)
        );

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Per-episode milestone tracking; a reopen starts a fresh row
        CREATE TABLE IF NOT EXISTS ticket_trackings (
            id INTEGER PRIMARY KEY,
            ticket_id INTEGER NOT NULL REFERENCES tickets(id),
            tenant_id INTEGER NOT NULL,
            user_id INTEGER,
            queued_at TEXT,
            started_at TEXT,
            rating_at TEXT,
            finished_at TEXT,
            rated INTEGER NOT NULL DEFAULT 0,
            rating INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_trackings_ticket ON ticket_trackings(ticket_id);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2 (ticket tracking)");
    Ok(())
}

fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- At most one open-or-pending ticket per contact, enforced at the
        -- database level against concurrent resolver races
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tickets_active_contact
            ON tickets(tenant_id, contact_id)
            WHERE status IN ('open', 'pending');

        PRAGMA user_version = 3;
        ",
    )?;

    tracing::info!("migrated to schema v3 (active-ticket uniqueness)");
    Ok(())
}
