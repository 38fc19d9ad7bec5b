use anyhow::Result;
use rusqlite::Connection;

/// Runs all schema creation for the configuration database.
pub fn run_all(conn: &Connection) -> Result<()> {
    create_tables(conn)?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            application_type TEXT NOT NULL,
            hostname TEXT NOT NULL,
            domain TEXT NOT NULL,
            alt_names TEXT NOT NULL DEFAULT '',
            username TEXT,
            password TEXT,
            ssl_provider TEXT NOT NULL DEFAULT 'acme_primary',
            dns_provider TEXT NOT NULL DEFAULT 'custom',
            custom_csr TEXT,
            enable_ssh INTEGER NOT NULL DEFAULT 0,
            auto_restart_service INTEGER NOT NULL DEFAULT 0,
            last_cert_issued TEXT,
            cert_count_this_week INTEGER NOT NULL DEFAULT 0,
            cert_count_reset_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            provider TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (provider, key)
        );

        CREATE TABLE IF NOT EXISTS renewal_status (
            id TEXT PRIMARY KEY,
            connection_id INTEGER NOT NULL,
            state TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            error TEXT,
            start_time TEXT NOT NULL,
            end_time TEXT,
            logs TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_renewal_status_connection
            ON renewal_status (connection_id, state);
        "#,
    )?;
    Ok(())
}
