use anyhow::Result;
use rusqlite::Connection;

/// Apply connection pragmas.
///
/// WAL with `synchronous=FULL` makes a committed append durable before the
/// call returns.
///
/// # Errors
///
/// Returns an error if a pragma cannot be applied
pub fn configure_connection(conn: &Connection) -> Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::debug!("SQLite journal mode: {mode}");
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Initialize database schema
///
/// # Errors
///
/// Returns an error if database table creation or index creation fails
#[allow(clippy::too_many_lines)]
pub fn init_schema(conn: &Connection) -> Result<()> {
    // Outbox - one row per event, partitioned by payload type
    conn.execute(
        "CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            partition TEXT NOT NULL,
            device_id TEXT NOT NULL,
            session_id TEXT,
            idempotency_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            next_attempt_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            acked_at TEXT,
            UNIQUE(device_id, partition, idempotency_key)
        )",
        [],
    )?;

    // Per-device sequence counter shared by attention and enforcement events
    conn.execute(
        "CREATE TABLE IF NOT EXISTS device_sequences (
            device_id TEXT PRIMARY KEY,
            last_sequence INTEGER NOT NULL
        )",
        [],
    )?;

    // Gaps left in the device sequence by overflow drops
    conn.execute(
        "CREATE TABLE IF NOT EXISTS outbox_gaps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            partition TEXT NOT NULL,
            sequence_number INTEGER,
            idempotency_key TEXT NOT NULL,
            dropped_at TEXT NOT NULL
        )",
        [],
    )?;

    // Rows that failed to decode, kept for inspection
    conn.execute(
        "CREATE TABLE IF NOT EXISTS outbox_quarantine (
            id INTEGER PRIMARY KEY,
            partition TEXT NOT NULL,
            raw_payload TEXT,
            quarantined_at TEXT NOT NULL,
            error TEXT NOT NULL
        )",
        [],
    )?;

    // Sessions - history of classroom sessions joined by this device
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            owner_role TEXT NOT NULL,
            state TEXT NOT NULL,
            started_at TEXT NOT NULL,
            device_id TEXT NOT NULL,
            ended_at TEXT,
            finalize_confirmed INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // Controller snapshot - single row
    conn.execute(
        "CREATE TABLE IF NOT EXISTS controller_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            state TEXT NOT NULL,
            session_id TEXT,
            sync_degraded INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Push commands already applied, for redelivery dedup
    conn.execute(
        "CREATE TABLE IF NOT EXISTS seen_commands (
            command_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            command TEXT NOT NULL,
            received_at TEXT NOT NULL
        )",
        [],
    )?;

    // Key/value counters (drop counter)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )",
        [],
    )?;

    // Add new columns to existing tables if they don't exist
    let columns_to_add = vec![("sessions", "finalize_confirmed", "INTEGER NOT NULL DEFAULT 0")];

    for (table, column_name, column_type) in columns_to_add {
        let column_exists: Result<i32, rusqlite::Error> = conn.query_row(
            &format!("SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name='{column_name}'"),
            [],
            |row| row.get(0),
        );

        if column_exists.unwrap_or(0) == 0 {
            conn.execute(
                &format!("ALTER TABLE {table} ADD COLUMN {column_name} {column_type}"),
                [],
            )?;
            log::info!("Added {column_name} column to {table} table");
        }
    }

    // At most one live session per device
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_live
         ON sessions(device_id) WHERE state IN ('joining', 'active', 'paused')",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outbox_partition_state ON outbox(partition, state, id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outbox_acked_at ON outbox(acked_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_seen_commands_received ON seen_commands(received_at)",
        [],
    )?;

    Ok(())
}
