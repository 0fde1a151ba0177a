use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every ~400KB instead of the default ~4MB
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // In-memory and fresh databases legitimately fail this.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::debug!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS geoids (
            id         TEXT PRIMARY KEY,
            seq        INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT '',
            data       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scars (
            id           TEXT PRIMARY KEY,
            vault        TEXT NOT NULL CHECK (vault IN ('A', 'B')),
            seq          INTEGER NOT NULL,
            origin_vault TEXT NOT NULL,
            quarantined  INTEGER NOT NULL DEFAULT 0,
            priority     REAL NOT NULL,
            created_at   TEXT NOT NULL DEFAULT '',
            data         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS overflow (
            seq        INTEGER PRIMARY KEY AUTOINCREMENT,
            id         TEXT NOT NULL UNIQUE,
            from_vault TEXT NOT NULL,
            evicted_at TEXT NOT NULL DEFAULT (datetime('now')),
            data       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_scars_vault_seq ON scars(vault, seq);
        CREATE INDEX IF NOT EXISTS idx_geoids_seq ON geoids(seq);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
