//! Database migrations for record-sync
//!
//! This module contains SQL migrations for the SQLite database schema.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- Synchronized records, one JSON document per row
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    scope_year INTEGER,
    data TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_records_collection_year ON records(collection, scope_year);

-- Last terminal status per job
CREATE TABLE IF NOT EXISTS sync_runs (
    job TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    start_time DATETIME NOT NULL,
    end_time DATETIME,
    year INTEGER,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);
"#;

/// Get the migration version
pub fn migration_version() -> i32 {
    1
}
