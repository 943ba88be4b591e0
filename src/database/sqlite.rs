//! SQLite implementation of the Database trait
//!
//! This module provides a SQLite-based implementation of the Database trait
//! using rusqlite and tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::debug;

use super::migrations::CREATE_SCHEMA;
use super::Database;
use crate::error::DbError;
use crate::models::{JobState, NewRecord, RecordData, Scope, Stats, Status, StoredRecord};

const MEMORY_PATH: &str = ":memory:";

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    /// File databases are switched to WAL mode so readers are not blocked by
    /// a running pass.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).await?;
        let use_wal = path != MEMORY_PATH;

        conn.call(move |conn| {
            if use_wal {
                let mode: String =
                    conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
                debug!(journal_mode = %mode, "Configured journal mode");
            }
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(MEMORY_PATH).await
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    // =========================================================================
    // Record operations
    // =========================================================================

    async fn list_records(
        &self,
        collection: &str,
        scope: Scope,
    ) -> Result<Vec<StoredRecord>, DbError> {
        let collection = collection.to_string();

        self.conn
            .call(move |conn| {
                let records = match scope {
                    Scope::All => {
                        let mut stmt = conn.prepare(
                            r#"
                            SELECT id, collection, scope_year, data, created_at, updated_at
                            FROM records
                            WHERE collection = ?1
                            ORDER BY id
                            "#,
                        )?;
                        let rows = stmt
                            .query_map([&collection], row_to_record)?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    Scope::Year(year) => {
                        let mut stmt = conn.prepare(
                            r#"
                            SELECT id, collection, scope_year, data, created_at, updated_at
                            FROM records
                            WHERE collection = ?1 AND scope_year = ?2
                            ORDER BY id
                            "#,
                        )?;
                        let rows = stmt
                            .query_map(rusqlite::params![collection, year], row_to_record)?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };

                Ok(records)
            })
            .await
            .map_err(Into::into)
    }

    async fn get_record(&self, id: i64) -> Result<Option<StoredRecord>, DbError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, collection, scope_year, data, created_at, updated_at
                    FROM records
                    WHERE id = ?1
                    "#,
                )?;

                let record = stmt.query_row([id], row_to_record).optional()?;
                Ok(record)
            })
            .await
            .map_err(Into::into)
    }

    async fn create_record(&self, record: &NewRecord) -> Result<i64, DbError> {
        let collection = record.collection.clone();
        let scope_year = record.scope_year;
        let data = serde_json::to_string(&record.data)?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO records (collection, scope_year, data, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?4)
                    "#,
                    rusqlite::params![collection, scope_year, data, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Into::into)
    }

    async fn update_record(&self, id: i64, data: &RecordData) -> Result<(), DbError> {
        let data = serde_json::to_string(data)?;
        let now = Utc::now().to_rfc3339();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    "UPDATE records SET data = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![data, now, id],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn delete_record(&self, id: i64) -> Result<(), DbError> {
        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute("DELETE FROM records WHERE id = ?1", [id])?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn flush(&self) -> Result<(), DbError> {
        self.conn
            .call(|conn| {
                // Returns (busy, log frames, checkpointed frames); -1 when not in WAL mode
                let (busy, log, checkpointed): (i64, i64, i64) =
                    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?;
                debug!(busy, log, checkpointed, "WAL checkpoint");
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Run history operations
    // =========================================================================

    async fn save_run_status(&self, status: &Status) -> Result<(), DbError> {
        let job = status.job.clone();
        let state = status.state.to_string();
        let start_time = status.start_time.to_rfc3339();
        let end_time = status.end_time.map(|dt| dt.to_rfc3339());
        let year = status.year;
        let summary = status.summary;
        let error_message = status.error.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO sync_runs
                    (job, state, start_time, end_time, year,
                     created, updated, skipped, deleted, errors, error_message)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    "#,
                    rusqlite::params![
                        job,
                        state,
                        start_time,
                        end_time,
                        year,
                        summary.created as i64,
                        summary.updated as i64,
                        summary.skipped as i64,
                        summary.deleted as i64,
                        summary.errors as i64,
                        error_message
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn last_run_status(&self, job: &str) -> Result<Option<Status>, DbError> {
        let job = job.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT job, state, start_time, end_time, year,
                           created, updated, skipped, deleted, errors, error_message
                    FROM sync_runs
                    WHERE job = ?1
                    "#,
                )?;

                let status = stmt.query_row([&job], row_to_status).optional()?;
                Ok(status)
            })
            .await
            .map_err(Into::into)
    }

    async fn all_run_statuses(&self) -> Result<Vec<Status>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT job, state, start_time, end_time, year,
                           created, updated, skipped, deleted, errors, error_message
                    FROM sync_runs
                    ORDER BY job
                    "#,
                )?;

                let statuses = stmt
                    .query_map([], row_to_status)?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(statuses)
            })
            .await
            .map_err(Into::into)
    }
}

/// Map a `records` row to a StoredRecord
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
    let raw: String = row.get(3)?;
    let data: RecordData = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(StoredRecord {
        id: row.get(0)?,
        collection: row.get(1)?,
        scope_year: row.get(2)?,
        data,
        created_at: parse_datetime(row.get(4)?).unwrap_or_else(Utc::now),
        updated_at: parse_datetime(row.get(5)?).unwrap_or_else(Utc::now),
    })
}

/// Map a `sync_runs` row to a Status
fn row_to_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<Status> {
    Ok(Status {
        job: row.get(0)?,
        state: parse_job_state(row.get(1)?),
        start_time: parse_datetime(row.get(2)?).unwrap_or_else(Utc::now),
        end_time: parse_datetime(row.get(3)?),
        year: row.get(4)?,
        summary: Stats {
            created: row.get::<_, i64>(5)? as u64,
            updated: row.get::<_, i64>(6)? as u64,
            skipped: row.get::<_, i64>(7)? as u64,
            deleted: row.get::<_, i64>(8)? as u64,
            errors: row.get::<_, i64>(9)? as u64,
        },
        error: row.get(10)?,
    })
}

/// Parse a datetime string from SQLite
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

/// Parse a persisted job state
///
/// A row left behind as `running` by a crashed process reads back as failed.
fn parse_job_state(s: String) -> JobState {
    match s.parse() {
        Ok(JobState::Running) | Err(_) => JobState::Failed,
        Ok(state) => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: serde_json::Value) -> RecordData {
        value.as_object().cloned().unwrap()
    }

    // Test 1: Create in-memory database
    #[tokio::test]
    async fn test_create_in_memory_database() {
        let db = SqliteDatabase::in_memory().await;
        assert!(db.is_ok());
    }

    // Test 2: Create and retrieve a record
    #[tokio::test]
    async fn test_create_and_get_record() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        let record = NewRecord::new("persons", data(json!({"person_id": 1, "name": "Ada"})))
            .with_scope_year(Some(2024));
        let id = db.create_record(&record).await.unwrap();

        let stored = db.get_record(id).await.unwrap().unwrap();
        assert_eq!(stored.collection, "persons");
        assert_eq!(stored.scope_year, Some(2024));
        assert_eq!(stored.field("name"), Some(&json!("Ada")));
        assert_eq!(stored.created_at, stored.updated_at);
    }

    // Test 3: List honours collection and scope
    #[tokio::test]
    async fn test_list_records_by_scope() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        for (collection, year) in [
            ("persons", Some(2023)),
            ("persons", Some(2024)),
            ("persons", Some(2024)),
            ("sessions", Some(2024)),
        ] {
            db.create_record(
                &NewRecord::new(collection, data(json!({"x": 1}))).with_scope_year(year),
            )
            .await
            .unwrap();
        }

        let all = db.list_records("persons", Scope::All).await.unwrap();
        assert_eq!(all.len(), 3);

        let y2024 = db.list_records("persons", Scope::Year(2024)).await.unwrap();
        assert_eq!(y2024.len(), 2);
        assert!(y2024.iter().all(|r| r.scope_year == Some(2024)));

        let none = db.list_records("bunks", Scope::All).await.unwrap();
        assert!(none.is_empty());
    }

    // Test 4: Update overwrites the whole field map
    #[tokio::test]
    async fn test_update_record_overwrites_data() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        let id = db
            .create_record(&NewRecord::new("bunks", data(json!({"name": "A", "extra": true}))))
            .await
            .unwrap();

        db.update_record(id, &data(json!({"name": "B"})))
            .await
            .unwrap();

        let stored = db.get_record(id).await.unwrap().unwrap();
        assert_eq!(stored.data, data(json!({"name": "B"})));
    }

    // Test 5: Update and delete of a missing record report NotFound
    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        assert!(matches!(
            db.update_record(99, &RecordData::new()).await,
            Err(DbError::NotFound)
        ));
        assert!(matches!(db.delete_record(99).await, Err(DbError::NotFound)));
    }

    // Test 6: Delete removes the record
    #[tokio::test]
    async fn test_delete_record() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        let id = db
            .create_record(&NewRecord::new("bunks", RecordData::new()))
            .await
            .unwrap();
        db.delete_record(id).await.unwrap();

        assert!(db.get_record(id).await.unwrap().is_none());
    }

    // Test 7: Flush succeeds for in-memory and WAL file databases
    #[tokio::test]
    async fn test_flush() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.flush().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let db = SqliteDatabase::new(path.to_str().unwrap()).await.unwrap();
        db.create_record(&NewRecord::new("bunks", RecordData::new()))
            .await
            .unwrap();
        db.flush().await.unwrap();
    }

    // Test 8: Run status is persisted and replaced per job
    #[tokio::test]
    async fn test_run_status_persistence() {
        let db = SqliteDatabase::in_memory().await.unwrap();

        let first = Status::started("persons", Some(2024)).complete(Stats {
            created: 4,
            skipped: 2,
            ..Default::default()
        });
        db.save_run_status(&first).await.unwrap();

        let loaded = db.last_run_status("persons").await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Completed);
        assert_eq!(loaded.year, Some(2024));
        assert_eq!(loaded.summary.created, 4);
        assert_eq!(loaded.summary.skipped, 2);
        assert!(loaded.end_time.is_some());

        let second = Status::started("persons", None).fail(Stats::default(), "boom");
        db.save_run_status(&second).await.unwrap();

        let loaded = db.last_run_status("persons").await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));

        db.save_run_status(&Status::started("sessions", None).complete(Stats::default()))
            .await
            .unwrap();
        let all = db.all_run_statuses().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job, "persons");
        assert_eq!(all[1].job, "sessions");

        assert!(db.last_run_status("bunks").await.unwrap().is_none());
    }

    // Test 9: A running row left by a crash reads back as failed
    #[test]
    fn test_parse_job_state_running_becomes_failed() {
        assert_eq!(parse_job_state("running".to_string()), JobState::Failed);
        assert_eq!(parse_job_state("completed".to_string()), JobState::Completed);
        assert_eq!(parse_job_state("garbage".to_string()), JobState::Failed);
    }

    // Test 10: Both SQLite and RFC 3339 timestamps parse
    #[test]
    fn test_parse_datetime_formats() {
        assert!(parse_datetime(Some("2024-06-01T00:00:00Z".to_string())).is_some());
        assert!(parse_datetime(Some("2024-06-01 00:00:00".to_string())).is_some());
        assert!(parse_datetime(Some("yesterday".to_string())).is_none());
        assert!(parse_datetime(None).is_none());
    }
}
