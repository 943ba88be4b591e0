//! Database layer for record-sync
//!
//! This module defines the record store trait and its SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;

use crate::error::DbError;
use crate::models::{NewRecord, RecordData, Scope, Status, StoredRecord};

/// Database trait for data persistence
///
/// Covers the record operations a reconciliation pass needs plus run
/// history. It uses `async_trait` for async methods and `mockall::automock`
/// for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Database: Send + Sync {
    // =========================================================================
    // Record operations
    // =========================================================================

    /// List every record of a collection within a scope
    async fn list_records(&self, collection: &str, scope: Scope)
        -> Result<Vec<StoredRecord>, DbError>;

    /// Get a record by ID
    async fn get_record(&self, id: i64) -> Result<Option<StoredRecord>, DbError>;

    /// Insert a record
    ///
    /// Returns the ID of the inserted record
    async fn create_record(&self, record: &NewRecord) -> Result<i64, DbError>;

    /// Overwrite every field of an existing record
    async fn update_record(&self, id: i64, data: &RecordData) -> Result<(), DbError>;

    /// Delete a record by ID
    async fn delete_record(&self, id: i64) -> Result<(), DbError>;

    /// Make pending writes visible to concurrent readers
    async fn flush(&self) -> Result<(), DbError>;

    // =========================================================================
    // Run history operations
    // =========================================================================

    /// Persist the terminal status of a job run, replacing the previous one
    async fn save_run_status(&self, status: &Status) -> Result<(), DbError>;

    /// Get the last persisted status of a job
    async fn last_run_status(&self, job: &str) -> Result<Option<Status>, DbError>;

    /// Get the last persisted status of every job
    async fn all_run_statuses(&self) -> Result<Vec<Status>, DbError>;
}
