//! Domain models for record-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod record;
pub mod status;

// Re-export commonly used types
pub use record::{NewRecord, RecordData, Scope, StoredRecord};
pub use status::{JobState, Stats, Status};
