//! Record-related domain models
//!
//! This module defines the records held in the local store and the scope a
//! reconciliation pass covers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field map of a stored record
pub type RecordData = serde_json::Map<String, serde_json::Value>;

/// Record as persisted in the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Store-assigned identifier
    pub id: i64,

    /// Collection (entity type) the record belongs to
    pub collection: String,

    /// Year the record is scoped to, if the entity is year-scoped
    pub scope_year: Option<i32>,

    /// Record fields
    pub data: RecordData,

    /// When the record was first written
    pub created_at: DateTime<Utc>,

    /// When the record was last overwritten
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    /// Look up a single field
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name)
    }
}

/// Record to be inserted into the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    /// Target collection
    pub collection: String,

    /// Scope year, if any
    pub scope_year: Option<i32>,

    /// Record fields
    pub data: RecordData,
}

impl NewRecord {
    /// Create a new record for a collection
    pub fn new(collection: impl Into<String>, data: RecordData) -> Self {
        Self {
            collection: collection.into(),
            scope_year: None,
            data,
        }
    }

    /// Set the scope year
    pub fn with_scope_year(mut self, year: Option<i32>) -> Self {
        self.scope_year = year;
        self
    }
}

/// Subset of a collection that a pass reads and may delete from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Every record in the collection
    #[default]
    All,
    /// Only records tagged with the given year
    Year(i32),
}

impl Scope {
    /// Build a scope from an optional year
    pub fn from_year(year: Option<i32>) -> Self {
        match year {
            Some(y) => Scope::Year(y),
            None => Scope::All,
        }
    }

    /// The year this scope is restricted to
    pub fn year(&self) -> Option<i32> {
        match self {
            Scope::All => None,
            Scope::Year(y) => Some(*y),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::Year(y) => write!(f, "year {}", y),
        }
    }
}
