//! Capability trait implemented by every entity synchronizer

use async_trait::async_trait;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::models::{Scope, Stats};

/// Per-run context handed to a synchronizer
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    /// Fires when the run should stop
    pub cancel: CancellationToken,
    /// Year the run is restricted to
    pub year: Option<i32>,
}

impl SyncContext {
    /// Context without a year restriction
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, year: None }
    }

    /// Restrict the run to a year
    pub fn with_year(mut self, year: Option<i32>) -> Self {
        self.year = year;
        self
    }

    /// Scope derived from the year restriction
    pub fn scope(&self) -> Scope {
        Scope::from_year(self.year)
    }
}

/// An entity type that can be reconciled against upstream
///
/// `stats` reports the counters of the most recent `sync` call, including
/// one that returned an error.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Job name
    fn name(&self) -> &str;

    /// Run one reconciliation pass
    async fn sync(&self, ctx: &SyncContext) -> Result<(), SyncError>;

    /// Counters of the last pass
    fn stats(&self) -> Stats;
}

/// Interior-mutable Stats holder for synchronizer implementations
#[derive(Debug, Default)]
pub struct StatsCell(Mutex<Stats>);

impl StatsCell {
    /// Zero the counters
    pub fn reset(&self) {
        self.set(Stats::default());
    }

    /// Replace the counters
    pub fn set(&self, stats: Stats) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = stats;
    }

    /// Current counters
    pub fn get(&self) -> Stats {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}
