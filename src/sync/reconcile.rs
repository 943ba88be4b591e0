//! Reconciliation protocol shared by every entity synchronizer
//!
//! One pass over a collection runs:
//!
//! 1. preload: one bulk read of the stored records in scope, indexed by natural key
//! 2. fetch and transform: page through upstream, one item at a time
//! 3. upsert: create unknown keys, update records whose comparable fields changed
//! 4. orphan delete: remove stored keys not seen upstream, only after a clean fetch
//! 5. flush: checkpoint the store when anything was written
//!
//! Item-level failures are counted in `Stats::errors` and never abort the pass.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::{DbError, SyncError, TransformError};
use crate::models::{NewRecord, RecordData, Scope, Stats, StoredRecord};
use crate::sync::compare::FieldComparator;

/// Deterministic identifier of one logical entity within a pass
///
/// Parts are joined with `|`; `\` and `|` inside a part are escaped so that
/// distinct part lists never produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Build a key from its parts
    pub fn compose<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let escaped: Vec<String> = parts
            .into_iter()
            .map(|part| part.as_ref().replace('\\', "\\\\").replace('|', "\\|"))
            .collect();
        NaturalKey(escaped.join("|"))
    }

    /// The joined key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A field taking part in the upsert decision
#[derive(Debug, Clone, PartialEq)]
pub struct ComparableField {
    /// Field name in the record data
    pub name: String,
    /// How the stored and incoming values are compared
    pub comparator: FieldComparator,
}

impl ComparableField {
    /// Create a comparable field
    pub fn new(name: impl Into<String>, comparator: FieldComparator) -> Self {
        Self {
            name: name.into(),
            comparator,
        }
    }
}

/// What to do when one pass sees the same natural key twice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKeyPolicy {
    /// Log a warning and diff the later item against what the earlier one wrote
    #[default]
    LastWriteWins,
    /// Count the later item as an error and skip it
    Reject,
}

/// Settings of one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOptions {
    /// Store collection
    pub collection: String,
    /// Part of the collection read and possibly deleted from
    pub scope: Scope,
    /// Fields compared for the upsert decision; empty compares every field exactly
    pub comparable: Vec<ComparableField>,
    /// Duplicate key handling
    pub duplicate_policy: DuplicateKeyPolicy,
}

impl ReconcileOptions {
    /// Options for a whole collection with exact comparison of every field
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            scope: Scope::All,
            comparable: Vec::new(),
            duplicate_policy: DuplicateKeyPolicy::default(),
        }
    }

    /// Set the scope
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the comparable fields
    pub fn with_comparable(mut self, comparable: Vec<ComparableField>) -> Self {
        self.comparable = comparable;
        self
    }

    /// Set the duplicate key policy
    pub fn with_duplicate_policy(mut self, policy: DuplicateKeyPolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }
}

/// Result of a single upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New record inserted
    Created,
    /// Existing record overwritten
    Updated,
    /// Existing record unchanged
    Skipped,
    /// Duplicate key rejected by policy
    Rejected,
    /// Item-level write failure
    Failed,
}

/// Counters and final result of a pass
///
/// Stats are reported even when the pass aborted, covering the work done
/// before the abort.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    /// Counters
    pub stats: Stats,
    /// Pass-level result
    pub result: Result<(), SyncError>,
}

impl PassOutcome {
    /// Collapse into the counters or the pass-level error
    pub fn into_result(self) -> Result<Stats, SyncError> {
        self.result.map(|()| self.stats)
    }
}

/// Paged source of raw upstream items
#[async_trait]
pub trait ItemSource: Send {
    /// Fetch the next page; `None` once the source is exhausted
    async fn next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Value>>, SyncError>;
}

/// Entity-specific mapping from raw items to records
pub trait RecordTransform: Send + Sync {
    /// Map one raw upstream item to record data
    fn transform(&self, item: &Value) -> Result<RecordData, TransformError>;

    /// Natural key of record data belonging to the given scope year
    fn natural_key(&self, data: &RecordData, year: Option<i32>)
        -> Result<NaturalKey, TransformError>;
}

/// State of one in-progress pass
pub struct ReconcilePass<'a> {
    db: &'a dyn Database,
    options: &'a ReconcileOptions,
    existing: HashMap<NaturalKey, StoredRecord>,
    stale: Vec<i64>,
    processed: HashSet<NaturalKey>,
    stats: Stats,
}

impl<'a> ReconcilePass<'a> {
    /// Bulk-read the stored records in scope and index them by key
    ///
    /// Stored records `key_of` returns `None` for, and every stored record
    /// after the first sharing a key, are deleted with the orphans.
    pub async fn preload<F>(
        db: &'a dyn Database,
        options: &'a ReconcileOptions,
        key_of: F,
    ) -> Result<ReconcilePass<'a>, SyncError>
    where
        F: Fn(&StoredRecord) -> Option<NaturalKey>,
    {
        let records = db.list_records(&options.collection, options.scope).await?;
        let loaded = records.len();

        let mut existing = HashMap::with_capacity(loaded);
        let mut stale = Vec::new();
        let mut unkeyed = 0usize;

        for record in records {
            let Some(key) = key_of(&record) else {
                unkeyed += 1;
                stale.push(record.id);
                continue;
            };
            match existing.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(slot) => {
                    warn!(
                        collection = %options.collection,
                        key = %slot.key(),
                        id = record.id,
                        "Duplicate stored record, scheduling removal"
                    );
                    stale.push(record.id);
                }
            }
        }

        debug!(
            collection = %options.collection,
            scope = %options.scope,
            loaded,
            unkeyed,
            "Preloaded existing records"
        );

        Ok(Self {
            db,
            options,
            existing,
            stale,
            processed: HashSet::new(),
            stats: Stats::default(),
        })
    }

    /// Counters so far
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Count an item-level failure that happened before the upsert
    pub fn record_error(&mut self) {
        self.stats.errors += 1;
    }

    /// Create, update or skip one record
    ///
    /// Only a lost store connection is returned as an error; any other write
    /// failure is counted and the pass continues.
    pub async fn upsert(
        &mut self,
        key: NaturalKey,
        data: RecordData,
    ) -> Result<UpsertOutcome, SyncError> {
        if !self.processed.insert(key.clone()) {
            match self.options.duplicate_policy {
                DuplicateKeyPolicy::Reject => {
                    warn!(
                        collection = %self.options.collection,
                        key = %key,
                        "Duplicate key in upstream data, item rejected"
                    );
                    self.stats.errors += 1;
                    return Ok(UpsertOutcome::Rejected);
                }
                DuplicateKeyPolicy::LastWriteWins => {
                    warn!(
                        collection = %self.options.collection,
                        key = %key,
                        "Duplicate key in upstream data, last item wins"
                    );
                }
            }
        }

        match self.existing.get_mut(&key) {
            None => {
                let record = NewRecord::new(self.options.collection.clone(), data)
                    .with_scope_year(self.options.scope.year());

                match self.db.create_record(&record).await {
                    Ok(id) => {
                        self.stats.created += 1;
                        let now = Utc::now();
                        self.existing.insert(
                            key,
                            StoredRecord {
                                id,
                                collection: record.collection,
                                scope_year: record.scope_year,
                                data: record.data,
                                created_at: now,
                                updated_at: now,
                            },
                        );
                        Ok(UpsertOutcome::Created)
                    }
                    Err(err) => item_failure(&mut self.stats, &key, err),
                }
            }
            Some(stored) => {
                if !fields_differ(&self.options.comparable, &stored.data, &data) {
                    self.stats.skipped += 1;
                    return Ok(UpsertOutcome::Skipped);
                }

                match self.db.update_record(stored.id, &data).await {
                    Ok(()) => {
                        self.stats.updated += 1;
                        stored.data = data;
                        stored.updated_at = Utc::now();
                        Ok(UpsertOutcome::Updated)
                    }
                    Err(err) => item_failure(&mut self.stats, &key, err),
                }
            }
        }
    }

    /// Delete stored records whose key was not observed in this pass
    pub async fn delete_orphans(&mut self) -> Result<(), SyncError> {
        let mut doomed: Vec<i64> = self
            .existing
            .iter()
            .filter(|(key, _)| !self.processed.contains(*key))
            .map(|(_, record)| record.id)
            .collect();
        doomed.append(&mut self.stale);
        doomed.sort_unstable();

        for id in doomed {
            match self.db.delete_record(id).await {
                Ok(()) => self.stats.deleted += 1,
                Err(DbError::NotFound) => {
                    debug!(collection = %self.options.collection, id, "Orphan already gone");
                }
                Err(err) if err.is_connection_lost() => return Err(err.into()),
                Err(err) => {
                    warn!(
                        collection = %self.options.collection,
                        id,
                        error = %err,
                        "Failed to delete orphan"
                    );
                    self.stats.errors += 1;
                }
            }
        }

        self.existing.retain(|key, _| self.processed.contains(key));
        Ok(())
    }

    /// Process pages until the source is exhausted
    ///
    /// Cancellation is checked once per page.
    pub async fn consume<S, T>(
        &mut self,
        source: &mut S,
        transform: &T,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>
    where
        S: ItemSource + ?Sized,
        T: RecordTransform + ?Sized,
    {
        let year = self.options.scope.year();
        let mut pages = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let Some(items) = source.next_page(cancel).await? else {
                break;
            };
            pages += 1;

            debug!(
                collection = %self.options.collection,
                page = pages,
                items = items.len(),
                "Processing page"
            );

            for item in &items {
                let data = match transform.transform(item) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(collection = %self.options.collection, error = %err, "Skipping item");
                        self.record_error();
                        continue;
                    }
                };
                let key = match transform.natural_key(&data, year) {
                    Ok(key) => key,
                    Err(err) => {
                        warn!(collection = %self.options.collection, error = %err, "Skipping item");
                        self.record_error();
                        continue;
                    }
                };
                self.upsert(key, data).await?;
            }
        }

        Ok(())
    }

    /// Delete orphans if the fetch succeeded, then flush if anything was written
    pub async fn finish(mut self, fetch_result: Result<(), SyncError>) -> PassOutcome {
        let mut result = fetch_result;

        if result.is_ok() {
            result = self.delete_orphans().await;
        } else if let Err(err) = &result {
            warn!(
                collection = %self.options.collection,
                error = %err,
                "Pass aborted, skipping orphan deletion"
            );
        }

        if self.stats.total_written() > 0 {
            if let Err(err) = self.db.flush().await {
                warn!(collection = %self.options.collection, error = %err, "Flush failed");
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }

        PassOutcome {
            stats: self.stats,
            result,
        }
    }
}

/// Count a write failure, unless the store is gone altogether
fn item_failure(
    stats: &mut Stats,
    key: &NaturalKey,
    err: DbError,
) -> Result<UpsertOutcome, SyncError> {
    if err.is_connection_lost() {
        return Err(err.into());
    }
    warn!(key = %key, error = %err, "Failed to write record");
    stats.errors += 1;
    Ok(UpsertOutcome::Failed)
}

/// Whether any comparable field differs between stored and incoming data
pub fn fields_differ(
    comparable: &[ComparableField],
    stored: &RecordData,
    incoming: &RecordData,
) -> bool {
    if comparable.is_empty() {
        return stored
            .keys()
            .chain(incoming.keys())
            .any(|name| !FieldComparator::Exact.equals(stored.get(name), incoming.get(name)));
    }

    comparable.iter().any(|field| {
        !field
            .comparator
            .equals(stored.get(&field.name), incoming.get(&field.name))
    })
}

/// Runs complete passes for one collection
pub struct Reconciler {
    db: Arc<dyn Database>,
    options: ReconcileOptions,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(db: Arc<dyn Database>, options: ReconcileOptions) -> Self {
        Self { db, options }
    }

    /// Run one full pass
    pub async fn run<S, T>(
        &self,
        source: &mut S,
        transform: &T,
        cancel: &CancellationToken,
    ) -> PassOutcome
    where
        S: ItemSource + ?Sized,
        T: RecordTransform + ?Sized,
    {
        let preload = ReconcilePass::preload(self.db.as_ref(), &self.options, |record| {
            transform.natural_key(&record.data, record.scope_year).ok()
        })
        .await;

        let mut pass = match preload {
            Ok(pass) => pass,
            Err(err) => {
                warn!(collection = %self.options.collection, error = %err, "Preload failed");
                return PassOutcome {
                    stats: Stats::default(),
                    result: Err(err),
                };
            }
        };

        let fetch_result = pass.consume(source, transform, cancel).await;
        let outcome = pass.finish(fetch_result).await;

        info!(
            collection = %self.options.collection,
            scope = %self.options.scope,
            created = outcome.stats.created,
            updated = outcome.stats.updated,
            skipped = outcome.stats.skipped,
            deleted = outcome.stats.deleted,
            errors = outcome.stats.errors,
            ok = outcome.result.is_ok(),
            "Reconciliation pass finished"
        );

        outcome
    }
}
