//! Sync orchestrator
//!
//! Owns the registry of synchronizers and runs them either one at a time or
//! as ordered composite plans (`daily`, `weekly`, `historical`, or any plan
//! from the configuration). All shared state lives behind a single
//! `std::sync::Mutex` that is never held across an `.await`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::database::Database;
use crate::error::{DbError, OrchestratorError};
use crate::models::{Stats, Status};
use crate::sync::synchronizer::{SyncContext, Synchronizer};

/// Daily composite sync type
pub const DAILY_SYNC: &str = "daily";
/// Weekly composite sync type
pub const WEEKLY_SYNC: &str = "weekly";
/// Historical composite sync type
pub const HISTORICAL_SYNC: &str = "historical";

#[derive(Default)]
struct OrchestratorState {
    services: HashMap<String, Arc<dyn Synchronizer>>,
    running: HashMap<String, Status>,
    completed: HashMap<String, Status>,
    running_composites: HashSet<String>,
    historical_year: Option<i32>,
}

/// Runs synchronizers and tracks their status
pub struct Orchestrator {
    state: Mutex<OrchestratorState>,
    plans: BTreeMap<String, Vec<String>>,
    job_spacing: Duration,
    history: Option<Arc<dyn Database>>,
}

impl Orchestrator {
    /// Create an orchestrator with the configured plans
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            state: Mutex::new(OrchestratorState::default()),
            plans: config.plans.clone(),
            job_spacing: config.job_spacing(),
            history: None,
        }
    }

    /// Persist every terminal status to the given store
    pub fn with_history(mut self, db: Arc<dyn Database>) -> Self {
        self.history = Some(db);
        self
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind a synchronizer to a job name, replacing any previous binding
    pub fn register_service(&self, name: impl Into<String>, service: Arc<dyn Synchronizer>) {
        let name = name.into();
        if self.lock().services.insert(name.clone(), service).is_some() {
            debug!(job = %name, "Replaced registered synchronizer");
        }
    }

    /// Ordered steps of a composite plan
    pub fn plan(&self, sync_type: &str) -> Option<&[String]> {
        self.plans.get(sync_type).map(Vec::as_slice)
    }

    /// Whether `name` is a plan or a registered job
    pub fn is_known_sync_type(&self, name: &str) -> bool {
        self.plans.contains_key(name) || self.lock().services.contains_key(name)
    }

    /// Run a composite plan or a single registered job
    ///
    /// Returns the terminal status of every job that ran, in order.
    pub async fn trigger_sync(
        &self,
        sync_type: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<Status>, OrchestratorError> {
        self.trigger_sync_for_year(sync_type, None, cancel).await
    }

    /// Run the historical plan with every step scoped to `year`
    pub async fn trigger_historical_sync(
        &self,
        year: i32,
        cancel: CancellationToken,
    ) -> Result<Vec<Status>, OrchestratorError> {
        self.trigger_sync_for_year(HISTORICAL_SYNC, Some(year), cancel)
            .await
    }

    /// Run a plan or a single job, optionally scoped to a year
    ///
    /// The historical plan fails with `YearRequired` when `year` is `None`.
    pub async fn trigger_sync_for_year(
        &self,
        sync_type: &str,
        year: Option<i32>,
        cancel: CancellationToken,
    ) -> Result<Vec<Status>, OrchestratorError> {
        if sync_type == HISTORICAL_SYNC && year.is_none() {
            return Err(OrchestratorError::YearRequired(sync_type.to_string()));
        }
        if let Some(steps) = self.plans.get(sync_type) {
            return self.run_composite(sync_type, steps, year, cancel).await;
        }

        let service = self.lock().services.get(sync_type).cloned();
        match service {
            Some(service) => {
                let status = self.run_job(sync_type, service, year, &cancel).await?;
                Ok(vec![status])
            }
            None => Err(OrchestratorError::UnknownSyncType(sync_type.to_string())),
        }
    }

    async fn run_composite(
        &self,
        sync_type: &str,
        steps: &[String],
        year: Option<i32>,
        cancel: CancellationToken,
    ) -> Result<Vec<Status>, OrchestratorError> {
        let _guard = CompositeGuard::acquire(self, sync_type, year)?;

        info!(
            sync_type = %sync_type,
            year = ?year,
            steps = steps.len(),
            "Starting composite sync"
        );

        let mut statuses = Vec::with_capacity(steps.len());
        for step in steps {
            let service = self.lock().services.get(step).cloned();
            let Some(service) = service else {
                warn!(sync_type = %sync_type, job = %step, "No synchronizer registered, skipping");
                continue;
            };

            if !statuses.is_empty() && !self.job_spacing.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(OrchestratorError::Cancelled(sync_type.to_string()));
                    }
                    _ = tokio::time::sleep(self.job_spacing) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled(sync_type.to_string()));
            }

            match self.run_job(step, service, year, &cancel).await {
                Ok(status) => statuses.push(status),
                Err(err) => {
                    warn!(sync_type = %sync_type, job = %step, error = %err, "Composite sync stopped");
                    return Err(err);
                }
            }
        }

        let mut total = Stats::default();
        for status in &statuses {
            total.merge(&status.summary);
        }
        info!(
            sync_type = %sync_type,
            jobs = statuses.len(),
            created = total.created,
            updated = total.updated,
            deleted = total.deleted,
            errors = total.errors,
            "Composite sync completed"
        );
        Ok(statuses)
    }

    async fn run_job(
        &self,
        name: &str,
        service: Arc<dyn Synchronizer>,
        year: Option<i32>,
        cancel: &CancellationToken,
    ) -> Result<Status, OrchestratorError> {
        let guard = JobGuard::acquire(self, name, year)?;
        let started = guard.started.clone();

        info!(job = %name, year = ?year, "Job started");

        let ctx = SyncContext::new(cancel.clone()).with_year(year);
        let result = service.sync(&ctx).await;
        let stats = service.stats();

        let status = match &result {
            Ok(()) => started.complete(stats),
            Err(err) => started.fail(stats, err.to_string()),
        };
        let duration_ms = status.duration().map_or(0, |d| d.num_milliseconds());

        match &result {
            Ok(()) => {
                info!(
                    job = %name,
                    duration_ms,
                    created = stats.created,
                    updated = stats.updated,
                    skipped = stats.skipped,
                    deleted = stats.deleted,
                    errors = stats.errors,
                    "Job completed"
                );
            }
            Err(err) => warn!(job = %name, duration_ms, error = %err, "Job failed"),
        }

        guard.finish(status.clone());
        self.persist(&status).await;

        match result {
            Ok(()) => Ok(status),
            Err(source) => Err(OrchestratorError::JobFailed {
                job: name.to_string(),
                source,
            }),
        }
    }

    async fn persist(&self, status: &Status) {
        if let Some(db) = &self.history {
            if let Err(e) = db.save_run_status(status).await {
                warn!(job = %status.job, error = %e, "Failed to persist run status");
            }
        }
    }

    /// Whether a job or composite with this name is running
    pub fn is_running(&self, name: &str) -> bool {
        let state = self.lock();
        state.running.contains_key(name) || state.running_composites.contains(name)
    }

    /// Current status of a job: the running entry, or the last terminal one
    pub fn get_status(&self, name: &str) -> Option<Status> {
        let state = self.lock();
        state
            .running
            .get(name)
            .or_else(|| state.completed.get(name))
            .cloned()
    }

    /// Names of running jobs, sorted
    pub fn get_running_jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = self.lock().running.keys().cloned().collect();
        jobs.sort();
        jobs
    }

    /// Latest status of every known job, sorted by job name
    pub fn get_all_statuses(&self) -> Vec<Status> {
        let state = self.lock();
        let mut merged: BTreeMap<&str, &Status> = state
            .completed
            .iter()
            .map(|(name, status)| (name.as_str(), status))
            .collect();
        for (name, status) in &state.running {
            merged.insert(name.as_str(), status);
        }
        merged.into_values().cloned().collect()
    }

    /// Whether a composite plan is running
    pub fn is_composite_running(&self, sync_type: &str) -> bool {
        self.lock().running_composites.contains(sync_type)
    }

    /// Whether the daily plan is running
    pub fn is_daily_sync_running(&self) -> bool {
        self.is_composite_running(DAILY_SYNC)
    }

    /// Whether the historical plan is running
    pub fn is_historical_sync_running(&self) -> bool {
        self.is_composite_running(HISTORICAL_SYNC)
    }

    /// Year of the running historical plan
    pub fn get_historical_sync_year(&self) -> Option<i32> {
        self.lock().historical_year
    }

    /// Seed the last-status map with previously persisted statuses
    ///
    /// Jobs that already have a status in memory are left alone.
    pub fn restore_history(&self, statuses: Vec<Status>) -> usize {
        let mut state = self.lock();
        let mut restored = 0;
        for status in statuses {
            if !state.completed.contains_key(&status.job) {
                state.completed.insert(status.job.clone(), status);
                restored += 1;
            }
        }
        restored
    }

    /// Load persisted statuses from the history store
    pub async fn load_history(&self) -> Result<usize, DbError> {
        let Some(db) = &self.history else {
            return Ok(0);
        };
        let statuses = db.all_run_statuses().await?;
        let restored = self.restore_history(statuses);
        debug!(restored, "Restored run history");
        Ok(restored)
    }
}

/// Marks a composite as running until dropped
struct CompositeGuard<'a> {
    orchestrator: &'a Orchestrator,
    sync_type: String,
}

impl<'a> CompositeGuard<'a> {
    fn acquire(
        orchestrator: &'a Orchestrator,
        sync_type: &str,
        year: Option<i32>,
    ) -> Result<Self, OrchestratorError> {
        let mut state = orchestrator.lock();

        if state.running_composites.contains(sync_type) {
            return Err(OrchestratorError::AlreadyRunning(sync_type.to_string()));
        }

        let exclusive = match sync_type {
            DAILY_SYNC => Some(HISTORICAL_SYNC),
            HISTORICAL_SYNC => Some(DAILY_SYNC),
            _ => None,
        };
        if let Some(other) = exclusive {
            if state.running_composites.contains(other) {
                return Err(OrchestratorError::CompositeConflict {
                    requested: sync_type.to_string(),
                    running: other.to_string(),
                });
            }
        }

        state.running_composites.insert(sync_type.to_string());
        if sync_type == HISTORICAL_SYNC {
            state.historical_year = year;
        }

        Ok(Self {
            orchestrator,
            sync_type: sync_type.to_string(),
        })
    }
}

impl Drop for CompositeGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.orchestrator.lock();
        state.running_composites.remove(&self.sync_type);
        if self.sync_type == HISTORICAL_SYNC {
            state.historical_year = None;
        }
    }
}

/// Holds a job's running entry
///
/// Dropping the guard without `finish` (the run future was dropped) records
/// the job as failed.
struct JobGuard<'a> {
    orchestrator: &'a Orchestrator,
    started: Status,
    finished: bool,
}

impl<'a> JobGuard<'a> {
    fn acquire(
        orchestrator: &'a Orchestrator,
        name: &str,
        year: Option<i32>,
    ) -> Result<Self, OrchestratorError> {
        let mut state = orchestrator.lock();
        if state.running.contains_key(name) {
            return Err(OrchestratorError::AlreadyRunning(name.to_string()));
        }

        let started = Status::started(name, year);
        state.running.insert(name.to_string(), started.clone());

        Ok(Self {
            orchestrator,
            started,
            finished: false,
        })
    }

    fn finish(mut self, status: Status) {
        let mut state = self.orchestrator.lock();
        state.running.remove(&status.job);
        state.completed.insert(status.job.clone(), status);
        self.finished = true;
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.orchestrator.lock();
        if let Some(running) = state.running.remove(&self.started.job) {
            warn!(job = %running.job, "Job interrupted");
            let failed = running.fail(Default::default(), "interrupted");
            state.completed.insert(failed.job.clone(), failed);
        }
    }
}
