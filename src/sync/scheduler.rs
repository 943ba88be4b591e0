//! Periodic sync scheduler
//!
//! Triggers configured sync types on the orchestrator at fixed intervals.
//! Each schedule entry runs in its own task; a random jitter is added to
//! every tick so that co-scheduled plans do not start in lockstep.

use crate::config::{ScheduleEntry, SchedulerConfig};
use crate::error::OrchestratorError;
use crate::sync::orchestrator::Orchestrator;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduler driving periodic composite syncs
pub struct SyncScheduler {
    config: SchedulerConfig,
    orchestrator: Arc<Orchestrator>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl SyncScheduler {
    /// Create a new sync scheduler
    ///
    /// # Arguments
    ///
    /// * `config` - Scheduler configuration
    /// * `orchestrator` - Orchestrator the schedules trigger
    /// * `shutdown_rx` - Broadcast receiver for shutdown signal
    pub fn new(
        config: SchedulerConfig,
        orchestrator: Arc<Orchestrator>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            shutdown_rx,
        }
    }

    /// Run until the shutdown signal arrives
    ///
    /// In-flight runs are cancelled on shutdown and awaited before returning.
    pub async fn run(mut self) {
        info!(
            schedules = self.config.schedules.len(),
            "Starting sync scheduler"
        );

        if self.config.initial_delay_secs > 0 {
            debug!(
                delay_secs = self.config.initial_delay_secs,
                "Waiting for initial delay"
            );
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received before first tick");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(self.config.initial_delay_secs)) => {}
            }
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(self.config.schedules.len());
        for entry in &self.config.schedules {
            if !self.orchestrator.is_known_sync_type(&entry.sync_type) {
                warn!(sync_type = %entry.sync_type, "Scheduled sync type is unknown");
            }
            handles.push(tokio::spawn(Self::run_schedule(
                entry.clone(),
                self.orchestrator.clone(),
                self.config.jitter_secs,
                cancel.clone(),
            )));
        }

        let _ = self.shutdown_rx.recv().await;
        info!("Shutdown signal received, stopping sync scheduler");
        cancel.cancel();

        for handle in handles {
            let _ = handle.await;
        }

        info!("Sync scheduler stopped");
    }

    async fn run_schedule(
        entry: ScheduleEntry,
        orchestrator: Arc<Orchestrator>,
        jitter_secs: u64,
        cancel: CancellationToken,
    ) {
        let interval = Duration::from_secs(entry.interval_secs.max(1));

        if entry.run_on_start {
            info!(sync_type = %entry.sync_type, "Performing initial sync");
            Self::trigger(&entry.sync_type, &orchestrator, &cancel).await;
        }

        let mut timer = interval_at(Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            sync_type = %entry.sync_type,
            interval_secs = interval.as_secs(),
            "Scheduled periodic sync"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(sync_type = %entry.sync_type, "Schedule task shutting down");
                    break;
                }
                _ = timer.tick() => {
                    let jitter = jitter(jitter_secs);
                    if !jitter.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(jitter) => {}
                        }
                    }

                    info!(sync_type = %entry.sync_type, "Performing scheduled sync");
                    Self::trigger(&entry.sync_type, &orchestrator, &cancel).await;
                }
            }
        }
    }

    /// Trigger one run; returns whether it was started
    async fn trigger(
        sync_type: &str,
        orchestrator: &Orchestrator,
        cancel: &CancellationToken,
    ) -> bool {
        if orchestrator.is_running(sync_type) {
            info!(sync_type = %sync_type, "Sync still running, skipping tick");
            return false;
        }

        match orchestrator
            .trigger_sync(sync_type, cancel.child_token())
            .await
        {
            Ok(statuses) => {
                info!(sync_type = %sync_type, jobs = statuses.len(), "Scheduled sync completed");
                true
            }
            Err(err @ OrchestratorError::AlreadyRunning(_))
            | Err(err @ OrchestratorError::CompositeConflict { .. }) => {
                info!(sync_type = %sync_type, reason = %err, "Skipping scheduled sync");
                false
            }
            Err(err) => {
                warn!(sync_type = %sync_type, error = %err, "Scheduled sync failed");
                true
            }
        }
    }
}

fn jitter(max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rand::thread_rng().gen_range(0..max_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::error::SyncError;
    use crate::models::{JobState, Stats};
    use crate::sync::synchronizer::{SyncContext, Synchronizer};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Synchronizer counting its invocations
    #[derive(Default)]
    struct CountingSync {
        count: Arc<AtomicU32>,
        gate: Option<Arc<Notify>>,
        wait_for_cancel: bool,
    }

    #[async_trait]
    impl Synchronizer for CountingSync {
        fn name(&self) -> &str {
            "a"
        }

        async fn sync(&self, ctx: &SyncContext) -> Result<(), SyncError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.wait_for_cancel {
                ctx.cancel.cancelled().await;
                return Err(SyncError::Cancelled);
            }
            Ok(())
        }

        fn stats(&self) -> Stats {
            Stats::default()
        }
    }

    fn orchestrator(sync: CountingSync) -> Arc<Orchestrator> {
        let mut plans = BTreeMap::new();
        plans.insert("daily".to_string(), vec!["a".to_string()]);
        let orch = Orchestrator::new(&OrchestratorConfig {
            job_spacing_ms: 0,
            plans,
        });
        orch.register_service("a", Arc::new(sync));
        Arc::new(orch)
    }

    fn config(interval_secs: u64, run_on_start: bool, initial_delay_secs: u64) -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            initial_delay_secs,
            jitter_secs: 0,
            schedules: vec![ScheduleEntry {
                sync_type: "daily".to_string(),
                interval_secs,
                run_on_start,
            }],
        }
    }

    // Test 1: run_on_start triggers immediately
    #[tokio::test(start_paused = true)]
    async fn test_run_on_start() {
        let sync = CountingSync::default();
        let count = sync.count.clone();
        let orch = orchestrator(sync);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(SyncScheduler::new(config(3600, true, 0), orch, shutdown_rx).run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    // Test 2: Scheduler respects the interval
    #[tokio::test(start_paused = true)]
    async fn test_sync_interval() {
        let sync = CountingSync::default();
        let count = sync.count.clone();
        let orch = orchestrator(sync);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(SyncScheduler::new(config(100, false, 0), orch, shutdown_rx).run());

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    // Test 3: Ticks are skipped while the previous run is still going
    #[tokio::test(start_paused = true)]
    async fn test_skip_tick_while_running() {
        let gate = Arc::new(Notify::new());
        let sync = CountingSync {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let count = sync.count.clone();
        let orch = orchestrator(sync);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(
            SyncScheduler::new(config(100, true, 0), orch.clone(), shutdown_rx).run(),
        );

        tokio::time::sleep(Duration::from_secs(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(orch.is_daily_sync_running());

        gate.notify_one();
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(!orch.is_daily_sync_running());
    }

    // Test 4: Shutdown cancels in-flight runs
    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_running_sync() {
        let sync = CountingSync {
            wait_for_cancel: true,
            ..Default::default()
        };
        let orch = orchestrator(sync);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(
            SyncScheduler::new(config(3600, true, 0), orch.clone(), shutdown_rx).run(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(orch.is_running("a"));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        let status = orch.get_status("a").unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error.as_deref(), Some("Sync cancelled"));
    }

    // Test 5: Initial delay postpones the first run
    #[tokio::test(start_paused = true)]
    async fn test_initial_delay() {
        let sync = CountingSync::default();
        let count = sync.count.clone();
        let orch = orchestrator(sync);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(SyncScheduler::new(config(3600, true, 10), orch, shutdown_rx).run());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    // Test 6: Shutdown during the initial delay returns without running
    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_initial_delay() {
        let sync = CountingSync::default();
        let count = sync.count.clone();
        let orch = orchestrator(sync);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(SyncScheduler::new(config(3600, true, 60), orch, shutdown_rx).run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(jitter(0), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(5) < Duration::from_secs(5));
        }
    }
}
