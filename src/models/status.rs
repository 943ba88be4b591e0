//! Run status models
//!
//! `Stats` are the per-pass counters a synchronizer reports, `Status` is the
//! orchestrator's view of one job run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters produced by one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Records inserted
    pub created: u64,

    /// Records overwritten because a comparable field changed
    pub updated: u64,

    /// Records left untouched because nothing changed
    pub skipped: u64,

    /// Orphans removed
    pub deleted: u64,

    /// Item-level failures
    pub errors: u64,
}

impl Stats {
    /// Number of store writes the counters account for
    pub fn total_written(&self) -> u64 {
        self.created + self.updated + self.deleted
    }

    /// Add another set of counters into this one
    pub fn merge(&mut self, other: &Stats) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
        self.errors += other.errors;
    }
}

/// State of a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is currently running
    Running,
    /// Job finished successfully
    Completed,
    /// Job returned an error
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// Status of one job run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Job name
    pub job: String,

    /// Current state
    pub state: JobState,

    /// When the run started
    pub start_time: DateTime<Utc>,

    /// When the run reached a terminal state
    pub end_time: Option<DateTime<Utc>>,

    /// Counters reported by the synchronizer
    pub summary: Stats,

    /// Year the run was scoped to
    pub year: Option<i32>,

    /// Error message if the run failed
    pub error: Option<String>,
}

impl Status {
    /// Create a running status starting now
    pub fn started(job: impl Into<String>, year: Option<i32>) -> Self {
        Self {
            job: job.into(),
            state: JobState::Running,
            start_time: Utc::now(),
            end_time: None,
            summary: Stats::default(),
            year,
            error: None,
        }
    }

    /// Mark as completed
    pub fn complete(mut self, summary: Stats) -> Self {
        self.state = JobState::Completed;
        self.end_time = Some(Utc::now());
        self.summary = summary;
        self.error = None;
        self
    }

    /// Mark as failed
    pub fn fail(mut self, summary: Stats, error: impl Into<String>) -> Self {
        self.state = JobState::Failed;
        self.end_time = Some(Utc::now());
        self.summary = summary;
        self.error = Some(error.into());
        self
    }

    /// Whether the run has finished
    pub fn is_terminal(&self) -> bool {
        self.state != JobState::Running
    }

    /// Wall-clock duration of a finished run
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}
