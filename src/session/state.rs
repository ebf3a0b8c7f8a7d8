//! Persisted session record

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::plan::ResolvedPlan;
use crate::resource::ResourceMap;
use crate::units::JobUnit;

/// Current session record schema version
pub const SESSION_VERSION: u32 = 1;

/// Result of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Pending,
    Running,
    Passed,
    Failed,
    Crashed,
    Skipped,
    NotSupported,
}

impl Outcome {
    /// Whether the job is done with
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the outcome counts against the session
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Crashed | Self::NotSupported)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
            Self::Skipped => "skipped",
            Self::NotSupported => "not-supported",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Suspended,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Whether an operator is present to answer verdict prompts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Interactive,
    Automatic,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::Automatic => write!(f, "automatic"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(Self::Interactive),
            "automatic" => Ok(Self::Automatic),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

/// Per-job bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub outcome: Outcome,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Captured output of the last attempt
    pub io_log: Option<PathBuf>,
    pub return_code: Option<i32>,
    /// Why the engine chose this outcome
    pub reason: Option<String>,
    /// Operator comment given with a verdict
    pub comment: Option<String>,
    pub attempts: u32,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            outcome: Outcome::Pending,
            started_at: None,
            finished_at: None,
            io_log: None,
            return_code: None,
            reason: None,
            comment: None,
            attempts: 0,
        }
    }
}

impl JobState {
    /// Record a final outcome
    pub fn finish(&mut self, outcome: Outcome, reason: Option<String>) {
        self.outcome = outcome;
        self.reason = reason;
        self.finished_at = Some(Utc::now());
    }

    /// Put the job back in the queue, keeping its attempt count
    pub fn rearm(&mut self) {
        *self = Self {
            attempts: self.attempts,
            ..Self::default()
        };
    }
}

/// Inputs captured when the session was created
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvironment {
    /// Manifest answers
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
    /// Variables the controller wants set for jobs
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

/// Counts of job outcomes plus the aggregate result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub crashed: usize,
    pub skipped: usize,
    pub not_supported: usize,
    pub pending: usize,
    /// `passed` when every job passed or was skipped, else `failed`
    pub outcome: String,
}

/// One test session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "v")]
    pub version: u32,
    pub id: String,
    pub test_plan: String,
    pub status: SessionStatus,
    pub mode: ExecutionMode,
    /// Resolved jobs in execution order
    pub jobs: Vec<JobUnit>,
    pub states: IndexMap<String, JobState>,
    /// Index of the job most recently started
    pub cursor: usize,
    pub environment: SessionEnvironment,
    /// Resource tables produced so far
    pub resources: ResourceMap,
    /// Sequence number of the last event emitted
    pub event_seq: u64,
    /// The operator was already offered to rerun failed jobs
    #[serde(default)]
    pub rerun_offered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        plan: ResolvedPlan,
        mode: ExecutionMode,
        environment: SessionEnvironment,
    ) -> Self {
        let now = Utc::now();
        let states = plan
            .jobs
            .iter()
            .map(|j| (j.id.clone(), JobState::default()))
            .collect();
        Self {
            version: SESSION_VERSION,
            id: id.into(),
            test_plan: plan.test_plan,
            status: SessionStatus::Created,
            mode,
            jobs: plan.jobs,
            states,
            cursor: 0,
            environment,
            resources: plan.resources,
            event_seq: 0,
            rerun_offered: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn job(&self, id: &str) -> Option<&JobUnit> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_index(&self, id: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    pub fn state(&self, id: &str) -> Option<&JobState> {
        self.states.get(id)
    }

    pub fn state_mut(&mut self, id: &str) -> Option<&mut JobState> {
        self.states.get_mut(id)
    }

    pub fn outcome(&self, id: &str) -> Option<Outcome> {
        self.states.get(id).map(|s| s.outcome)
    }

    /// First job, in execution order, that has not run yet
    pub fn next_pending(&self) -> Option<usize> {
        self.jobs
            .iter()
            .position(|j| self.outcome(&j.id) == Some(Outcome::Pending))
    }

    /// Indexes of jobs recorded as running
    pub fn running(&self) -> Vec<usize> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| self.outcome(&j.id) == Some(Outcome::Running))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary {
            total: self.jobs.len(),
            ..SessionSummary::default()
        };
        for state in self.states.values() {
            match state.outcome {
                Outcome::Pending | Outcome::Running => summary.pending += 1,
                Outcome::Passed => summary.passed += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Crashed => summary.crashed += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::NotSupported => summary.not_supported += 1,
            }
        }
        let passed = summary.passed + summary.skipped == summary.total;
        summary.outcome = if passed { "passed" } else { "failed" }.to_string();
        summary
    }
}
