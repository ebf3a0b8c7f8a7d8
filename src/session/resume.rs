//! Deciding how to continue a session after the agent restarts
//!
//! [`classify`] only looks at the checkpoint; [`apply`] performs the
//! matching state changes. Neither touches storage.

use super::state::{ExecutionMode, Outcome, Session, SessionStatus};
use crate::units::JobFlag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumption {
    /// Nothing to resume
    Idle,
    /// The session ended but was never archived
    Finished,
    /// The checkpoint was taken between jobs
    BetweenJobs { status: SessionStatus },
    /// A `noreturn` job took the machine down as intended
    ExpectedTermination { job_id: String },
    /// An `autorestart` job restarted the machine without reporting back
    Restarted { job_id: String },
    /// The agent died while jobs were running
    Crashed {
        job_ids: Vec<String>,
        /// The checkpoint did not clearly say what was running
        ambiguous: bool,
        status: SessionStatus,
    },
    /// An operator has to say what happened to the job
    AwaitOperator { job_id: String },
}

/// Classify the last checkpoint
pub fn classify(session: Option<&Session>) -> Resumption {
    let Some(session) = session else {
        return Resumption::Idle;
    };
    if session.status.is_finished() {
        return Resumption::Finished;
    }

    let automatic = session.mode == ExecutionMode::Automatic;
    let after_crash = if automatic {
        SessionStatus::Running
    } else {
        SessionStatus::Suspended
    };

    let running = session.running();
    match running.as_slice() {
        [] => {
            let status = match session.status {
                SessionStatus::Running => after_crash,
                other => other,
            };
            Resumption::BetweenJobs { status }
        }
        [index] if *index == session.cursor => {
            let job = &session.jobs[*index];
            if job.has_flag(JobFlag::NoReturn) {
                Resumption::ExpectedTermination {
                    job_id: job.id.clone(),
                }
            } else if job.has_flag(JobFlag::AutoRestart) {
                Resumption::Restarted {
                    job_id: job.id.clone(),
                }
            } else if automatic {
                Resumption::Crashed {
                    job_ids: vec![job.id.clone()],
                    ambiguous: false,
                    status: after_crash,
                }
            } else {
                Resumption::AwaitOperator {
                    job_id: job.id.clone(),
                }
            }
        }
        indexes => Resumption::Crashed {
            job_ids: indexes.iter().map(|&i| session.jobs[i].id.clone()).collect(),
            ambiguous: true,
            status: after_crash,
        },
    }
}

/// Apply a classification to the session; returns the jobs whose outcome changed
pub fn apply(session: &mut Session, resumption: &Resumption) -> Vec<String> {
    let mut changed = Vec::new();
    let mut finish = |session: &mut Session, job_id: &str, outcome: Outcome, reason: &str| {
        if let Some(state) = session.state_mut(job_id) {
            state.finish(outcome, Some(reason.to_string()));
            changed.push(job_id.to_string());
        }
    };

    match resumption {
        Resumption::Idle | Resumption::Finished => {}
        Resumption::BetweenJobs { status } => session.status = *status,
        Resumption::ExpectedTermination { job_id } => {
            finish(session, job_id, Outcome::Passed, "system came back after the job ended it");
            session.status = SessionStatus::Running;
        }
        Resumption::Restarted { job_id } => {
            finish(session, job_id, Outcome::Failed, "system restarted before the job finished");
            session.status = SessionStatus::Running;
        }
        Resumption::Crashed {
            job_ids,
            ambiguous,
            status,
        } => {
            if *ambiguous {
                tracing::warn!(
                    session_id = %session.id,
                    jobs = ?job_ids,
                    "checkpoint does not say clearly which job was running, marking all as crashed"
                );
            }
            for job_id in job_ids {
                finish(session, job_id, Outcome::Crashed, "agent stopped while the job was running");
            }
            session.status = *status;
        }
        Resumption::AwaitOperator { .. } => session.status = SessionStatus::Suspended,
    }
    session.touch();
    changed
}
