//! Resumable session engine
//!
//! A session walks a resolved plan job by job. Its state is checkpointed
//! before and after every job so that the agent can pick it up again after a
//! reboot, whether the reboot was planned (`noreturn`) or not.

pub mod checkpoint;
pub mod engine;
pub mod events;
pub mod resume;
pub mod state;

pub use checkpoint::CheckpointStore;
pub use engine::{
    rerun_candidates, CreateSession, Engine, EngineHandle, InFlightAction, RerunCandidate,
    SessionInfo, Verdict,
};
pub use events::{Event, EventKind, EventPage, SessionSnapshot, SharedState, VerdictRequest};
pub use resume::Resumption;
pub use state::{
    ExecutionMode, JobState, Outcome, Session, SessionEnvironment, SessionStatus, SessionSummary,
};
