//! IPC protocol message types
//!
//! Defines the request/response format for controller ↔ agent communication.
//! Uses a simple length-prefixed JSON protocol.

use serde::{Deserialize, Serialize};

use crate::common::error::IpcError;
use crate::session::{CreateSession, InFlightAction, Verdict};

/// IPC request from a controller to the agent
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for matching responses
    pub id: u64,
    /// The command to execute
    pub command: Command,
}

/// IPC response from the agent to a controller
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this response corresponds to
    pub id: u64,
    /// Whether the command succeeded
    pub success: bool,
    /// Result data on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error information on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl Response {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: IpcError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Commands a controller can send to the agent
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // === Session lifecycle ===
    /// Resolve a test plan into a new session
    CreateSession(CreateSession),

    /// Start or resume running jobs
    StartRun {
        /// What to do with a job that was running when the agent went down
        #[serde(default)]
        in_flight: Option<InFlightAction>,
    },

    /// Stop after the current job
    PauseRun,

    /// Answer a verdict prompt
    SubmitVerdict {
        job_id: String,
        verdict: Verdict,
        #[serde(default)]
        comment: Option<String>,
    },

    /// End the session, killing the running job
    AbortSession,

    /// Re-arm finished jobs; an empty list means every rerun candidate
    Rerun {
        #[serde(default)]
        job_ids: Vec<String>,
    },

    // === Observation ===
    /// Last committed session state
    QueryState,

    /// Long-poll for events newer than `after`
    Events {
        after: u64,
        /// Boot id the controller last saw; a mismatch forces a resync
        #[serde(default)]
        boot_id: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },

    /// Test plans known to the agent
    ListTestPlans,

    /// Jobs that could be rerun
    RerunCandidates,

    // === Agent ===
    /// Agent liveness and session overview
    Status,

    /// Stop the agent
    Shutdown,
}

/// Test plan as listed to controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlanInfo {
    pub id: String,
    pub name: Option<String>,
    /// Where the plan was defined
    pub origin: String,
}

/// Reply to `Status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResult {
    pub agent_running: bool,
    pub boot_id: String,
    pub session_id: Option<String>,
    pub test_plan: Option<String>,
    pub status: Option<String>,
    pub awaiting_verdict: Option<String>,
}
