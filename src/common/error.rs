//! Error types for certrig
//!
//! One error enum covers the unit store, resolver, session engine and the
//! agent/controller link. Messages name the unit or job involved so they can
//! be shown to an operator as-is.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for certrig
#[derive(Error, Debug)]
pub enum Error {
    // === Unit Store Errors ===
    #[error("Parse error in {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("Duplicate unit id '{id}' (first defined at {first}, again at {second})")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },

    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    // === Template Errors ===
    #[error("Template '{template}': {message}")]
    Template { template: String, message: String },

    // === Resource Errors ===
    #[error("Resource job '{job_id}' produced malformed output: {message}")]
    ResourceParse { job_id: String, message: String },

    #[error("Expression '{expr}' could not be evaluated: {message}")]
    Evaluation { expr: String, message: String },

    // === Plan Errors ===
    #[error("Test plan nesting forms a cycle: {}", .0.join(" -> "))]
    CyclicPlan(Vec<String>),

    #[error("Job dependencies form a cycle: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Job '{job}' references unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    // === Execution Errors ===
    #[error("Failed to execute job '{job_id}': {message}")]
    Execution { job_id: String, message: String },

    #[error("Job '{job_id}' exceeded its time limit of {secs} seconds")]
    JobTimeout { job_id: String, secs: u64 },

    // === Session Errors ===
    #[error("No session active. Use 'certrig start <test-plan>' first")]
    SessionNotActive,

    #[error("A session is already active. Use 'certrig abort' first to end it")]
    SessionAlreadyActive,

    #[error("Cannot {action} while session is {state}")]
    InvalidState { action: String, state: String },

    #[error("Checkpoint error for '{path}': {message}")]
    Checkpoint { path: String, message: String },

    // === Agent/Connection Errors ===
    #[error("Agent not running. Start it with 'certrig agent' or run a command against a local agent")]
    AgentNotRunning,

    #[error("Failed to spawn agent: timed out waiting for socket after {0} seconds")]
    AgentSpawnTimeout(u64),

    #[error("Failed to connect to agent: {0}")]
    AgentConnectionFailed(#[source] io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error reported by the agent that has no local equivalent
    #[error("{}", .0.message)]
    Rejected(IpcError),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a parse error for a record origin
    pub fn parse(origin: impl ToString, message: impl Into<String>) -> Self {
        Self::Parse {
            origin: origin.to_string(),
            message: message.into(),
        }
    }

    /// Create a template error
    pub fn template(template: &str, message: impl Into<String>) -> Self {
        Self::Template {
            template: template.to_string(),
            message: message.into(),
        }
    }

    /// Create a resource parse error
    pub fn resource_parse(job_id: &str, message: impl Into<String>) -> Self {
        Self::ResourceParse {
            job_id: job_id.to_string(),
            message: message.into(),
        }
    }

    /// Create an expression evaluation error
    pub fn evaluation(expr: &str, message: impl Into<String>) -> Self {
        Self::Evaluation {
            expr: expr.to_string(),
            message: message.into(),
        }
    }

    /// Create an execution error
    pub fn execution(job_id: &str, message: impl Into<String>) -> Self {
        Self::Execution {
            job_id: job_id.to_string(),
            message: message.into(),
        }
    }

    /// Create an unknown dependency error
    pub fn unknown_dependency(job: &str, dependency: &str) -> Self {
        Self::UnknownDependency {
            job: job.to_string(),
            dependency: dependency.to_string(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &str, state: impl ToString) -> Self {
        Self::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a checkpoint error
    pub fn checkpoint(path: &std::path::Path, message: impl ToString) -> Self {
        Self::Checkpoint {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }
}

/// IPC-serializable error for agent responses
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IpcError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for IpcError {
    fn from(e: &Error) -> Self {
        let code = match e {
            Error::Parse { .. } => "PARSE_ERROR",
            Error::DuplicateId { .. } => "DUPLICATE_ID",
            Error::UnknownUnit(_) => "UNKNOWN_UNIT",
            Error::Template { .. } => "TEMPLATE_ERROR",
            Error::ResourceParse { .. } => "RESOURCE_PARSE_ERROR",
            Error::Evaluation { .. } => "EVALUATION_ERROR",
            Error::CyclicPlan(_) => "CYCLIC_PLAN",
            Error::CyclicDependency(_) => "CYCLIC_DEPENDENCY",
            Error::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY",
            Error::Execution { .. } => "EXECUTION_ERROR",
            Error::SessionNotActive => "SESSION_NOT_ACTIVE",
            Error::SessionAlreadyActive => "SESSION_ALREADY_ACTIVE",
            Error::InvalidState { .. } => "INVALID_STATE",
            Error::Checkpoint { .. } => "CHECKPOINT_ERROR",
            Error::AgentNotRunning => "AGENT_NOT_RUNNING",
            Error::Rejected(e) => return e.clone(),
            Error::Timeout(_) | Error::JobTimeout { .. } => "TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
        .to_string();

        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<IpcError> for Error {
    fn from(e: IpcError) -> Self {
        // Only unit-less variants can be rebuilt faithfully
        match e.code.as_str() {
            "SESSION_NOT_ACTIVE" => Error::SessionNotActive,
            "SESSION_ALREADY_ACTIVE" => Error::SessionAlreadyActive,
            "AGENT_NOT_RUNNING" => Error::AgentNotRunning,
            "UNKNOWN_UNIT" => Error::UnknownUnit(e.message),
            _ => Error::Rejected(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_error_codes() {
        let err = Error::CyclicDependency(vec!["a".into(), "b".into(), "a".into()]);
        let ipc = IpcError::from(&err);
        assert_eq!(ipc.code, "CYCLIC_DEPENDENCY");
        assert_eq!(ipc.message, "Job dependencies form a cycle: a -> b -> a");
    }

    #[test]
    fn test_ipc_error_maps_back() {
        let ipc = IpcError::from(&Error::SessionAlreadyActive);
        assert!(matches!(Error::from(ipc), Error::SessionAlreadyActive));

        let ipc = IpcError {
            code: "PARSE_ERROR".into(),
            message: "bad".into(),
        };
        let err = Error::from(ipc);
        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(err.to_string(), "bad");
    }
}
