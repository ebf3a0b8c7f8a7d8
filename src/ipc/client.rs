//! Controller-side IPC client for talking to the agent

use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};

use crate::common::error::IpcError;
use crate::common::{Error, Result};
use crate::session::{
    CreateSession, EventPage, InFlightAction, RerunCandidate, SessionInfo, SessionSnapshot,
    SessionStatus, Verdict,
};

use super::protocol::{Command, Request, Response, StatusResult, TestPlanInfo};
use super::transport::{self, Connection, Endpoint};

/// Client for one connection to the agent
pub struct AgentClient {
    endpoint: Endpoint,
    reader: ReadHalf<Box<dyn Connection>>,
    writer: WriteHalf<Box<dyn Connection>>,
    next_id: u64,
}

impl AgentClient {
    /// Connect to the agent at `endpoint`
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let stream = transport::connect(endpoint).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound
                || e.kind() == std::io::ErrorKind::ConnectionRefused
            {
                Error::AgentNotRunning
            } else {
                Error::AgentConnectionFailed(e)
            }
        })?;

        let (reader, writer) = tokio::io::split(stream);

        Ok(Self {
            endpoint: endpoint.clone(),
            reader,
            writer,
            next_id: 1,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send a command and wait for the response
    pub async fn send_command(&mut self, command: Command) -> Result<serde_json::Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request { id, command };
        let json = serde_json::to_vec(&request)?;

        transport::send_message(&mut self.writer, &json)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let response_data = transport::recv_message(&mut self.reader)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let response: Response = serde_json::from_slice(&response_data)?;

        if response.id != id {
            return Err(Error::Transport(format!(
                "Response ID mismatch: expected {}, got {}",
                id, response.id
            )));
        }

        if response.success {
            Ok(response.result.unwrap_or(serde_json::json!({})))
        } else {
            let error = response.error.unwrap_or_else(|| IpcError {
                code: "UNKNOWN".to_string(),
                message: "Unknown error".to_string(),
            });
            Err(error.into())
        }
    }

    async fn call<T: DeserializeOwned>(&mut self, command: Command) -> Result<T> {
        let value = self.send_command(command).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn status(&mut self) -> Result<StatusResult> {
        self.call(Command::Status).await
    }

    pub async fn create_session(&mut self, request: CreateSession) -> Result<SessionInfo> {
        self.call(Command::CreateSession(request)).await
    }

    pub async fn start_run(&mut self, in_flight: Option<InFlightAction>) -> Result<SessionStatus> {
        self.call(Command::StartRun { in_flight }).await
    }

    pub async fn pause(&mut self) -> Result<SessionStatus> {
        self.call(Command::PauseRun).await
    }

    pub async fn submit_verdict(
        &mut self,
        job_id: &str,
        verdict: Verdict,
        comment: Option<String>,
    ) -> Result<()> {
        self.send_command(Command::SubmitVerdict {
            job_id: job_id.to_string(),
            verdict,
            comment,
        })
        .await
        .map(|_| ())
    }

    pub async fn abort(&mut self) -> Result<SessionStatus> {
        self.call(Command::AbortSession).await
    }

    pub async fn query_state(&mut self) -> Result<SessionSnapshot> {
        self.call(Command::QueryState).await
    }

    pub async fn events(
        &mut self,
        after: u64,
        boot_id: Option<String>,
        timeout: Duration,
    ) -> Result<EventPage> {
        self.call(Command::Events {
            after,
            boot_id,
            timeout_secs: Some(timeout.as_secs()),
        })
        .await
    }

    pub async fn list_test_plans(&mut self) -> Result<Vec<TestPlanInfo>> {
        self.call(Command::ListTestPlans).await
    }

    pub async fn rerun_candidates(&mut self) -> Result<Vec<RerunCandidate>> {
        self.call(Command::RerunCandidates).await
    }

    pub async fn rerun(&mut self, job_ids: Vec<String>) -> Result<Vec<String>> {
        self.call(Command::Rerun { job_ids }).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.send_command(Command::Shutdown).await.map(|_| ())
    }

    /// Check if the agent is responding
    pub async fn ping(&mut self) -> Result<bool> {
        match self.send_command(Command::Status).await {
            Ok(_) => Ok(true),
            Err(Error::AgentNotRunning) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
