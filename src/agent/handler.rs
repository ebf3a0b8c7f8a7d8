//! Command handler for processing IPC requests
//!
//! Observation commands are answered from the published session state.
//! Everything that changes the session goes to the engine.

use serde_json::json;
use std::time::Duration;

use crate::common::{error::IpcError, Error, Result};
use crate::ipc::protocol::{Command, Response, StatusResult, TestPlanInfo};
use crate::units::Catalog;

use super::server::AgentContext;

/// Upper bound for one events long-poll
const MAX_POLL: Duration = Duration::from_secs(120);

/// Handle an IPC command
pub async fn handle_command(ctx: &AgentContext, id: u64, command: Command) -> Response {
    match handle_command_inner(ctx, command).await {
        Ok(result) => Response::success(id, result),
        Err(e) => Response::error(id, IpcError::from(&e)),
    }
}

async fn handle_command_inner(ctx: &AgentContext, command: Command) -> Result<serde_json::Value> {
    let engine = &ctx.engine;
    match command {
        // === Session lifecycle ===
        Command::CreateSession(request) => {
            let info = engine.create(request).await?;
            Ok(serde_json::to_value(info)?)
        }

        Command::StartRun { in_flight } => {
            let status = engine.start_run(in_flight).await?;
            Ok(serde_json::to_value(status)?)
        }

        Command::PauseRun => {
            let status = engine.pause().await?;
            Ok(serde_json::to_value(status)?)
        }

        Command::SubmitVerdict {
            job_id,
            verdict,
            comment,
        } => {
            engine.submit_verdict(job_id.clone(), verdict, comment).await?;
            Ok(json!({ "job_id": job_id, "verdict": verdict }))
        }

        Command::AbortSession => {
            let status = engine.abort().await?;
            Ok(serde_json::to_value(status)?)
        }

        Command::Rerun { job_ids } => {
            let rearmed = engine.rerun(job_ids).await?;
            Ok(serde_json::to_value(rearmed)?)
        }

        // === Observation ===
        Command::QueryState => Ok(serde_json::to_value(engine.shared().snapshot())?),

        Command::Events {
            after,
            boot_id,
            timeout_secs,
        } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(Duration::ZERO)
                .min(MAX_POLL);
            let shared = engine.shared();
            let page = tokio::select! {
                page = shared.wait_events(after, boot_id.as_deref(), timeout) => page,
                // Answer right away when the agent is going down
                _ = ctx.shutdown.cancelled() => shared.events_after(after, boot_id.as_deref()),
            };
            Ok(serde_json::to_value(page)?)
        }

        Command::ListTestPlans => {
            let (catalog, errors) = Catalog::from_config(&ctx.config.units);
            for error in &errors {
                tracing::warn!(error = %error, "unit source skipped");
            }
            let plans: Vec<TestPlanInfo> = catalog
                .test_plans()
                .map(|plan| TestPlanInfo {
                    id: plan.id.clone(),
                    name: plan.name.clone(),
                    origin: plan.origin.to_string(),
                })
                .collect();
            Ok(serde_json::to_value(plans)?)
        }

        Command::RerunCandidates => Ok(serde_json::to_value(engine.rerun_candidates()?)?),

        // === Agent ===
        Command::Status => {
            let snapshot = engine.shared().snapshot();
            let session = snapshot.session.as_ref();
            let result = StatusResult {
                agent_running: true,
                boot_id: snapshot.boot_id.clone(),
                session_id: session.map(|s| s.id.clone()),
                test_plan: session.map(|s| s.test_plan.clone()),
                status: session.map(|s| s.status.to_string()),
                awaiting_verdict: snapshot.awaiting_verdict.map(|v| v.job_id),
            };
            Ok(serde_json::to_value(result)?)
        }

        Command::Shutdown => Err(Error::Internal(
            "shutdown is handled by the connection loop".into(),
        )),
    }
}
