//! Session engine
//!
//! The executor task owns the session and is its only writer. Commands from
//! connection handlers arrive over a channel and are served between jobs and
//! while a job runs or waits for a verdict. Every state transition is
//! checkpointed and then published to [`SharedState`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::checkpoint::CheckpointStore;
use super::events::{Event, EventKind, SharedState, VerdictRequest};
use super::resume::{self, Resumption};
use super::state::{ExecutionMode, Outcome, Session, SessionEnvironment, SessionStatus};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::exec::{host_environment, ExitKind, JobRunner, OutputChunk, RunContext};
use crate::plan::{PlanOverrides, PrerunJob, Resolver};
use crate::resource::{requirements_met, table_from_report, ResourceTable};
use crate::units::{Catalog, JobFlag, JobUnit, Plugin};

const COMMAND_QUEUE: usize = 32;

/// Operator decision on a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Skip,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown verdict '{}' (expected pass, fail or skip)", other)),
        }
    }
}

/// What to do with a job that was running when the agent stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightAction {
    Rerun,
    Pass,
    Fail,
    Skip,
    Crash,
}

impl FromStr for InFlightAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rerun" => Ok(Self::Rerun),
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            "crash" => Ok(Self::Crash),
            other => Err(format!("unknown in-flight action '{}'", other)),
        }
    }
}

/// Parameters of a new session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSession {
    pub test_plan: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub overrides: PlanOverrides,
    /// Variables set for every job
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Manifest answers
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub test_plan: String,
    pub status: SessionStatus,
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerunCandidate {
    pub job_id: String,
    pub outcome: Outcome,
    pub attempts: u32,
}

/// Jobs worth running again
///
/// Failed and crashed jobs qualify while they have fewer than `max_attempts`
/// attempts; jobs that were not supported qualify when one of their
/// dependencies is rerun with them.
pub fn rerun_candidates(session: &Session, max_attempts: Option<u32>) -> Vec<RerunCandidate> {
    let mut chosen: Vec<RerunCandidate> = Vec::new();
    for job in &session.jobs {
        let Some(state) = session.state(&job.id) else {
            continue;
        };
        let eligible = match state.outcome {
            Outcome::Failed | Outcome::Crashed => max_attempts.map_or(true, |m| state.attempts < m),
            Outcome::NotSupported => job
                .depends
                .iter()
                .any(|d| chosen.iter().any(|c| &c.job_id == d)),
            _ => false,
        };
        if eligible {
            chosen.push(RerunCandidate {
                job_id: job.id.clone(),
                outcome: state.outcome,
                attempts: state.attempts,
            });
        }
    }
    chosen
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub enum EngineCommand {
    Create {
        request: CreateSession,
        reply: Reply<SessionInfo>,
    },
    Start {
        in_flight: Option<InFlightAction>,
        reply: Reply<SessionStatus>,
    },
    Pause {
        reply: Reply<SessionStatus>,
    },
    Verdict {
        job_id: String,
        verdict: Verdict,
        comment: Option<String>,
        reply: Reply<()>,
    },
    Abort {
        reply: Reply<SessionStatus>,
    },
    Rerun {
        job_ids: Vec<String>,
        reply: Reply<Vec<String>>,
    },
}

/// Cloneable access to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    shared: Arc<SharedState>,
}

impl EngineHandle {
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> EngineCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Internal("session engine has stopped".into()))?;
        rx.await
            .map_err(|_| Error::Internal("session engine dropped the request".into()))?
    }

    pub async fn create(&self, request: CreateSession) -> Result<SessionInfo> {
        self.request(|reply| EngineCommand::Create { request, reply })
            .await
    }

    pub async fn start_run(&self, in_flight: Option<InFlightAction>) -> Result<SessionStatus> {
        self.request(|reply| EngineCommand::Start { in_flight, reply })
            .await
    }

    pub async fn pause(&self) -> Result<SessionStatus> {
        self.request(|reply| EngineCommand::Pause { reply }).await
    }

    pub async fn submit_verdict(
        &self,
        job_id: String,
        verdict: Verdict,
        comment: Option<String>,
    ) -> Result<()> {
        self.request(|reply| EngineCommand::Verdict {
            job_id,
            verdict,
            comment,
            reply,
        })
        .await
    }

    pub async fn abort(&self) -> Result<SessionStatus> {
        self.request(|reply| EngineCommand::Abort { reply }).await
    }

    pub async fn rerun(&self, job_ids: Vec<String>) -> Result<Vec<String>> {
        self.request(|reply| EngineCommand::Rerun { job_ids, reply })
            .await
    }

    /// Rerun candidates of the last committed session
    pub fn rerun_candidates(&self) -> Result<Vec<RerunCandidate>> {
        let snapshot = self.shared.snapshot();
        let session = snapshot
            .session
            .filter(|s| !s.status.is_finished())
            .ok_or(Error::SessionNotActive)?;
        Ok(rerun_candidates(&session, None))
    }
}

enum Exec {
    Done {
        outcome: Outcome,
        reason: Option<String>,
        exit: Option<ExitKind>,
    },
    Shutdown,
}

enum Wait {
    Given(Verdict),
    TimedOut(u64),
    Aborted,
    Shutdown,
}

enum Step {
    Done(Outcome, Option<String>),
    Shutdown,
}

impl From<Exec> for Step {
    fn from(exec: Exec) -> Self {
        match exec {
            Exec::Done { outcome, reason, .. } => Step::Done(outcome, reason),
            Exec::Shutdown => Step::Shutdown,
        }
    }
}

impl From<Wait> for Step {
    fn from(wait: Wait) -> Self {
        match wait {
            Wait::Given(Verdict::Pass) => Step::Done(Outcome::Passed, None),
            Wait::Given(Verdict::Fail) => Step::Done(Outcome::Failed, Some("failed by operator".into())),
            Wait::Given(Verdict::Skip) => Step::Done(Outcome::Skipped, Some("skipped by operator".into())),
            Wait::TimedOut(secs) => Step::Done(
                Outcome::Skipped,
                Some(format!("no verdict within {} seconds", secs)),
            ),
            Wait::Aborted => Step::Done(Outcome::Failed, Some("session aborted".into())),
            Wait::Shutdown => Step::Shutdown,
        }
    }
}

/// Outcome for a process exit
fn classify_exit(exit: &ExitKind) -> (Outcome, Option<String>) {
    match exit {
        ExitKind::Code(0) => (Outcome::Passed, None),
        ExitKind::Code(code) => (Outcome::Failed, Some(format!("exit code {}", code))),
        ExitKind::Signal(signal) => (Outcome::Crashed, Some(format!("killed by signal {}", signal))),
        ExitKind::TimedOut => (Outcome::Failed, Some("timed out".into())),
        ExitKind::Aborted => (Outcome::Failed, Some("aborted by operator".into())),
    }
}

pub struct Engine {
    config: Config,
    store: CheckpointStore,
    runner: Arc<dyn JobRunner>,
    shared: Arc<SharedState>,
    host: BTreeMap<String, String>,
    session: Option<Session>,
    /// Cancelled when the operator aborts the session
    abort: CancellationToken,
    /// Cancelled when the agent stops
    shutdown: CancellationToken,
    /// Job currently running or waiting for a verdict
    active_job: Option<String>,
    awaiting_verdict: Option<String>,
    verdict: Option<Verdict>,
    pause_requested: bool,
}

impl Engine {
    pub fn new(
        config: Config,
        store: CheckpointStore,
        runner: Arc<dyn JobRunner>,
        shared: Arc<SharedState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            runner,
            shared,
            host: host_environment(),
            session: None,
            abort: CancellationToken::new(),
            shutdown: shutdown.child_token(),
            active_job: None,
            awaiting_verdict: None,
            verdict: None,
            pause_requested: false,
        }
    }

    /// Replace the agent environment jobs inherit from
    pub fn with_host_environment(mut self, host: BTreeMap<String, String>) -> Self {
        self.host = host;
        self
    }

    /// Pick up the last checkpoint, if any
    pub fn boot(&mut self) -> Result<Resumption> {
        let session = self.store.load_current()?;
        let resumption = resume::classify(session.as_ref());
        let Some(mut session) = session else {
            tracing::info!("no session to resume");
            return Ok(resumption);
        };

        if resumption == Resumption::Finished {
            self.shared.publish(&session);
            self.store.archive(&session.id)?;
            return Ok(resumption);
        }

        tracing::info!(
            session_id = %session.id,
            resumption = ?resumption,
            "resuming session"
        );
        let changed = resume::apply(&mut session, &resumption);
        let status = session.status;
        self.session = Some(session);

        for job_id in changed {
            self.emit_finished(&job_id);
        }
        self.emit(EventKind::StatusChanged { status });
        self.commit()?;
        Ok(resumption)
    }

    /// Start the executor task
    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = EngineHandle {
            tx,
            shared: self.shared.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let running = self
                .session
                .as_ref()
                .is_some_and(|s| s.status == SessionStatus::Running);

            if running {
                if let Err(e) = self.advance(&mut commands).await {
                    self.step_failed(e);
                }
                continue;
            }

            let shutdown = self.shutdown.clone();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        tracing::debug!("session engine stopped");
    }

    /// Process the next pending job
    async fn advance(&mut self, commands: &mut mpsc::Receiver<EngineCommand>) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::SessionNotActive)?;
        let Some(index) = session.next_pending() else {
            return self.exhausted();
        };
        let job = session.jobs[index].clone();

        if let Some((outcome, reason)) = self.precheck(&job) {
            self.finish_job(&job, outcome, Some(reason))?;
            return self.after_job();
        }

        self.begin_job(index, &job)?;

        let step: Step = match job.plugin {
            Plugin::Manual => self.wait_verdict(&job, job.prompt(), commands).await?.into(),
            Plugin::UserInteract => {
                let prompt = format!("{}\n\nPass to start the test, skip to skip it.", job.prompt());
                match self.wait_verdict(&job, prompt, commands).await? {
                    Wait::Given(Verdict::Pass) => self.execute(&job, commands).await?.into(),
                    other => other.into(),
                }
            }
            Plugin::UserInteractVerify => match self.execute(&job, commands).await? {
                Exec::Done {
                    exit: Some(ExitKind::Code(_)),
                    ..
                } if !self.abort.is_cancelled() => {
                    self.wait_verdict(&job, job.prompt(), commands).await?.into()
                }
                other => other.into(),
            },
            _ => self.execute(&job, commands).await?.into(),
        };

        match step {
            Step::Done(outcome, reason) => {
                self.finish_job(&job, outcome, reason)?;
                self.after_job()
            }
            Step::Shutdown => {
                tracing::info!(job_id = %job.id, "agent stopping with job in flight");
                self.active_job = None;
                Ok(())
            }
        }
    }

    /// Outcome for a job that must not run at all
    fn precheck(&self, job: &JobUnit) -> Option<(Outcome, String)> {
        let session = self.session.as_ref()?;

        if let Some(dep) = job
            .depends
            .iter()
            .find(|d| session.outcome(d) != Some(Outcome::Passed))
        {
            let state = session
                .outcome(dep)
                .map(|o| o.to_string())
                .unwrap_or_else(|| "not in the plan".into());
            return Some((
                Outcome::NotSupported,
                format!("dependency '{}' is {}", dep, state),
            ));
        }

        let unmet = match requirements_met(job, &session.resources) {
            Ok(true) => None,
            Ok(false) => Some(format!(
                "requirement not met: {}",
                job.requires.as_ref().map(|r| r.text()).unwrap_or_default()
            )),
            Err(e) => Some(format!("requirement could not be evaluated: {}", e)),
        };
        if let Some(reason) = unmet {
            let outcome = if job.has_flag(JobFlag::FailOnResource) {
                Outcome::Failed
            } else {
                Outcome::NotSupported
            };
            return Some((outcome, reason));
        }

        if session.mode == ExecutionMode::Automatic && job.plugin.is_interactive() {
            return Some((
                Outcome::Skipped,
                "needs an operator but the session is automatic".into(),
            ));
        }
        None
    }

    fn begin_job(&mut self, index: usize, job: &JobUnit) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::SessionNotActive)?;
        session.cursor = index;
        let state = session
            .state_mut(&job.id)
            .ok_or_else(|| Error::UnknownUnit(job.id.clone()))?;
        state.outcome = Outcome::Running;
        state.started_at = Some(Utc::now());
        state.finished_at = None;
        state.return_code = None;
        state.reason = None;
        state.attempts += 1;
        let attempt = state.attempts;

        self.active_job = Some(job.id.clone());
        self.emit(EventKind::JobStarted {
            job_id: job.id.clone(),
            index,
            attempt,
        });
        if job.has_flag(JobFlag::NoReturn) {
            tracing::info!(job_id = %job.id, "job may not return, checkpoint written first");
        }
        // Must hit the disk before the command starts
        self.commit()
    }

    fn finish_job(&mut self, job: &JobUnit, outcome: Outcome, reason: Option<String>) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::SessionNotActive)?;
        if let Some(state) = session.state_mut(&job.id) {
            state.finish(outcome, reason.clone());
        }
        self.active_job = None;
        tracing::info!(job_id = %job.id, %outcome, reason = ?reason, "job finished");
        self.emit_finished(&job.id);
        self.commit()
    }

    fn after_job(&mut self) -> Result<()> {
        if self.abort.is_cancelled() {
            return self.finish_session(SessionStatus::Aborted);
        }
        if self.pause_requested {
            self.pause_requested = false;
            return self.set_status(SessionStatus::Suspended);
        }
        Ok(())
    }

    /// Nothing is pending: retry, offer reruns, or complete
    fn exhausted(&mut self) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::SessionNotActive)?;
        let execution = &self.config.execution;

        if execution.auto_retry {
            let retry = rerun_candidates(session, Some(execution.max_attempts));
            if !retry.is_empty() {
                let ids: Vec<String> = retry.into_iter().map(|c| c.job_id).collect();
                tracing::info!(jobs = ?ids, "retrying failed jobs");
                self.rearm(&ids)?;
                return self.commit();
            }
        }

        if session.mode == ExecutionMode::Interactive
            && !session.rerun_offered
            && !rerun_candidates(session, None).is_empty()
        {
            if let Some(session) = self.session.as_mut() {
                session.rerun_offered = true;
            }
            tracing::info!("jobs failed, waiting for the operator to choose reruns");
            return self.set_status(SessionStatus::Suspended);
        }

        self.finish_session(SessionStatus::Completed)
    }

    fn rearm(&mut self, job_ids: &[String]) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::SessionNotActive)?;
        for id in job_ids {
            let state = session
                .state_mut(id)
                .ok_or_else(|| Error::UnknownUnit(id.clone()))?;
            state.rearm();
        }
        session.rerun_offered = false;
        Ok(())
    }

    async fn execute(
        &mut self,
        job: &JobUnit,
        commands: &mut mpsc::Receiver<EngineCommand>,
    ) -> Result<Exec> {
        let session = self.session.as_ref().ok_or(Error::SessionNotActive)?;
        let context = self.run_context(&session.id, &session.environment.overrides);
        let log_path = self.store.io_log_path(&session.id, &job.id);
        let Some(request) = context.request(job) else {
            return Ok(Exec::Done {
                outcome: Outcome::Failed,
                reason: Some("job has no command".into()),
                exit: None,
            });
        };
        let limit = request.timeout;

        let mut log = match File::create(&log_path) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(path = %log_path.display(), error = %e, "cannot create io log");
                None
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = self.runner.clone();
        let cancel = self.abort.child_token();
        let shutdown = self.shutdown.clone();
        tracing::info!(job_id = %job.id, "starting job");

        let mut run = runner.run(request, Some(tx), cancel.clone());
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(chunk) = rx.recv() => self.on_output(job, chunk, log.as_mut()),
                Some(command) = commands.recv() => self.handle(command).await,
                _ = shutdown.cancelled(), if !cancel.is_cancelled() => cancel.cancel(),
            }
        };
        while let Ok(chunk) = rx.try_recv() {
            self.on_output(job, chunk, log.as_mut());
        }
        drop(log);

        if shutdown.is_cancelled() && !self.abort.is_cancelled() {
            return Ok(Exec::Shutdown);
        }

        let session = self.session.as_mut().ok_or(Error::SessionNotActive)?;
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "job could not be started");
                if let Some(state) = session.state_mut(&job.id) {
                    state.io_log = Some(log_path);
                }
                return Ok(Exec::Done {
                    outcome: Outcome::Failed,
                    reason: Some(e.to_string()),
                    exit: None,
                });
            }
        };

        let (mut outcome, mut reason) = match &report.exit {
            ExitKind::TimedOut => (
                Outcome::Failed,
                Some(
                    Error::JobTimeout {
                        job_id: job.id.clone(),
                        secs: limit.map(|l| l.as_secs()).unwrap_or_default(),
                    }
                    .to_string(),
                ),
            ),
            other => classify_exit(other),
        };

        if job.plugin == Plugin::Resource {
            let table = match table_from_report(job, &report) {
                Ok(table) => table,
                Err(e) if job.has_flag(JobFlag::FailOnResource) => {
                    outcome = Outcome::Failed;
                    reason = Some(e.to_string());
                    ResourceTable::default()
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "ignoring malformed resource output");
                    ResourceTable::default()
                }
            };
            session.resources.insert(job.id.clone(), table);
        }

        if let Some(state) = session.state_mut(&job.id) {
            state.io_log = Some(log_path);
            state.return_code = match report.exit {
                ExitKind::Code(code) => Some(code),
                _ => None,
            };
        }

        Ok(Exec::Done {
            outcome,
            reason,
            exit: Some(report.exit),
        })
    }

    fn on_output(&mut self, job: &JobUnit, chunk: OutputChunk, log: Option<&mut File>) {
        if let Some(log) = log {
            if let Err(e) = log.write_all(&chunk.data) {
                tracing::debug!(job_id = %job.id, error = %e, "io log write failed");
            }
        }
        if job.has_flag(JobFlag::SuppressOutput) {
            return;
        }
        self.emit(EventKind::OutputChunk {
            job_id: job.id.clone(),
            stream: chunk.stream,
            data: String::from_utf8_lossy(&chunk.data).into_owned(),
        });
    }

    async fn wait_verdict(
        &mut self,
        job: &JobUnit,
        prompt: String,
        commands: &mut mpsc::Receiver<EngineCommand>,
    ) -> Result<Wait> {
        self.awaiting_verdict = Some(job.id.clone());
        self.verdict = None;
        self.shared.set_awaiting_verdict(Some(VerdictRequest {
            job_id: job.id.clone(),
            prompt: prompt.clone(),
        }));
        self.emit(EventKind::VerdictRequested {
            job_id: job.id.clone(),
            prompt,
        });
        self.commit()?;

        let limit = self.config.execution.verdict_timeout();
        let shutdown = self.shutdown.clone();
        let expired = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        let wait = loop {
            if let Some(verdict) = self.verdict.take() {
                break Wait::Given(verdict);
            }
            if self.abort.is_cancelled() {
                break Wait::Aborted;
            }
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        // Every handle is gone; nobody can answer
                        self.shutdown.cancel();
                        break Wait::Shutdown;
                    }
                },
                _ = &mut expired => {
                    break Wait::TimedOut(limit.map(|l| l.as_secs()).unwrap_or_default())
                }
                _ = shutdown.cancelled() => break Wait::Shutdown,
            }
        };

        self.awaiting_verdict = None;
        self.shared.set_awaiting_verdict(None);
        Ok(wait)
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Create { request, reply } => {
                let _ = reply.send(self.create(request).await);
            }
            EngineCommand::Start { in_flight, reply } => {
                let _ = reply.send(self.start_run(in_flight));
            }
            EngineCommand::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            EngineCommand::Verdict {
                job_id,
                verdict,
                comment,
                reply,
            } => {
                let _ = reply.send(self.submit_verdict(&job_id, verdict, comment));
            }
            EngineCommand::Abort { reply } => {
                let _ = reply.send(self.abort_session());
            }
            EngineCommand::Rerun { job_ids, reply } => {
                let _ = reply.send(self.rerun(job_ids));
            }
        }
    }

    fn active_session(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .filter(|s| !s.status.is_finished())
            .ok_or(Error::SessionNotActive)
    }

    async fn create(&mut self, request: CreateSession) -> Result<SessionInfo> {
        if self.session.as_ref().is_some_and(|s| !s.status.is_finished()) {
            return Err(Error::SessionAlreadyActive);
        }

        let (catalog, errors) = Catalog::from_config(&self.config.units);
        if !errors.is_empty() {
            tracing::warn!(count = errors.len(), "some unit sources could not be loaded");
        }
        self.create_from_catalog(&catalog, request).await
    }

    /// Resolve the plan against `catalog` and make it the active session
    pub async fn create_from_catalog(
        &mut self,
        catalog: &Catalog,
        request: CreateSession,
    ) -> Result<SessionInfo> {
        if self.session.as_ref().is_some_and(|s| !s.status.is_finished()) {
            return Err(Error::SessionAlreadyActive);
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        self.store.prepare(&id)?;
        let context = self.run_context(&id, &request.environment);

        tracing::info!(session_id = %id, test_plan = %request.test_plan, mode = %request.mode, "creating session");
        let resolved = Resolver::new(catalog, self.runner.as_ref(), &context)
            .with_manifest(request.manifest.clone())
            .with_cancel(self.shutdown.child_token())
            .resolve(&request.test_plan, &request.overrides)
            .await;
        let mut plan = match resolved {
            Ok(plan) => plan,
            Err(e) => {
                let dir = self.store.session_dir(&id);
                if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(session_id = %id, path = %dir.display(), error = %cleanup, "could not remove session directory");
                }
                return Err(e);
            }
        };

        let prerun = std::mem::take(&mut plan.prerun);
        let environment = SessionEnvironment {
            manifest: request.manifest,
            overrides: request.environment,
        };
        let mut session = Session::new(id, plan, request.mode, environment);
        session.event_seq = self.session.as_ref().map(|s| s.event_seq).unwrap_or(0);
        for job in prerun {
            self.record_prerun(&mut session, job);
        }

        let info = SessionInfo {
            session_id: session.id.clone(),
            test_plan: session.test_plan.clone(),
            status: session.status,
            jobs: session.jobs.iter().map(|j| j.id.clone()).collect(),
        };

        self.session = Some(session);
        self.abort = CancellationToken::new();
        self.pause_requested = false;
        self.emit(EventKind::SessionCreated {
            session_id: info.session_id.clone(),
            test_plan: info.test_plan.clone(),
            jobs: info.jobs.len(),
        });
        self.commit()?;
        Ok(info)
    }

    /// Carry a job run during resolution into the session
    fn record_prerun(&self, session: &mut Session, job: PrerunJob) {
        let log_path = self.store.io_log_path(&session.id, &job.job_id);
        let Some(state) = session.state_mut(&job.job_id) else {
            return;
        };
        let (outcome, reason) = match &job.report {
            Some(report) => classify_exit(&report.exit),
            None => (Outcome::Failed, job.reason.clone()),
        };
        if let Some(report) = &job.report {
            let mut data = report.stdout.clone();
            data.extend_from_slice(&report.stderr);
            match std::fs::write(&log_path, data) {
                Ok(()) => state.io_log = Some(log_path),
                Err(e) => tracing::warn!(job_id = %job.job_id, error = %e, "cannot write io log"),
            }
            if let ExitKind::Code(code) = report.exit {
                state.return_code = Some(code);
            }
        }
        state.started_at = Some(job.started_at);
        state.attempts = 1;
        state.finish(outcome, reason);
        state.finished_at = Some(job.finished_at);
    }

    fn start_run(&mut self, in_flight: Option<InFlightAction>) -> Result<SessionStatus> {
        let session = self.active_session()?;
        match session.status {
            SessionStatus::Created | SessionStatus::Suspended => {}
            other => return Err(Error::invalid_state("start the run", other)),
        }

        let mut decided = Vec::new();
        for index in session.running() {
            let job_id = session.jobs[index].id.clone();
            let action = in_flight.unwrap_or(InFlightAction::Crash);
            let Some(state) = session.state_mut(&job_id) else {
                continue;
            };
            match action {
                InFlightAction::Rerun => state.rearm(),
                InFlightAction::Pass => state.finish(Outcome::Passed, Some("passed by operator after restart".into())),
                InFlightAction::Fail => state.finish(Outcome::Failed, Some("failed by operator after restart".into())),
                InFlightAction::Skip => state.finish(Outcome::Skipped, Some("skipped by operator after restart".into())),
                InFlightAction::Crash => state.finish(Outcome::Crashed, Some("agent stopped while the job was running".into())),
            }
            tracing::info!(job_id = %job_id, ?action, "resolved job left in flight");
            if action != InFlightAction::Rerun {
                decided.push(job_id);
            }
        }

        for job_id in decided {
            self.emit_finished(&job_id);
        }
        self.set_status(SessionStatus::Running)?;
        Ok(SessionStatus::Running)
    }

    fn pause(&mut self) -> Result<SessionStatus> {
        let session = self.active_session()?;
        if session.status != SessionStatus::Running {
            return Err(Error::invalid_state("pause", session.status));
        }
        if self.active_job.is_some() {
            self.pause_requested = true;
            return Ok(SessionStatus::Running);
        }
        self.set_status(SessionStatus::Suspended)?;
        Ok(SessionStatus::Suspended)
    }

    fn submit_verdict(&mut self, job_id: &str, verdict: Verdict, comment: Option<String>) -> Result<()> {
        if self.awaiting_verdict.as_deref() != Some(job_id) {
            self.active_session()?;
            return Err(Error::invalid_state(
                &format!("submit a verdict for '{}'", job_id),
                "not waiting for it",
            ));
        }
        if let Some(state) = self.active_session()?.state_mut(job_id) {
            state.comment = comment;
        }
        tracing::info!(job_id, %verdict, "verdict received");
        self.verdict = Some(verdict);
        Ok(())
    }

    fn abort_session(&mut self) -> Result<SessionStatus> {
        self.active_session()?;
        tracing::info!("abort requested");
        self.abort.cancel();
        if self.active_job.is_some() {
            return Ok(SessionStatus::Aborted);
        }

        // Jobs still recorded as running from before a restart
        let session = self.active_session()?;
        let mut left = Vec::new();
        for index in session.running() {
            let job_id = session.jobs[index].id.clone();
            if let Some(state) = session.state_mut(&job_id) {
                state.finish(Outcome::Failed, Some("aborted by operator".into()));
                left.push(job_id);
            }
        }
        for job_id in left {
            tracing::info!(job_id = %job_id, "job left in flight failed by abort");
            self.emit_finished(&job_id);
        }
        self.finish_session(SessionStatus::Aborted)?;
        Ok(SessionStatus::Aborted)
    }

    fn rerun(&mut self, job_ids: Vec<String>) -> Result<Vec<String>> {
        let session = self.active_session()?;
        match session.status {
            SessionStatus::Created | SessionStatus::Suspended => {}
            other => return Err(Error::invalid_state("rerun jobs", other)),
        }

        let ids = if job_ids.is_empty() {
            rerun_candidates(session, None)
                .into_iter()
                .map(|c| c.job_id)
                .collect()
        } else {
            for id in &job_ids {
                match session.outcome(id) {
                    Some(outcome) if outcome.is_final() => {}
                    Some(outcome) => {
                        return Err(Error::invalid_state(&format!("rerun '{}'", id), outcome))
                    }
                    None => return Err(Error::UnknownUnit(id.clone())),
                }
            }
            job_ids
        };

        self.rearm(&ids)?;
        tracing::info!(jobs = ?ids, "jobs re-armed");
        self.commit()?;
        Ok(ids)
    }

    fn finish_session(&mut self, status: SessionStatus) -> Result<()> {
        self.set_status(status)?;
        let summary = match &self.session {
            Some(session) => session.summary(),
            None => return Ok(()),
        };
        tracing::info!(%status, outcome = %summary.outcome, "session finished");
        self.emit(EventKind::SessionFinished { summary });
        self.commit()?;

        if let Some(session) = &self.session {
            if let Err(e) = self.store.archive(&session.id) {
                tracing::warn!(session_id = %session.id, error = %e, "could not archive session");
            }
        }
        self.abort = CancellationToken::new();
        Ok(())
    }

    fn set_status(&mut self, status: SessionStatus) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::SessionNotActive)?;
        if session.status == status {
            return Ok(());
        }
        session.status = status;
        tracing::info!(session_id = %session.id, %status, "session status changed");
        self.emit(EventKind::StatusChanged { status });
        self.commit()
    }

    /// Keep a failing step from spinning: suspend and wait for the operator
    fn step_failed(&mut self, error: Error) {
        tracing::error!(error = %error, "session step failed, suspending");
        self.active_job = None;
        if let Some(session) = self.session.as_mut() {
            session.status = SessionStatus::Suspended;
        }
        self.emit(EventKind::StatusChanged {
            status: SessionStatus::Suspended,
        });
        if let Err(e) = self.commit() {
            tracing::error!(error = %e, "checkpoint failed");
            if let Some(session) = &self.session {
                self.shared.publish(session);
            }
        }
    }

    fn run_context(&self, session_id: &str, overrides: &BTreeMap<String, String>) -> RunContext {
        RunContext {
            session_id: session_id.to_string(),
            share_dir: self.store.share_dir(session_id),
            overrides: overrides.clone(),
            host: self.host.clone(),
            default_timeout: self.config.execution.default_job_timeout(),
        }
    }

    fn emit(&mut self, kind: EventKind) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.event_seq += 1;
        self.shared.push_event(Event {
            seq: session.event_seq,
            timestamp: Utc::now(),
            kind,
        });
    }

    fn emit_finished(&mut self, job_id: &str) {
        let Some(state) = self.session.as_ref().and_then(|s| s.state(job_id)) else {
            return;
        };
        let kind = EventKind::JobFinished {
            job_id: job_id.to_string(),
            outcome: state.outcome,
            reason: state.reason.clone(),
        };
        self.emit(kind);
    }

    fn commit(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::SessionNotActive)?;
        session.touch();
        self.store.save(session)?;
        self.shared.publish(session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ResolvedPlan;
    use crate::resource::ResourceMap;
    use crate::units::rfc822::Origin;

    fn job(id: &str, depends: &[&str]) -> JobUnit {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), id.to_string());
        fields.insert("plugin".to_string(), "shell".to_string());
        fields.insert("command".to_string(), "true".to_string());
        if !depends.is_empty() {
            fields.insert("depends".to_string(), depends.join(" "));
        }
        JobUnit::from_fields(&fields, Origin::synthetic("test"), None).unwrap()
    }

    fn session(jobs: Vec<JobUnit>) -> Session {
        let plan = ResolvedPlan {
            test_plan: "p".into(),
            jobs,
            resources: ResourceMap::new(),
            prerun: Vec::new(),
        };
        Session::new("s", plan, ExecutionMode::Automatic, SessionEnvironment::default())
    }

    #[test]
    fn test_rerun_candidates_follow_failed_dependencies() {
        let mut s = session(vec![job("a", &[]), job("b", &["a"]), job("c", &[]), job("d", &[])]);
        let finish = |s: &mut Session, id: &str, outcome: Outcome, attempts: u32| {
            let state = s.state_mut(id).unwrap();
            state.attempts = attempts;
            state.finish(outcome, None);
        };
        finish(&mut s, "a", Outcome::Failed, 1);
        finish(&mut s, "b", Outcome::NotSupported, 0);
        finish(&mut s, "c", Outcome::Crashed, 2);
        finish(&mut s, "d", Outcome::Passed, 1);

        let ids = |c: Vec<RerunCandidate>| c.into_iter().map(|c| c.job_id).collect::<Vec<_>>();
        assert_eq!(ids(rerun_candidates(&s, Some(2))), vec!["a", "b"]);
        assert_eq!(ids(rerun_candidates(&s, None)), vec!["a", "b", "c"]);
        // Once the dependency is out of attempts the dependent stays put
        assert!(rerun_candidates(&s, Some(1)).is_empty());
    }

    #[test]
    fn test_exit_classification() {
        assert_eq!(classify_exit(&ExitKind::Code(0)).0, Outcome::Passed);
        assert_eq!(classify_exit(&ExitKind::Code(2)).0, Outcome::Failed);
        assert_eq!(classify_exit(&ExitKind::Signal(11)).0, Outcome::Crashed);
        assert_eq!(classify_exit(&ExitKind::TimedOut).0, Outcome::Failed);
    }

    #[test]
    fn test_verdict_parsing() {
        assert_eq!("skip".parse::<Verdict>(), Ok(Verdict::Skip));
        assert!("maybe".parse::<Verdict>().is_err());
        assert_eq!("rerun".parse::<InFlightAction>(), Ok(InFlightAction::Rerun));
    }
}
