//! End-to-end session scenarios
//!
//! These tests drive the library the way the agent does:
//! 1. Unit files are written to a temporary directory
//! 2. A session is created and run by the engine, with real `/bin/sh` jobs or
//!    a scripted runner standing in for jobs that reboot or hang
//! 3. Reboots are simulated by killing the engine task and booting a new one
//!    on the same checkpoint directory

use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use certrig::common::config::{Config, UnitDir};
use certrig::exec::{ExitKind, JobRunner, OutputSink, ProcessRunner, RunReport, RunRequest};
use certrig::ipc::{AgentClient, Endpoint};
use certrig::session::{
    CheckpointStore, CreateSession, Engine, EngineHandle, EventKind, ExecutionMode,
    InFlightAction, Outcome, Resumption, SessionSnapshot, SessionStatus, SharedState, Verdict,
};
use certrig::units::Catalog;
use certrig::Result;

const NS: &str = "com.example";

/// Test context with a unit directory and a checkpoint directory
struct TestContext {
    dir: TempDir,
    config: Config,
}

impl TestContext {
    fn new(units: &str) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let unit_dir = dir.path().join("units");
        fs::create_dir_all(&unit_dir).expect("Failed to create unit dir");
        fs::write(unit_dir.join("test.pxu"), units).expect("Failed to write units");

        let mut config = Config::default();
        config.units.dirs = vec![UnitDir {
            path: unit_dir,
            namespace: NS.to_string(),
        }];
        config.storage.dir = Some(dir.path().join("sessions"));
        config.execution.shell = "/bin/sh".to_string();

        Self { dir, config }
    }

    fn store(&self) -> CheckpointStore {
        CheckpointStore::new(self.dir.path().join("sessions"))
    }

    fn catalog(&self) -> Catalog {
        let (catalog, errors) = Catalog::from_config(&self.config.units);
        assert!(errors.is_empty(), "unit errors: {:?}", errors);
        catalog
    }

    /// A fresh engine on this context's storage, as after a reboot
    fn engine(&self, runner: Arc<dyn JobRunner>) -> (Engine, Arc<SharedState>) {
        let boot_id = uuid::Uuid::new_v4().to_string();
        let shared = Arc::new(SharedState::new(boot_id, 1000));
        let engine = Engine::new(
            self.config.clone(),
            self.store(),
            runner,
            shared.clone(),
            CancellationToken::new(),
        );
        (engine, shared)
    }

    /// Create a session from the unit directory and start the engine
    async fn start(
        &self,
        runner: Arc<dyn JobRunner>,
        plan: &str,
        mode: ExecutionMode,
    ) -> (EngineHandle, tokio::task::JoinHandle<()>) {
        let (mut engine, _) = self.engine(runner);
        engine.boot().expect("boot failed");
        let request = CreateSession {
            test_plan: format!("{}::{}", NS, plan),
            mode,
            ..CreateSession::default()
        };
        engine
            .create_from_catalog(&self.catalog(), request)
            .await
            .expect("session creation failed");
        engine.spawn()
    }
}

fn sh() -> Arc<dyn JobRunner> {
    Arc::new(ProcessRunner::new("/bin/sh"))
}

/// Poll the published state until `pred` holds
async fn wait_until(
    shared: &SharedState,
    what: &str,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let snapshot = shared.snapshot();
        if pred(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}: {:#?}", what, snapshot.session);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn status_is(status: SessionStatus) -> impl Fn(&SessionSnapshot) -> bool {
    move |s| s.session.as_ref().is_some_and(|s| s.status == status)
}

fn outcome_of(snapshot: &SessionSnapshot, job: &str) -> Option<Outcome> {
    snapshot
        .session
        .as_ref()
        .and_then(|s| s.outcome(&format!("{}::{}", NS, job)))
}

/// Stands in for job commands: `hang` never returns, `fail` exits 1
#[derive(Default)]
struct ScriptedRunner;

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn run(
        &self,
        request: RunRequest,
        _output: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let exit = match request.command.as_str() {
            "hang" => {
                // Power is cut while this runs; only an abort ends it
                cancel.cancelled().await;
                ExitKind::Aborted
            }
            "fail" => ExitKind::Code(1),
            _ => ExitKind::Code(0),
        };
        Ok(RunReport {
            exit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration: Duration::ZERO,
        })
    }
}

const DEVICES: &str = r"id: device
plugin: resource
command: printf 'name: cam\nbus: usb\n\nname: nic\nbus: pci\n\nname: key\nbus: usb\n'

unit: template
template-resource: device
template-filter: device.bus == 'usb'
id: probe_{name}
plugin: shell
command: echo probing {name}

unit: test plan
id: probes
include: probe_.*
";

#[tokio::test]
async fn test_template_jobs_run_against_real_shell() {
    let ctx = TestContext::new(DEVICES);
    let (handle, _task) = ctx.start(sh(), "probes", ExecutionMode::Automatic).await;
    let snapshot = handle.shared().snapshot();
    let session = snapshot.session.clone().unwrap();
    assert_eq!(
        session.jobs.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(),
        vec![
            "com.example::device",
            "com.example::probe_cam",
            "com.example::probe_key"
        ]
    );
    // The resource job already ran while the plan was resolved
    assert_eq!(outcome_of(&snapshot, "device"), Some(Outcome::Passed));

    handle.start_run(None).await.unwrap();
    let done = wait_until(handle.shared(), "completion", status_is(SessionStatus::Completed)).await;
    let session = done.session.unwrap();
    let summary = session.summary();
    assert_eq!(summary.passed, 3);
    assert_eq!(summary.outcome, "passed");

    let log = ctx
        .store()
        .archive_dir()
        .join(&session.id)
        .join("io-logs")
        .join("com.example__probe_cam.log");
    assert_eq!(fs::read_to_string(log).unwrap().trim(), "probing cam");

    let page = handle.shared().events_after(0, None);
    assert!(page.events.iter().any(|e| matches!(
        &e.kind,
        EventKind::OutputChunk { data, .. } if data.contains("probing key")
    )));
    assert!(matches!(
        page.events.last().map(|e| &e.kind),
        Some(EventKind::SessionFinished { .. })
    ));
}

const REBOOT: &str = "id: first
plugin: shell
command: true

id: reboot
plugin: shell
command: hang
flags: noreturn
after: first

id: last
plugin: shell
command: true
after: reboot

unit: test plan
id: power
include: .*
";

#[tokio::test]
async fn test_noreturn_job_resumes_after_reboot() {
    let ctx = TestContext::new(REBOOT);
    let (handle, task) = ctx
        .start(Arc::new(ScriptedRunner), "power", ExecutionMode::Interactive)
        .await;
    handle.start_run(None).await.unwrap();
    let before = wait_until(handle.shared(), "reboot job to start", |s| {
        outcome_of(s, "reboot") == Some(Outcome::Running)
    })
    .await;
    let seq_before = before.seq;

    // The machine goes down with the job in flight
    task.abort();
    let _ = task.await;
    let on_disk = ctx.store().load_current().unwrap().unwrap();
    assert_eq!(on_disk.outcome("com.example::reboot"), Some(Outcome::Running));

    let (mut engine, shared) = ctx.engine(Arc::new(ScriptedRunner));
    let resumption = engine.boot().unwrap();
    assert_eq!(
        resumption,
        Resumption::ExpectedTermination {
            job_id: "com.example::reboot".into()
        }
    );
    let (_handle, _task) = engine.spawn();

    let done = wait_until(&shared, "completion", status_is(SessionStatus::Completed)).await;
    assert_eq!(outcome_of(&done, "first"), Some(Outcome::Passed));
    assert_eq!(outcome_of(&done, "reboot"), Some(Outcome::Passed));
    assert_eq!(outcome_of(&done, "last"), Some(Outcome::Passed));
    // Event numbering continues where the checkpoint left off
    let page = shared.events_after(0, None);
    assert!(page.events.first().unwrap().seq > seq_before);
    // The first job ran exactly once
    let first = done.session.unwrap();
    assert_eq!(first.state("com.example::first").unwrap().attempts, 1);
}

const CRASHY: &str = "id: crashes
plugin: shell
command: hang

id: after
plugin: shell
command: true
after: crashes

unit: test plan
id: p
include: .*
";

#[tokio::test]
async fn test_automatic_crash_is_recorded_and_run_continues() {
    let ctx = TestContext::new(CRASHY);
    let (handle, task) = ctx
        .start(Arc::new(ScriptedRunner), "p", ExecutionMode::Automatic)
        .await;
    handle.start_run(None).await.unwrap();
    wait_until(handle.shared(), "job to start", |s| {
        outcome_of(s, "crashes") == Some(Outcome::Running)
    })
    .await;
    task.abort();
    let _ = task.await;

    let (mut engine, shared) = ctx.engine(Arc::new(ScriptedRunner));
    assert!(matches!(
        engine.boot().unwrap(),
        Resumption::Crashed {
            ambiguous: false,
            ..
        }
    ));
    let (_handle, _task) = engine.spawn();

    let done = wait_until(&shared, "completion", status_is(SessionStatus::Completed)).await;
    assert_eq!(outcome_of(&done, "crashes"), Some(Outcome::Crashed));
    assert_eq!(outcome_of(&done, "after"), Some(Outcome::Passed));
    assert_eq!(done.session.unwrap().summary().outcome, "failed");
}

#[tokio::test]
async fn test_interactive_crash_waits_for_operator_decision() {
    let ctx = TestContext::new(CRASHY);
    let (handle, task) = ctx
        .start(Arc::new(ScriptedRunner), "p", ExecutionMode::Interactive)
        .await;
    handle.start_run(None).await.unwrap();
    wait_until(handle.shared(), "job to start", |s| {
        outcome_of(s, "crashes") == Some(Outcome::Running)
    })
    .await;
    task.abort();
    let _ = task.await;

    let (mut engine, shared) = ctx.engine(Arc::new(ScriptedRunner));
    engine.boot().unwrap();
    let (handle, _task) = engine.spawn();
    let suspended = shared.snapshot();
    assert_eq!(
        suspended.session.as_ref().unwrap().status,
        SessionStatus::Suspended
    );
    assert_eq!(outcome_of(&suspended, "crashes"), Some(Outcome::Running));

    handle.start_run(Some(InFlightAction::Pass)).await.unwrap();
    let done = wait_until(&shared, "completion", status_is(SessionStatus::Completed)).await;
    assert_eq!(outcome_of(&done, "crashes"), Some(Outcome::Passed));
    assert_eq!(outcome_of(&done, "after"), Some(Outcome::Passed));
}

#[tokio::test]
async fn test_abort_while_waiting_for_operator_fails_job_left_in_flight() {
    let ctx = TestContext::new(CRASHY);
    let (handle, task) = ctx
        .start(Arc::new(ScriptedRunner), "p", ExecutionMode::Interactive)
        .await;
    handle.start_run(None).await.unwrap();
    wait_until(handle.shared(), "job to start", |s| {
        outcome_of(s, "crashes") == Some(Outcome::Running)
    })
    .await;
    task.abort();
    let _ = task.await;

    let (mut engine, shared) = ctx.engine(Arc::new(ScriptedRunner));
    engine.boot().unwrap();
    let (handle, _task) = engine.spawn();
    assert_eq!(
        shared.snapshot().session.unwrap().status,
        SessionStatus::Suspended
    );

    assert_eq!(handle.abort().await.unwrap(), SessionStatus::Aborted);
    let done = wait_until(&shared, "abort", status_is(SessionStatus::Aborted)).await;
    let session = done.session.as_ref().unwrap();
    let crashes = session.state("com.example::crashes").unwrap();
    assert_eq!(crashes.outcome, Outcome::Failed);
    assert_eq!(crashes.reason.as_deref(), Some("aborted by operator"));
    let summary = session.summary();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.pending, 1);
    assert_eq!(outcome_of(&done, "after"), Some(Outcome::Pending));
}

const CHAIN: &str = "id: a
plugin: shell
command: exit 3

id: b
plugin: shell
command: true
after: a

id: d
plugin: shell
command: true
depends: a

unit: test plan
id: chain
include: .*
";

#[tokio::test]
async fn test_failed_dependency_makes_dependents_not_supported() {
    let ctx = TestContext::new(CHAIN);
    let (handle, _task) = ctx.start(sh(), "chain", ExecutionMode::Automatic).await;
    handle.start_run(None).await.unwrap();

    let done = wait_until(handle.shared(), "completion", status_is(SessionStatus::Completed)).await;
    let session = done.session.as_ref().unwrap();
    let a = session.state("com.example::a").unwrap();
    assert_eq!(a.outcome, Outcome::Failed);
    assert_eq!(a.return_code, Some(3));
    assert_eq!(outcome_of(&done, "b"), Some(Outcome::Passed));
    let d = session.state("com.example::d").unwrap();
    assert_eq!(d.outcome, Outcome::NotSupported);
    assert!(d.reason.as_deref().unwrap().contains("com.example::a"));
    assert_eq!(session.summary().outcome, "failed");
}

const OUT_OF_ORDER: &str = "id: d
plugin: shell
command: true
depends: a b
after: c

id: c
plugin: shell
command: true

id: b
plugin: shell
command: true

id: a
plugin: shell
command: true

unit: test plan
id: p
include: .*
";

#[tokio::test]
async fn test_job_runs_after_its_prerequisites_whatever_the_declaration_order() {
    let ctx = TestContext::new(OUT_OF_ORDER);
    let (handle, _task) = ctx.start(sh(), "p", ExecutionMode::Automatic).await;
    handle.start_run(None).await.unwrap();

    let done = wait_until(handle.shared(), "completion", status_is(SessionStatus::Completed)).await;
    let session = done.session.as_ref().unwrap();
    assert_eq!(session.summary().passed, 4);

    let started: Vec<String> = handle
        .shared()
        .events_after(0, None)
        .events
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::JobStarted { job_id, .. } => Some(job_id),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 4);
    assert_eq!(started.last().map(String::as_str), Some("com.example::d"));

    let d_started = session.state("com.example::d").unwrap().started_at.unwrap();
    for job in ["a", "b", "c"] {
        let finished = session
            .state(&format!("{}::{}", NS, job))
            .unwrap()
            .finished_at
            .unwrap();
        assert!(finished <= d_started, "{} finished after d started", job);
    }
}

const STUCK: &str = "id: stuck
plugin: shell
command: sleep 30
timeout: 1

id: next
plugin: shell
command: true
after: stuck

unit: test plan
id: p
include: .*
";

#[tokio::test]
async fn test_job_timeout_fails_job_and_run_continues() {
    let ctx = TestContext::new(STUCK);
    let (handle, _task) = ctx.start(sh(), "p", ExecutionMode::Automatic).await;
    handle.start_run(None).await.unwrap();

    let done = wait_until(handle.shared(), "completion", status_is(SessionStatus::Completed)).await;
    let session = done.session.as_ref().unwrap();
    let stuck = session.state("com.example::stuck").unwrap();
    assert_eq!(stuck.outcome, Outcome::Failed);
    let reason = stuck.reason.as_deref().unwrap();
    assert!(reason.contains("time limit of 1 seconds"), "reason: {}", reason);
    assert_eq!(outcome_of(&done, "next"), Some(Outcome::Passed));
    assert_eq!(session.summary().outcome, "failed");
}

#[tokio::test]
async fn test_failed_resolution_leaves_no_session_behind() {
    let ctx = TestContext::new(CHAIN);
    let (mut engine, _) = ctx.engine(sh());
    engine.boot().unwrap();
    let err = engine
        .create_from_catalog(
            &ctx.catalog(),
            CreateSession {
                test_plan: "com.example::missing".into(),
                ..CreateSession::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, certrig::Error::UnknownUnit(_)));

    let sessions = ctx.dir.path().join("sessions");
    let leftovers: Vec<_> = fs::read_dir(&sessions)
        .map(|entries| entries.flatten().map(|e| e.file_name()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
    assert!(ctx.store().load_current().unwrap().is_none());
}

#[tokio::test]
async fn test_exclude_override_drops_jobs() {
    let ctx = TestContext::new(CHAIN);
    let (mut engine, _) = ctx.engine(sh());
    engine.boot().unwrap();
    let mut request = CreateSession {
        test_plan: "com.example::chain".into(),
        mode: ExecutionMode::Automatic,
        ..CreateSession::default()
    };
    request.overrides.exclude = vec!["b".into()];
    let info = engine
        .create_from_catalog(&ctx.catalog(), request)
        .await
        .unwrap();
    assert_eq!(info.jobs, vec!["com.example::a", "com.example::d"]);
}

const MANUAL: &str = "id: speaker
plugin: manual
_summary: Speaker test
_purpose: Check that the speaker plays sound

unit: test plan
id: audio
include: speaker
";

#[tokio::test]
async fn test_verdict_then_rerun_of_failed_job() {
    let ctx = TestContext::new(MANUAL);
    let (handle, _task) = ctx
        .start(Arc::new(ScriptedRunner), "audio", ExecutionMode::Interactive)
        .await;
    handle.start_run(None).await.unwrap();

    let asked = wait_until(handle.shared(), "verdict prompt", |s| {
        s.awaiting_verdict.is_some()
    })
    .await;
    let request = asked.awaiting_verdict.unwrap();
    assert_eq!(request.job_id, "com.example::speaker");

    // Answering for another job is refused
    assert!(handle
        .submit_verdict("com.example::other".into(), Verdict::Pass, None)
        .await
        .is_err());
    handle
        .submit_verdict(request.job_id.clone(), Verdict::Fail, Some("no sound".into()))
        .await
        .unwrap();

    // A failure in an interactive session stops to offer a rerun
    let offered = wait_until(handle.shared(), "rerun offer", status_is(SessionStatus::Suspended)).await;
    let state = offered.session.as_ref().unwrap().state("com.example::speaker").unwrap();
    assert_eq!(state.outcome, Outcome::Failed);
    assert_eq!(state.comment.as_deref(), Some("no sound"));
    assert_eq!(handle.rerun_candidates().unwrap().len(), 1);

    assert_eq!(handle.rerun(Vec::new()).await.unwrap(), vec!["com.example::speaker"]);
    handle.start_run(None).await.unwrap();
    wait_until(handle.shared(), "second prompt", |s| s.awaiting_verdict.is_some()).await;
    handle
        .submit_verdict(request.job_id, Verdict::Pass, None)
        .await
        .unwrap();

    let done = wait_until(handle.shared(), "completion", status_is(SessionStatus::Completed)).await;
    let session = done.session.unwrap();
    assert_eq!(session.state("com.example::speaker").unwrap().attempts, 2);
    assert_eq!(session.summary().outcome, "passed");
}

const SLOW: &str = "id: slow
plugin: shell
command: sleep 30

id: never
plugin: shell
command: true
after: slow

unit: test plan
id: p
include: .*
";

#[tokio::test]
async fn test_abort_kills_running_job() {
    let ctx = TestContext::new(SLOW);
    let (handle, _task) = ctx.start(sh(), "p", ExecutionMode::Automatic).await;
    handle.start_run(None).await.unwrap();
    wait_until(handle.shared(), "job to start", |s| {
        outcome_of(s, "slow") == Some(Outcome::Running)
    })
    .await;

    handle.abort().await.unwrap();
    let done = wait_until(handle.shared(), "abort", status_is(SessionStatus::Aborted)).await;
    let session = done.session.as_ref().unwrap();
    let slow = session.state("com.example::slow").unwrap();
    assert_eq!(slow.outcome, Outcome::Failed);
    assert_eq!(slow.reason.as_deref(), Some("aborted by operator"));
    assert_eq!(outcome_of(&done, "never"), Some(Outcome::Pending));
    assert!(ctx.store().load_current().unwrap().is_none());
}

const TWO_STEPS: &str = "id: one
plugin: shell
command: sleep 1

id: two
plugin: shell
command: true
after: one

unit: test plan
id: p
include: .*
";

#[tokio::test]
async fn test_pause_takes_effect_after_current_job() {
    let ctx = TestContext::new(TWO_STEPS);
    let (handle, _task) = ctx.start(sh(), "p", ExecutionMode::Automatic).await;
    // Nothing is running yet
    assert!(handle.pause().await.is_err());

    handle.start_run(None).await.unwrap();
    wait_until(handle.shared(), "job to start", |s| {
        outcome_of(s, "one") == Some(Outcome::Running)
    })
    .await;
    assert_eq!(handle.pause().await.unwrap(), SessionStatus::Running);

    let paused = wait_until(handle.shared(), "pause", status_is(SessionStatus::Suspended)).await;
    assert_eq!(outcome_of(&paused, "one"), Some(Outcome::Passed));
    assert_eq!(outcome_of(&paused, "two"), Some(Outcome::Pending));

    handle.start_run(None).await.unwrap();
    let done = wait_until(handle.shared(), "completion", status_is(SessionStatus::Completed)).await;
    assert_eq!(outcome_of(&done, "two"), Some(Outcome::Passed));
}

#[tokio::test]
async fn test_second_session_is_refused_while_one_is_active() {
    let ctx = TestContext::new(CHAIN);
    let (handle, _task) = ctx
        .start(Arc::new(ScriptedRunner), "chain", ExecutionMode::Automatic)
        .await;
    let err = handle
        .create(CreateSession {
            test_plan: "com.example::chain".into(),
            ..CreateSession::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, certrig::Error::SessionAlreadyActive));
}

#[tokio::test]
async fn test_controller_reattaches_over_tcp() {
    let ctx = TestContext::new(CHAIN);
    let agent = certrig::agent::Agent::start(ctx.config.clone(), Arc::new(ScriptedRunner))
        .await
        .unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
    let server = tokio::spawn(agent.serve(None, Some(listener)));

    let mut client = AgentClient::connect(&endpoint).await.unwrap();
    let plans = client.list_test_plans().await.unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].id, "com.example::chain");

    let info = client
        .create_session(CreateSession {
            test_plan: "com.example::chain".into(),
            mode: ExecutionMode::Automatic,
            ..CreateSession::default()
        })
        .await
        .unwrap();
    assert_eq!(info.jobs.len(), 3);
    let boot_id = client.query_state().await.unwrap().boot_id;
    client.start_run(None).await.unwrap();

    // The first controller goes away; a new one replays from the start
    drop(client);
    let mut client = AgentClient::connect(&endpoint).await.unwrap();
    let mut seq = 0;
    let mut finished = false;
    for _ in 0..50 {
        let page = client
            .events(seq, Some(boot_id.clone()), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!page.resync);
        for event in page.events {
            assert!(event.seq > seq);
            seq = event.seq;
            if matches!(event.kind, EventKind::SessionFinished { .. }) {
                finished = true;
            }
        }
        if finished {
            break;
        }
    }
    assert!(finished);

    // A stale boot id means the controller must resync from the snapshot
    let page = client
        .events(0, Some("previous-boot".into()), Duration::ZERO)
        .await
        .unwrap();
    assert!(page.resync);
    let snapshot = client.query_state().await.unwrap();
    assert_eq!(
        snapshot.session.unwrap().status,
        SessionStatus::Completed
    );

    client.shutdown().await.unwrap();
    server.await.unwrap().unwrap();
}

#[test]
fn test_validate_reports_dependency_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let units = dir.path().join("cycle.pxu");
    fs::write(
        &units,
        "id: a\nplugin: shell\ncommand: true\ndepends: b\n\nid: b\nplugin: shell\ncommand: true\ndepends: a\n",
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_certrig"))
        .arg("validate")
        .arg(&units)
        .env("XDG_CONFIG_HOME", dir.path())
        .env("HOME", dir.path())
        .output()
        .expect("Failed to run certrig");
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cycle"), "stdout: {}", stdout);
}

#[test]
fn test_validate_accepts_good_units() {
    let dir = tempfile::tempdir().unwrap();
    let units: PathBuf = dir.path().join("units");
    fs::create_dir_all(&units).unwrap();
    fs::write(units.join("good.pxu"), DEVICES).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_certrig"))
        .arg("validate")
        .arg(&units)
        .env("XDG_CONFIG_HOME", dir.path())
        .env("HOME", dir.path())
        .output()
        .expect("Failed to run certrig");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 templates"), "stdout: {}", stdout);
}
