//! CLI command handling
//!
//! Dispatches controller commands to the agent and formats output.

mod spawn;

use colored::{ColoredString, Colorize};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::io::{BufRead, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::commands::Commands;
use crate::common::{config::Config, logging, Error, Result};
use crate::ipc::{AgentClient, Endpoint};
use crate::plan::PlanOverrides;
use crate::session::{
    CreateSession, Event, EventKind, ExecutionMode, Outcome, SessionSnapshot, SessionStatus,
    SessionSummary, Verdict, VerdictRequest,
};
use crate::units::{Catalog, JobUnit, UnitSource};

/// Dispatch a controller command
pub async fn dispatch(command: Commands, endpoint: Endpoint) -> Result<()> {
    let config = Config::load()?;

    match command {
        Commands::Agent => {
            // Should never happen - agent mode is handled in main
            unreachable!("Agent command should be handled in main")
        }

        Commands::Plans => {
            let mut client = connect(&endpoint).await?;
            let plans = client.list_test_plans().await?;
            if plans.is_empty() {
                println!("No test plans found. Add unit directories to the configuration.");
            }
            for plan in plans {
                match plan.name {
                    Some(name) => println!("{}  {}", plan.id.bold(), name),
                    None => println!("{}", plan.id.bold()),
                }
            }
            Ok(())
        }

        Commands::Start {
            test_plan,
            automatic,
            exclude,
            only,
            environment,
            manifest,
            run,
        } => {
            let mut client = connect(&endpoint).await?;
            let request = CreateSession {
                test_plan,
                mode: if automatic {
                    ExecutionMode::Automatic
                } else {
                    ExecutionMode::Interactive
                },
                overrides: PlanOverrides {
                    exclude,
                    only: (!only.is_empty()).then_some(only),
                },
                environment: environment.into_iter().collect::<BTreeMap<_, _>>(),
                manifest: manifest.into_iter().collect::<BTreeMap<_, _>>(),
            };

            let info = client.create_session(request).await?;
            println!(
                "Created session {} for {} ({} jobs)",
                info.session_id.bold(),
                info.test_plan,
                info.jobs.len()
            );
            for (i, job_id) in info.jobs.iter().enumerate() {
                println!("  {:>3}. {}", i + 1, job_id);
            }

            if run {
                client.start_run(None).await?;
                println!("Running. Use 'certrig watch' to follow the session.");
            } else {
                println!("Use 'certrig run' to start the jobs.");
            }
            Ok(())
        }

        Commands::Run { in_flight } => {
            let mut client = connect(&endpoint).await?;
            let status = client.start_run(in_flight).await?;
            println!("Session is {}", status);
            Ok(())
        }

        Commands::Pause => {
            let mut client = connect(&endpoint).await?;
            match client.pause().await? {
                SessionStatus::Running => println!("Pausing after the current job"),
                status => println!("Session is {}", status),
            }
            Ok(())
        }

        Commands::Watch => watch(&endpoint, &config).await,

        Commands::Status { json } => {
            let mut client = match AgentClient::connect(&endpoint).await {
                Ok(client) => client,
                Err(Error::AgentNotRunning) => {
                    println!("Agent is not running");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let snapshot = client.query_state().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot(&snapshot);
            }
            Ok(())
        }

        Commands::Verdict {
            job_id,
            verdict,
            comment,
        } => {
            let mut client = connect(&endpoint).await?;
            client.submit_verdict(&job_id, verdict, comment).await?;
            println!("Recorded {} for {}", verdict, job_id);
            Ok(())
        }

        Commands::Abort => {
            let mut client = connect(&endpoint).await?;
            client.abort().await?;
            println!("Session aborted");
            Ok(())
        }

        Commands::Rerun { job_ids, list } => {
            let mut client = connect(&endpoint).await?;
            if list {
                let candidates = client.rerun_candidates().await?;
                if candidates.is_empty() {
                    println!("Nothing to rerun");
                }
                for c in candidates {
                    println!(
                        "  {} {} ({} attempts)",
                        paint(c.outcome),
                        c.job_id,
                        c.attempts
                    );
                }
                return Ok(());
            }

            let rearmed = client.rerun(job_ids).await?;
            if rearmed.is_empty() {
                println!("Nothing to rerun");
            } else {
                println!("Re-armed {} jobs. Use 'certrig run' to run them.", rearmed.len());
            }
            Ok(())
        }

        Commands::Validate { paths, namespace } => validate(&paths, &namespace),

        Commands::Logs {
            lines,
            follow,
            clear,
        } => logs(lines, follow, clear).await,

        Commands::Shutdown => {
            let mut client = match AgentClient::connect(&endpoint).await {
                Ok(client) => client,
                Err(Error::AgentNotRunning) => {
                    println!("Agent is not running");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            client.shutdown().await?;
            println!("Agent stopped");
            Ok(())
        }
    }
}

/// Connect to the agent, spawning a local one if needed
async fn connect(endpoint: &Endpoint) -> Result<AgentClient> {
    spawn::ensure_agent_running(endpoint).await?;
    AgentClient::connect(endpoint).await
}

/// Keep trying to reach the agent until `timeout` elapses
async fn reconnect(endpoint: &Endpoint, timeout: Duration) -> Result<AgentClient> {
    let deadline = Instant::now() + timeout;
    loop {
        match AgentClient::connect(endpoint).await {
            Ok(client) => return Ok(client),
            Err(Error::AgentNotRunning | Error::AgentConnectionFailed(_)) => {}
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout(timeout.as_secs()));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn is_connection_error(e: &Error) -> bool {
    matches!(
        e,
        Error::Transport(_) | Error::AgentNotRunning | Error::AgentConnectionFailed(_)
    )
}

/// Follow the session until it finishes, surviving agent restarts
async fn watch(endpoint: &Endpoint, config: &Config) -> Result<()> {
    let reconnect_timeout = Duration::from_secs(config.controller.reconnect_timeout_secs);
    let poll = Duration::from_secs(config.controller.poll_timeout_secs);

    let mut client = connect(endpoint).await?;
    let mut snapshot = client.query_state().await?;
    let mut seq = snapshot.seq;
    let mut boot_id = snapshot.boot_id.clone();

    print_snapshot(&snapshot);
    if watch_is_over(&snapshot) {
        return Ok(());
    }
    if let Some(request) = snapshot.awaiting_verdict.clone() {
        ask_verdict(&mut client, &request).await?;
    }

    loop {
        let page = match client.events(seq, Some(boot_id.clone()), poll).await {
            Ok(page) => page,
            Err(e) if is_connection_error(&e) => {
                eprintln!("{} {}; reconnecting...", "Lost connection to agent:".yellow(), e);
                client = reconnect(endpoint, reconnect_timeout).await?;
                // The checkpoint is the source of truth after a gap
                snapshot = client.query_state().await?;
                seq = snapshot.seq;
                boot_id = snapshot.boot_id.clone();
                eprintln!("{}", "Reconnected".green());
                print_snapshot(&snapshot);
                if watch_is_over(&snapshot) {
                    return Ok(());
                }
                if let Some(request) = snapshot.awaiting_verdict.clone() {
                    ask_verdict(&mut client, &request).await?;
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        if page.resync {
            snapshot = client.query_state().await?;
            seq = snapshot.seq;
            boot_id = snapshot.boot_id.clone();
            println!("{}", "(resynchronized with the agent)".dimmed());
            print_snapshot(&snapshot);
            if watch_is_over(&snapshot) {
                return Ok(());
            }
            if let Some(request) = snapshot.awaiting_verdict.clone() {
                ask_verdict(&mut client, &request).await?;
            }
            continue;
        }

        for event in page.events {
            seq = event.seq;
            print_event(&event);
            match &event.kind {
                EventKind::VerdictRequested { job_id, prompt } => {
                    let request = VerdictRequest {
                        job_id: job_id.clone(),
                        prompt: prompt.clone(),
                    };
                    ask_verdict(&mut client, &request).await?;
                }
                EventKind::SessionFinished { .. } => return Ok(()),
                EventKind::StatusChanged {
                    status: SessionStatus::Suspended,
                } => {
                    println!("Session suspended. Use 'certrig run' or 'certrig rerun' to continue.");
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

fn watch_is_over(snapshot: &SessionSnapshot) -> bool {
    match &snapshot.session {
        None => true,
        Some(session) => session.status.is_finished(),
    }
}

/// Prompt on stdin until a valid verdict is entered and accepted
async fn ask_verdict(client: &mut AgentClient, request: &VerdictRequest) -> Result<()> {
    println!();
    println!("{}", request.prompt);
    loop {
        println!("{}", "Verdict for this job: pass, fail or skip, optionally followed by a comment".cyan());
        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

        let line = line.trim();
        let (word, comment) = match line.split_once(char::is_whitespace) {
            Some((word, comment)) => (word, Some(comment.trim().to_string())),
            None => (line, None),
        };
        let verdict: Verdict = match word.parse() {
            Ok(verdict) => verdict,
            Err(e) => {
                println!("{}", e.red());
                continue;
            }
        };

        match client.submit_verdict(&request.job_id, verdict, comment).await {
            Ok(()) => return Ok(()),
            // Someone else answered or the job moved on
            Err(Error::Rejected(e)) if e.code == "INVALID_STATE" => {
                println!("{}", "The agent is no longer waiting for this verdict".yellow());
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

fn paint(outcome: Outcome) -> ColoredString {
    let text = outcome.to_string();
    match outcome {
        Outcome::Passed => text.green(),
        Outcome::Failed | Outcome::Crashed => text.red(),
        Outcome::NotSupported => text.yellow(),
        Outcome::Skipped => text.blue(),
        Outcome::Running => text.cyan(),
        Outcome::Pending => text.dimmed(),
    }
}

fn print_summary(summary: &SessionSummary) {
    let outcome = if summary.outcome == "passed" {
        summary.outcome.green().bold()
    } else {
        summary.outcome.red().bold()
    };
    println!(
        "Result: {}  ({} total, {} passed, {} failed, {} crashed, {} skipped, {} not supported, {} pending)",
        outcome,
        summary.total,
        summary.passed,
        summary.failed,
        summary.crashed,
        summary.skipped,
        summary.not_supported,
        summary.pending
    );
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    let Some(session) = &snapshot.session else {
        println!("No session. Use 'certrig start <test-plan>' to create one.");
        return;
    };

    println!(
        "Session {}  plan {}  {}  ({})",
        session.id.bold(),
        session.test_plan,
        session.status.to_string().bold(),
        session.mode
    );
    for (i, job) in session.jobs.iter().enumerate() {
        let Some(state) = session.state(&job.id) else {
            continue;
        };
        let mut line = format!("  {:>3}. {:<14} {}", i + 1, paint(state.outcome), job.id);
        if let Some(reason) = &state.reason {
            line.push_str(&format!(" {}", format!("({})", reason).dimmed()));
        }
        println!("{}", line);
    }
    if let Some(request) = &snapshot.awaiting_verdict {
        println!("Waiting for a verdict on {}", request.job_id.bold());
    }
    if session.status.is_finished() {
        print_summary(&session.summary());
    }
}

fn print_event(event: &Event) {
    match &event.kind {
        EventKind::SessionCreated {
            session_id, jobs, ..
        } => println!("Session {} created with {} jobs", session_id, jobs),
        EventKind::StatusChanged { status } => {
            println!("{}", format!("Session is now {}", status).dimmed())
        }
        EventKind::JobStarted {
            job_id, attempt, ..
        } => {
            if *attempt > 1 {
                println!("{} {} (attempt {})", "▶".cyan(), job_id.bold(), attempt);
            } else {
                println!("{} {}", "▶".cyan(), job_id.bold());
            }
        }
        EventKind::OutputChunk { data, .. } => print!("{}", data),
        EventKind::JobFinished {
            job_id,
            outcome,
            reason,
        } => match reason {
            Some(reason) => println!("  {} {} {}", paint(*outcome), job_id, format!("({})", reason).dimmed()),
            None => println!("  {} {}", paint(*outcome), job_id),
        },
        EventKind::VerdictRequested { .. } => {}
        EventKind::SessionFinished { summary } => print_summary(summary),
    }
}

/// Load unit files locally and report problems
fn validate(paths: &[std::path::PathBuf], namespace: &str) -> Result<()> {
    let mut sources = Vec::new();
    let mut problems = 0usize;
    for path in paths {
        let read = if path.is_dir() {
            UnitSource::scan_dir(path, namespace)
        } else {
            UnitSource::read(path, Some(namespace)).map(|s| vec![s])
        };
        match read {
            Ok(found) => sources.extend(found),
            Err(e) => {
                problems += 1;
                println!("{} {}", "✗".red(), e);
            }
        }
    }

    let (catalog, errors) = Catalog::load_each(&sources);
    for error in &errors {
        problems += 1;
        println!("{} {}", "✗".red(), error);
    }

    let jobs: IndexMap<String, JobUnit> = catalog
        .jobs()
        .map(|job| (job.id.clone(), job.clone()))
        .collect();
    if let Err(e) = crate::plan::order(&jobs) {
        problems += 1;
        println!("{} {}", "✗".red(), e);
    }

    println!(
        "{} files: {} jobs, {} templates, {} test plans",
        sources.len(),
        jobs.len(),
        catalog.templates().count(),
        catalog.test_plans().count()
    );
    if problems > 0 {
        return Err(Error::Config(format!("{} problems found", problems)));
    }
    println!("{} No problems found", "✓".green());
    Ok(())
}

async fn logs(lines: usize, follow: bool, clear: bool) -> Result<()> {
    let Some(path) = logging::agent_log_path() else {
        return Err(Error::Config("cannot determine the log directory".into()));
    };

    if clear {
        logging::truncate_agent_log()?;
        println!("Agent log cleared");
        return Ok(());
    }

    if !path.exists() {
        println!("No agent log at {}", path.display());
        return Ok(());
    }

    let content = std::fs::read_to_string(&path)?;
    let all: Vec<&str> = content.lines().collect();
    for line in &all[all.len().saturating_sub(lines)..] {
        println!("{}", line);
    }

    if follow {
        follow_file(&path, content.len() as u64).await?;
    }
    Ok(())
}

async fn follow_file(path: &Path, mut offset: u64) -> Result<()> {
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        if len < offset {
            // Truncated by `logs --clear`
            offset = 0;
        }
        if len == offset {
            continue;
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        offset = len;
        print!("{}", buf);
    }
}
