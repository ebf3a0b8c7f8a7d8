//! CLI command definitions
//!
//! Defines the clap commands for the certrig controller.

use clap::Subcommand;
use std::path::PathBuf;

use crate::session::{InFlightAction, Verdict};

#[derive(Subcommand)]
pub enum Commands {
    /// Run the resident agent that executes sessions
    Agent,

    /// List the test plans the agent knows about
    Plans,

    /// Create a session for a test plan
    Start {
        /// Test plan id
        test_plan: String,

        /// Nobody is watching: skip jobs that need an operator
        #[arg(long)]
        automatic: bool,

        /// Additional exclude pattern (regex); can be repeated
        #[arg(long, short = 'x')]
        exclude: Vec<String>,

        /// Run only these jobs (full or partial ids); can be repeated
        #[arg(long)]
        only: Vec<String>,

        /// Environment variable for every job, as KEY=VALUE
        #[arg(long = "env", short = 'e', value_parser = parse_key_value)]
        environment: Vec<(String, String)>,

        /// Manifest answer, as KEY=VALUE
        #[arg(long, short = 'm', value_parser = parse_key_value)]
        manifest: Vec<(String, String)>,

        /// Begin running jobs right away
        #[arg(long)]
        run: bool,
    },

    /// Start or resume running the session
    Run {
        /// Decision for a job that was running when the agent went down:
        /// rerun, pass, fail, skip or crash
        #[arg(long)]
        in_flight: Option<InFlightAction>,
    },

    /// Stop after the current job
    Pause,

    /// Follow the session, answering verdict prompts
    #[command(alias = "attach")]
    Watch,

    /// Show the session state
    Status {
        /// Output the raw session snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Answer a verdict prompt
    Verdict {
        /// Job id the agent is waiting on
        job_id: String,

        /// pass, fail or skip
        verdict: Verdict,

        /// Comment stored with the result
        #[arg(long, short)]
        comment: Option<String>,
    },

    /// End the session, killing the running job
    Abort,

    /// Run failed jobs again
    Rerun {
        /// Job ids; defaults to every rerun candidate
        job_ids: Vec<String>,

        /// Only list the candidates
        #[arg(long)]
        list: bool,
    },

    /// Check unit files for errors without running anything
    Validate {
        /// Unit files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Namespace for the units
        #[arg(long, default_value = "local")]
        namespace: String,
    },

    /// View the agent log
    Logs {
        /// Number of lines to show
        #[arg(long, short = 'n', default_value = "50")]
        lines: usize,

        /// Follow the log output
        #[arg(long, short)]
        follow: bool,

        /// Clear the log file
        #[arg(long)]
        clear: bool,
    },

    /// Stop the agent
    Shutdown,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}
