//! Job environment construction

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::runner::RunRequest;
use crate::units::{JobFlag, JobUnit};

/// Agent variables every job inherits
pub const BASE_VARIABLES: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "DISPLAY",
    "WAYLAND_DISPLAY",
    "XDG_RUNTIME_DIR",
    "DBUS_SESSION_BUS_ADDRESS",
];

const FALLBACK_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Session-level inputs to a job's environment
pub struct EnvContext<'a> {
    pub session_id: &'a str,
    /// Scratch directory shared by all jobs of the session
    pub share_dir: &'a Path,
    /// Variables supplied by the controller when the session was created
    pub overrides: &'a BTreeMap<String, String>,
}

/// Build the complete environment for `job`
///
/// `host` is the agent's own environment.
pub fn job_environment(
    job: &JobUnit,
    ctx: &EnvContext<'_>,
    host: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for name in BASE_VARIABLES {
        if let Some(value) = host.get(*name) {
            env.insert(name.to_string(), value.clone());
        }
    }
    env.entry("PATH".to_string())
        .or_insert_with(|| FALLBACK_PATH.to_string());

    if job.has_flag(JobFlag::PreserveLocale) {
        for (name, value) in host {
            if name == "LANG" || name == "LANGUAGE" || name.starts_with("LC_") {
                env.insert(name.clone(), value.clone());
            }
        }
    } else {
        env.insert("LANG".to_string(), "C.UTF-8".to_string());
        env.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
    }

    for name in &job.environ {
        if let Some(value) = ctx.overrides.get(name).or_else(|| host.get(name)) {
            env.insert(name.clone(), value.clone());
        }
    }
    for (name, value) in ctx.overrides {
        env.insert(name.clone(), value.clone());
    }

    env.insert("CERTRIG_SESSION_ID".to_string(), ctx.session_id.to_string());
    env.insert("CERTRIG_JOB_ID".to_string(), job.id.clone());
    env.insert(
        "CERTRIG_SESSION_SHARE".to_string(),
        ctx.share_dir.display().to_string(),
    );

    env
}

/// Everything a session contributes to running its jobs
#[derive(Debug, Clone)]
pub struct RunContext {
    pub session_id: String,
    pub share_dir: PathBuf,
    pub overrides: BTreeMap<String, String>,
    pub host: BTreeMap<String, String>,
    pub default_timeout: Option<Duration>,
}

impl RunContext {
    /// Build the run request for `job`, or `None` when it has no command
    pub fn request(&self, job: &JobUnit) -> Option<RunRequest> {
        let command = job.command.clone()?;
        let ctx = EnvContext {
            session_id: &self.session_id,
            share_dir: &self.share_dir,
            overrides: &self.overrides,
        };
        Some(RunRequest {
            job_id: job.id.clone(),
            command,
            env: job_environment(job, &ctx, &self.host),
            user: job.user.clone(),
            cwd: Some(self.share_dir.clone()),
            timeout: job.timeout.map(Duration::from_secs).or(self.default_timeout),
        })
    }
}

/// Snapshot of the agent's environment
pub fn host_environment() -> BTreeMap<String, String> {
    std::env::vars().collect()
}
