//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Agent listener settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Where unit definitions are loaded from
    #[serde(default)]
    pub units: UnitsConfig,

    /// Job execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Session storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Event buffer settings
    #[serde(default)]
    pub events: EventsConfig,

    /// Controller-side settings
    #[serde(default)]
    pub controller: ControllerConfig,
}

/// Agent configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Also accept controllers over TCP on this address (e.g. "0.0.0.0:18871")
    #[serde(default)]
    pub tcp_listen: Option<String>,

    /// Drop a controller connection after this many seconds without a request
    #[serde(default = "default_client_idle_timeout")]
    pub client_idle_timeout_secs: u64,

    /// Auto-exit after this many minutes with no session; 0 disables
    #[serde(default)]
    pub idle_timeout_minutes: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tcp_listen: None,
            client_idle_timeout_secs: default_client_idle_timeout(),
            idle_timeout_minutes: 0,
        }
    }
}

fn default_client_idle_timeout() -> u64 {
    300
}

/// One directory of unit files
#[derive(Debug, Deserialize, Clone)]
pub struct UnitDir {
    /// Directory searched recursively for `*.pxu` / `*.units`
    pub path: PathBuf,

    /// Namespace applied to partial ids in these files
    pub namespace: String,
}

/// Unit source configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct UnitsConfig {
    #[serde(default)]
    pub dirs: Vec<UnitDir>,
}

/// Job execution configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    /// Shell used to run job commands
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Time limit for jobs without their own `timeout` field
    #[serde(default)]
    pub default_job_timeout_secs: Option<u64>,

    /// Skip interactive jobs whose verdict does not arrive in time
    #[serde(default)]
    pub verdict_timeout_secs: Option<u64>,

    /// Re-run failed and crashed jobs once the plan is exhausted
    #[serde(default)]
    pub auto_retry: bool,

    /// Attempts per job, including the first run
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_job_timeout_secs: None,
            verdict_timeout_secs: None,
            auto_retry: false,
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_max_attempts() -> u32 {
    2
}

impl ExecutionConfig {
    pub fn default_job_timeout(&self) -> Option<Duration> {
        self.default_job_timeout_secs.map(Duration::from_secs)
    }

    pub fn verdict_timeout(&self) -> Option<Duration> {
        self.verdict_timeout_secs.map(Duration::from_secs)
    }
}

/// Session storage configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Override for the session checkpoint directory
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Effective checkpoint directory
    pub fn sessions_dir(&self) -> Result<PathBuf> {
        self.dir
            .clone()
            .or_else(paths::sessions_dir)
            .ok_or_else(|| super::Error::Config("cannot determine session storage directory".into()))
    }
}

/// Event buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    /// Maximum number of events kept for reattaching controllers
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
        }
    }
}

fn default_max_events() -> usize {
    10_000
}

/// Controller configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Keep retrying a lost agent connection for this long
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout_secs: u64,

    /// Long-poll duration for event requests
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconnect_timeout_secs: default_reconnect_timeout(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

fn default_reconnect_timeout() -> u64 {
    600
}
fn default_poll_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if the file doesn't exist
    pub fn load() -> Result<Self> {
        match paths::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.execution.shell, "/bin/sh");
        assert_eq!(config.execution.max_attempts, 2);
        assert!(!config.execution.auto_retry);
        assert_eq!(config.events.max_events, 10_000);
        assert_eq!(config.agent.client_idle_timeout_secs, 300);
        assert!(config.units.dirs.is_empty());
    }

    #[test]
    fn test_parse_sections() {
        let config = Config::parse(
            r#"
[agent]
tcp_listen = "0.0.0.0:18871"

[[units.dirs]]
path = "/usr/share/certrig/units"
namespace = "com.example"

[execution]
default_job_timeout_secs = 600
auto_retry = true
"#,
        )
        .unwrap();

        assert_eq!(config.agent.tcp_listen.as_deref(), Some("0.0.0.0:18871"));
        assert_eq!(config.units.dirs[0].namespace, "com.example");
        assert_eq!(
            config.execution.default_job_timeout(),
            Some(Duration::from_secs(600))
        );
        assert!(config.execution.auto_retry);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let err = Config::parse("[execution]\nmax_attempts = \"many\"").unwrap_err();
        assert!(matches!(err, super::super::Error::ConfigParse(_)));
    }
}
