//! Socket, configuration and storage paths
//!
//! Unix/macOS: the agent socket lives under $XDG_RUNTIME_DIR or /tmp
//! Windows: named pipe \\.\pipe\certrig-<username>

use std::io;
use std::path::PathBuf;

/// Name used for the IPC socket/pipe and the project directories
const APP_NAME: &str = "certrig";

/// Get the socket/pipe path for IPC communication
///
/// - Unix: `$XDG_RUNTIME_DIR/certrig/agent.sock` or `/tmp/certrig-<uid>/agent.sock`
/// - Windows: pipe name (prefix handled by interprocess)
#[cfg(unix)]
pub fn socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_NAME).join("agent.sock");
    }

    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid)).join("agent.sock")
}

#[cfg(windows)]
pub fn socket_path() -> PathBuf {
    let username = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    PathBuf::from(format!("{}-{}", APP_NAME, username))
}

/// Socket name suitable for interprocess' local socket API
#[cfg(unix)]
pub fn socket_name() -> String {
    socket_path().to_string_lossy().into_owned()
}

#[cfg(windows)]
pub fn socket_name() -> String {
    let username = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    format!("{}-{}", APP_NAME, username)
}

/// Ensure the socket directory exists, mode 0700 on Unix
#[cfg(unix)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    let socket = socket_path();
    let dir = socket
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid socket path"))?;

    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(dir.to_path_buf())
}

#[cfg(windows)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    Ok(PathBuf::new())
}

/// Remove a stale socket file
#[cfg(unix)]
pub fn remove_socket() -> io::Result<()> {
    let path = socket_path();
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

#[cfg(windows)]
pub fn remove_socket() -> io::Result<()> {
    Ok(())
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Configuration directory (`~/.config/certrig/` on Linux)
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Data directory (`~/.local/share/certrig/` on Linux)
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Directory holding agent logs
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("logs"))
}

/// Directory holding live session checkpoints
pub fn sessions_dir() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("sessions"))
}
