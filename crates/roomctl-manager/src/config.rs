use std::{path::PathBuf, time::Duration};

pub const DEFAULT_CLIENT_EXECUTABLE: &str = "../out/Default/peerconnection_client";
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_CONSOLE_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_CONSOLE_LOG_MAX_FILES: usize = 3;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub client_executable: PathBuf,
    /// Working directory for spawned clients. `None` inherits ours.
    pub client_workdir: Option<PathBuf>,
    /// Window between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// When set, client stdout/stderr go to `<dir>/<room_id>/console.log`.
    pub console_log_dir: Option<PathBuf>,
    pub console_log_max_bytes: u64,
    pub console_log_max_files: usize,
    /// Drop already-exited clients from status listings.
    pub prune_exited_on_status: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            client_executable: PathBuf::from(DEFAULT_CLIENT_EXECUTABLE),
            client_workdir: None,
            stop_grace: DEFAULT_STOP_GRACE,
            console_log_dir: None,
            console_log_max_bytes: DEFAULT_CONSOLE_LOG_MAX_BYTES,
            console_log_max_files: DEFAULT_CONSOLE_LOG_MAX_FILES,
            prune_exited_on_status: false,
        }
    }
}

fn parse_u64(v: Option<String>) -> Option<u64> {
    v.and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_path(v: Option<String>) -> Option<PathBuf> {
    v.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            client_executable: parse_path(get("ROOMCTL_CLIENT_EXECUTABLE"))
                .unwrap_or(d.client_executable),
            client_workdir: parse_path(get("ROOMCTL_CLIENT_WORKDIR")),
            stop_grace: parse_u64(get("ROOMCTL_STOP_GRACE_SEC"))
                .map(|v| Duration::from_secs(v.clamp(1, 60)))
                .unwrap_or(d.stop_grace),
            console_log_dir: parse_path(get("ROOMCTL_CONSOLE_LOG_DIR")),
            console_log_max_bytes: parse_u64(get("ROOMCTL_CONSOLE_LOG_MAX_BYTES"))
                .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(d.console_log_max_bytes),
            console_log_max_files: parse_u64(get("ROOMCTL_CONSOLE_LOG_MAX_FILES"))
                .map(|v| v.clamp(1, 20) as usize)
                .unwrap_or(d.console_log_max_files),
            prune_exited_on_status: get("ROOMCTL_PRUNE_EXITED")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
        }
    }
}
