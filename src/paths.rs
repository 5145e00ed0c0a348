use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Run logs: `~/.local/share/labprov/logs/`
pub fn logs_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("labprov")
        .join("logs")
}

/// Log file for a run started at `started`, e.g. `2026-03-02T09-00-00_run.log`.
pub fn run_log_path(started: DateTime<Utc>) -> PathBuf {
    logs_dir().join(format!("{}_run.log", started.format("%Y-%m-%dT%H-%M-%S")))
}
