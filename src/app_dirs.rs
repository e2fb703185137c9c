use directories::ProjectDirs;
use std::path::PathBuf;

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    fn state_dir() -> Option<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            Some(
                PathBuf::from(home)
                    .join(".local")
                    .join("state")
                    .join("popout"),
            )
        } else {
            ProjectDirs::from("", "", "popout").map(|proj_dirs| proj_dirs.data_local_dir().to_path_buf())
        }
    }

    /// SQLite file holding persisted snapshots
    pub fn snapshot_db_path() -> Option<PathBuf> {
        Self::state_dir().map(|d| d.join("snapshots.db"))
    }

    /// SQLite file backing the telemetry sink
    pub fn telemetry_db_path() -> Option<PathBuf> {
        Self::state_dir().map(|d| d.join("telemetry.db"))
    }

    /// Where CSV exports land by default
    pub fn export_dir() -> Option<PathBuf> {
        Self::state_dir().map(|d| d.join("exports"))
    }
}
