use crate::export::{CorrectnessLabels, EmptyExport};
use crate::trial::TrialMode;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ENGINE_NAME: &str = "popout_experiment";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of export file names
    pub engine_name: String,
    pub mode: TrialMode,
    /// Start the session as soon as the engine is built
    pub auto_start: bool,
    /// Save a snapshot after every change and restore it on construction
    pub persist: bool,
    pub persist_key: String,
    /// Overrides the mode's own empty-export behaviour
    pub empty_export: Option<EmptyExport>,
    pub labels: CorrectnessLabels,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_name: DEFAULT_ENGINE_NAME.to_string(),
            mode: TrialMode::Single,
            auto_start: true,
            persist: false,
            persist_key: DEFAULT_ENGINE_NAME.to_string(),
            empty_export: None,
            labels: CorrectnessLabels::default(),
        }
    }
}

pub trait ConfigStore {
    fn load(&self) -> EngineConfig;
    fn save(&self, cfg: &EngineConfig) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let path = if let Some(pd) = ProjectDirs::from("", "", "popout") {
            pd.config_dir().join("config.json")
        } else {
            PathBuf::from("popout_config.json")
        };
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> EngineConfig {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<EngineConfig>(&bytes) {
                Ok(cfg) => cfg,
                Err(e) => {
                    log::warn!("ignoring malformed config {}: {}", self.path.display(), e);
                    EngineConfig::default()
                }
            },
            Err(_) => EngineConfig::default(),
        }
    }

    fn save(&self, cfg: &EngineConfig) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)
    }
}
