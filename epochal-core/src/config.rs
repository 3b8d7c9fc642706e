//! Configuration system for epochal.
//!
//! Uses `figment` for layered configuration: defaults -> config files ->
//! environment. Configuration is loaded from `~/.config/epochal/config.toml`,
//! `.epochal/config.toml` in the workspace and an optional explicit file.

use crate::hooks::EngineEvent;
use crate::summary::DEFAULT_SUMMARY_ORDER;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Training engine event that triggers validation.
    #[serde(default = "default_valid_trigger")]
    pub check_valid_hook_when: EngineEvent,
    /// Column order of the epoch summary. Absent keeps construction order.
    #[serde(default = "default_summary_order")]
    pub summary_order: Option<Vec<String>>,
    /// Curriculum-learning mode; validation is checked every iteration.
    #[serde(default)]
    pub use_cl: bool,
    #[serde(default)]
    pub use_transfer: bool,
    /// Baseline mode; validation is checked every iteration.
    #[serde(default)]
    pub use_baseline: bool,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            check_valid_hook_when: default_valid_trigger(),
            summary_order: default_summary_order(),
            use_cl: false,
            use_transfer: false,
            use_baseline: false,
            trainer: TrainerConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

fn default_valid_trigger() -> EngineEvent {
    EngineEvent::EpochEnd
}

fn default_summary_order() -> Option<Vec<String>> {
    Some(DEFAULT_SUMMARY_ORDER.iter().map(|s| s.to_string()).collect())
}

/// Reference trainer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_batches_per_epoch")]
    pub batches_per_epoch: usize,
    /// Batches per validation pass. Zero disables validation.
    #[serde(default = "default_valid_batches")]
    pub valid_batches: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            batches_per_epoch: default_batches_per_epoch(),
            valid_batches: default_valid_batches(),
            learning_rate: default_learning_rate(),
            seed: default_seed(),
        }
    }
}

fn default_max_epochs() -> usize {
    10
}

fn default_batches_per_epoch() -> usize {
    32
}

fn default_valid_batches() -> usize {
    8
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_seed() -> u64 {
    42
}

/// Checkpoint persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// Checkpoints to retain; 0 keeps all of them.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            keep_last: default_keep_last(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".epochal/checkpoints")
}

fn default_keep_last() -> usize {
    3
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `EPOCHAL_`, nested with `__`)
/// 2. Explicit config file (must exist when given)
/// 3. Workspace-local config (`.epochal/config.toml`)
/// 4. User config (`~/.config/epochal/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    file: Option<&Path>,
) -> Result<ExperimentConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ExperimentConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".epochal").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = file {
        if !file.exists() {
            return Err(Box::new(figment::Error::from(format!(
                "config file not found: {}",
                file.display()
            ))));
        }
        figment = figment.merge(Toml::file(file));
    }

    // EPOCHAL_USE_CL, EPOCHAL_TRAINER__MAX_EPOCHS, ...
    figment = figment.merge(Env::prefixed("EPOCHAL_").split("__"));

    figment.extract().map_err(Box::new)
}

/// `~/.config/epochal/config.toml` on Linux, platform equivalent elsewhere.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "epochal", "epochal")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
