//! Layered configuration for vanguard.
//!
//! Settings resolve file → environment, with CLI flags applied on top by
//! the binary. The file is TOML:
//!
//! ```toml
//! [store]
//! path = ".vanguard/state"
//!
//! [memory]
//! enabled = true
//! url = "http://localhost:8000"
//!
//! [worker]
//! command = "claude"
//! args = ["-p", "--output-format", "json"]
//! workspace = "/workspace"
//! timeout_secs = 600
//! planning_timeout_secs = 300
//!
//! [stages]
//! design_enabled = true
//! review_enabled = true
//! review_mode = "per_subtask"
//! test_enabled = true
//! test_mode = "per_subtask"
//! retry_cap = 1
//! approval_level = "required"
//! optional_checkpoint_timeout_secs = 1800
//! ```
//!
//! Environment overrides use a `VANGUARD_` prefix (e.g.
//! `VANGUARD_WORKER_CMD`, `VANGUARD_STORE_PATH`, `VANGUARD_MEMORY_URL`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::checkpoint::CheckpointLevel;
use crate::policy::{PolicySnapshot, StageMode, StageToggle};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Root directory of the JSON state store.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".vanguard/state")
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_memory_url")]
    pub url: String,
    /// Facts retrieved per stage invocation.
    #[serde(default = "default_memory_limit")]
    pub search_limit: usize,
}

fn default_memory_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_memory_limit() -> usize {
    5
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_memory_url(),
            search_limit: default_memory_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Which executor runs the units: "process" or "docker" (the latter
    /// needs the `docker` cargo feature).
    #[serde(default = "default_executor")]
    pub executor: String,
    /// Command the process executor spawns for each stage invocation.
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Shared workspace the workers operate on.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Container image for the docker executor (feature = "docker").
    #[serde(default = "default_image")]
    pub image: String,
    /// Docker network the worker containers join.
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_worker_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_planning_timeout")]
    pub planning_timeout_secs: u64,
}

fn default_executor() -> String {
    "process".to_string()
}

fn default_worker_command() -> String {
    "claude".to_string()
}

fn default_workspace() -> PathBuf {
    PathBuf::from("/workspace")
}

fn default_image() -> String {
    "vanguard-worker:latest".to_string()
}

fn default_worker_timeout() -> u64 {
    600
}

fn default_planning_timeout() -> u64 {
    300
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            executor: default_executor(),
            command: default_worker_command(),
            args: Vec::new(),
            workspace: default_workspace(),
            image: default_image(),
            network: None,
            timeout_secs: default_worker_timeout(),
            planning_timeout_secs: default_planning_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    #[serde(default = "default_true")]
    pub design_enabled: bool,
    #[serde(default = "default_true")]
    pub review_enabled: bool,
    #[serde(default = "default_mode")]
    pub review_mode: StageMode,
    #[serde(default = "default_true")]
    pub test_enabled: bool,
    #[serde(default = "default_mode")]
    pub test_mode: StageMode,
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,
    #[serde(default = "default_approval_level")]
    pub approval_level: CheckpointLevel,
    #[serde(default = "default_optional_timeout")]
    pub optional_checkpoint_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_mode() -> StageMode {
    StageMode::PerSubtask
}

fn default_retry_cap() -> u32 {
    1
}

fn default_approval_level() -> CheckpointLevel {
    CheckpointLevel::Required
}

fn default_optional_timeout() -> u64 {
    1800
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            design_enabled: true,
            review_enabled: true,
            review_mode: StageMode::PerSubtask,
            test_enabled: true,
            test_mode: StageMode::PerSubtask,
            retry_cap: 1,
            approval_level: CheckpointLevel::Required,
            optional_checkpoint_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub stages: StageSettings,
}

impl Settings {
    /// Load settings from an explicit path, or from the first of
    /// `./vanguard.toml`, `./.vanguard/vanguard.toml`, or the user config
    /// directory; falls back to defaults when no file exists. Environment
    /// overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match Self::resolve_file(path) {
            Some(file) => {
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read config file: {}", file.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse config file: {}", file.display()))?
            }
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    fn resolve_file(path: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = path {
            return Some(p.to_path_buf());
        }
        for candidate in [
            PathBuf::from("vanguard.toml"),
            PathBuf::from(".vanguard/vanguard.toml"),
        ] {
            if candidate.exists() {
                return Some(candidate);
            }
        }
        dirs::config_dir()
            .map(|d| d.join("vanguard/vanguard.toml"))
            .filter(|p| p.exists())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("VANGUARD_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VANGUARD_MEMORY_URL") {
            self.memory.url = v;
            self.memory.enabled = true;
        }
        if let Ok(v) = std::env::var("VANGUARD_WORKER_CMD") {
            self.worker.command = v;
        }
        if let Ok(v) = std::env::var("VANGUARD_WORKSPACE") {
            self.worker.workspace = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VANGUARD_WORKER_TIMEOUT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.worker.timeout_secs = secs;
        }
    }

    /// Compile the current settings into an immutable per-campaign policy.
    pub fn policy(&self) -> PolicySnapshot {
        PolicySnapshot {
            design_enabled: self.stages.design_enabled,
            review: StageToggle {
                enabled: self.stages.review_enabled,
                mode: self.stages.review_mode,
            },
            test: StageToggle {
                enabled: self.stages.test_enabled,
                mode: self.stages.test_mode,
            },
            retry_cap: self.stages.retry_cap,
            approval_level: self.stages.approval_level,
            worker_timeout_secs: self.worker.timeout_secs,
            planning_timeout_secs: self.worker.planning_timeout_secs,
            optional_checkpoint_timeout_secs: self.stages.optional_checkpoint_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_when_no_file() {
        let settings = Settings::default();
        assert_eq!(settings.worker.command, "claude");
        assert_eq!(settings.worker.timeout_secs, 600);
        assert!(!settings.memory.enabled);
        assert_eq!(settings.store.path, PathBuf::from(".vanguard/state"));
    }

    #[test]
    fn load_from_explicit_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("vanguard.toml");
        fs::write(
            &file,
            r#"
[worker]
command = "agentctl"
timeout_secs = 120

[stages]
review_enabled = false
test_mode = "per_campaign"
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&file)).unwrap();
        assert_eq!(settings.worker.command, "agentctl");
        assert_eq!(settings.worker.timeout_secs, 120);
        assert!(!settings.stages.review_enabled);
        assert_eq!(settings.stages.test_mode, StageMode::PerCampaign);
        // Unmentioned sections keep their defaults.
        assert_eq!(settings.stages.retry_cap, 1);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("vanguard.toml");
        fs::write(&file, "worker = { command").unwrap();
        let err = Settings::load(Some(&file)).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn policy_compiles_from_settings() {
        let mut settings = Settings::default();
        settings.stages.review_enabled = false;
        settings.worker.timeout_secs = 90;

        let policy = settings.policy();
        assert!(!policy.review.enabled);
        assert_eq!(policy.worker_timeout_secs, 90);
        policy.validate().unwrap();
    }
}
