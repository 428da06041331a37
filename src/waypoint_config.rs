//! Configuration file for waypoint.
//!
//! Reads `<root>/waypoint.toml`. Every section is optional and falls back to
//! sensible defaults. Keys may be written in snake_case or camelCase.
//!
//! # Configuration File Format
//!
//! ```toml
//! [gates.pre_complete]
//! enabled = true
//! checks = ["lint", "tests"]
//!
//! [gates.post_batch]
//! checks = ["build"]
//!
//! [checks.lint]
//! kind = "command"
//! command = "cargo clippy -- -D warnings"
//! timeout_secs = 300
//!
//! [checks.tests]
//! kind = "script"
//! script = "scripts/run-tests.sh"
//!
//! [checks.readme]
//! kind = "file_exists"
//! paths = ["README.md"]
//!
//! [checkpoints]
//! auto_checkpoint = true
//! keep_last = 20
//!
//! [parallel_execution]
//! max_agents = 4
//! worker_timeout_secs = 1800
//! history_limit = 100
//!
//! [recovery]
//! freshness_hours = 24
//!
//! [advisories]
//! database = ["migrations", "query-performance"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::gates::STANDARD_GATE_PHASES;

/// File name of the configuration file inside the waypoint root.
pub const CONFIG_FILE: &str = "waypoint.toml";

/// Kind of a configured quality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Shell command; exit 0 passes
    #[default]
    Command,
    /// Every listed path must exist
    FileExists,
    /// Script file; skipped when the script is missing
    Script,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::Command => write!(f, "command"),
            CheckKind::FileExists => write!(f, "file_exists"),
            CheckKind::Script => write!(f, "script"),
        }
    }
}

impl std::str::FromStr for CheckKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" => Ok(CheckKind::Command),
            "file_exists" | "file-exists" => Ok(CheckKind::FileExists),
            "script" => Ok(CheckKind::Script),
            _ => anyhow::bail!(
                "Invalid check kind '{}'. Valid values: command, file_exists, script",
                s
            ),
        }
    }
}

/// A named check definition (`[checks.<name>]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckConfig {
    #[serde(default)]
    pub kind: CheckKind,
    /// Shell command for `command` checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Paths for `file_exists` checks, relative to the project directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<PathBuf>,
    /// Script path for `script` checks, relative to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    /// Timeout in seconds for `command` and `script` checks
    #[serde(default = "default_check_timeout", alias = "timeoutSecs")]
    pub timeout_secs: u64,
}

fn default_check_timeout() -> u64 {
    300
}

/// A gate phase (`[gates.<phase>]`): an ordered list of check names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub checks: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checks: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Checkpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointsSection {
    /// Take checkpoints automatically at lifecycle points
    #[serde(default = "default_true", alias = "autoCheckpoint")]
    pub auto_checkpoint: bool,
    /// Checkpoints retained by `cleanup` when no count is given
    #[serde(default = "default_keep_last", alias = "keepLast")]
    pub keep_last: usize,
}

fn default_keep_last() -> usize {
    20
}

impl Default for CheckpointsSection {
    fn default() -> Self {
        Self {
            auto_checkpoint: true,
            keep_last: default_keep_last(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelExecutionSection {
    /// Maximum concurrent workers per batch
    #[serde(default = "default_max_agents", alias = "maxAgents")]
    pub max_agents: usize,
    /// Per-worker timeout in seconds
    #[serde(default = "default_worker_timeout", alias = "workerTimeoutSecs")]
    pub worker_timeout_secs: u64,
    /// Finished worker handles retained in the registry
    #[serde(default = "default_history_limit", alias = "historyLimit")]
    pub history_limit: usize,
}

fn default_max_agents() -> usize {
    4
}

fn default_worker_timeout() -> u64 {
    1800
}

fn default_history_limit() -> usize {
    100
}

impl Default for ParallelExecutionSection {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            worker_timeout_secs: default_worker_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

/// Recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoverySection {
    /// Records not updated within this window are treated as abandoned
    #[serde(default = "default_freshness_hours", alias = "freshnessHours")]
    pub freshness_hours: u64,
}

fn default_freshness_hours() -> u64 {
    24
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            freshness_hours: default_freshness_hours(),
        }
    }
}

/// The complete waypoint.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WaypointToml {
    /// Gate phases and their ordered checks
    #[serde(default)]
    pub gates: BTreeMap<String, GateConfig>,
    /// Check definitions referenced by gates
    #[serde(default)]
    pub checks: BTreeMap<String, CheckConfig>,
    #[serde(default)]
    pub checkpoints: CheckpointsSection,
    #[serde(default, alias = "parallelExecution")]
    pub parallel_execution: ParallelExecutionSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    /// Signal -> advisory topics, overriding the built-in table
    #[serde(default)]
    pub advisories: BTreeMap<String, Vec<String>>,
}

impl WaypointToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse waypoint.toml")
    }

    /// Load `<root>/waypoint.toml`, or defaults if it does not exist.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize waypoint.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Starter configuration written by `waypoint config init`.
    pub fn starter() -> Self {
        let mut config = Self::default();
        for phase in STANDARD_GATE_PHASES {
            config.gates.insert(phase.to_string(), GateConfig::default());
        }
        config
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (phase, gate) in &self.gates {
            if !STANDARD_GATE_PHASES.contains(&phase.as_str()) {
                warnings.push(format!(
                    "Gate phase '{}' is not run automatically (standard phases: {})",
                    phase,
                    STANDARD_GATE_PHASES.join(", ")
                ));
            }
            for check in &gate.checks {
                if !self.checks.contains_key(check) {
                    warnings.push(format!(
                        "Gate '{}' references undefined check '{}'",
                        phase, check
                    ));
                }
            }
        }

        for (name, check) in &self.checks {
            match check.kind {
                CheckKind::Command if check.command.is_none() => {
                    warnings.push(format!("Check '{}' is a command check without a command", name));
                }
                CheckKind::Script if check.script.is_none() => {
                    warnings.push(format!("Check '{}' is a script check without a script", name));
                }
                CheckKind::FileExists if check.paths.is_empty() => {
                    warnings.push(format!("Check '{}' lists no paths", name));
                }
                _ => {}
            }
            if check.timeout_secs == 0 {
                warnings.push(format!("Check '{}' has a zero timeout", name));
            }
        }

        if self.parallel_execution.max_agents == 0 {
            warnings.push("parallel_execution.max_agents must be at least 1".to_string());
        }
        if self.parallel_execution.worker_timeout_secs == 0 {
            warnings.push("parallel_execution.worker_timeout_secs must be at least 1".to_string());
        }
        if self.checkpoints.keep_last == 0 {
            warnings.push("checkpoints.keep_last of 0 deletes every checkpoint on cleanup".to_string());
        }

        warnings
    }
}
