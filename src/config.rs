use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checkpoint::{BACKUP_DIR, CHECKPOINT_DIR, CheckpointManager};
use crate::gates::GatePipeline;
use crate::recovery::RecoveryDetector;
use crate::registry::{RESULTS_DIR, WorkerRegistry};
use crate::signals::AdvisoryTable;
use crate::state::{ARCHIVE_DIR, StateStore};
use crate::waypoint_config::{CONFIG_FILE, WaypointToml};

/// Name of the root directory created inside a project.
pub const ROOT_DIR: &str = ".waypoint";

/// Environment variable overriding the root directory.
pub const HOME_ENV: &str = "WAYPOINT_HOME";

/// Runtime configuration for waypoint.
///
/// Resolves the root directory and bridges `waypoint.toml` with the
/// components that need its values. Layering is file, then environment
/// (read by the CLI), then explicit CLI overrides applied with `with_*`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub root: PathBuf,
    toml: WaypointToml,
    max_agents_override: Option<usize>,
}

impl Config {
    /// Create a Config for `project_dir`. `root` overrides `<project>/.waypoint`.
    pub fn new(project_dir: PathBuf, root: Option<PathBuf>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let root = match root {
            Some(root) if root.is_absolute() => root,
            Some(root) => project_dir.join(root),
            None => project_dir.join(ROOT_DIR),
        };
        let toml = WaypointToml::load_or_default(&root)?;

        Ok(Self {
            project_dir,
            root,
            toml,
            max_agents_override: None,
        })
    }

    pub fn with_max_agents(mut self, max_agents: Option<usize>) -> Self {
        self.max_agents_override = max_agents;
        self
    }

    pub fn toml(&self) -> &WaypointToml {
        &self.toml
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join(CHECKPOINT_DIR)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents_override
            .unwrap_or(self.toml.parallel_execution.max_agents)
            .max(1)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.parallel_execution.worker_timeout_secs)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.toml.recovery.freshness_hours * 3600)
    }

    pub fn auto_checkpoint(&self) -> bool {
        self.toml.checkpoints.auto_checkpoint
    }

    pub fn keep_last(&self) -> usize {
        self.toml.checkpoints.keep_last
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.root)
    }

    pub fn checkpoints(&self) -> CheckpointManager {
        CheckpointManager::new(self.store())
    }

    pub fn registry(&self) -> WorkerRegistry {
        WorkerRegistry::new(&self.root)
            .with_history_limit(self.toml.parallel_execution.history_limit)
    }

    pub fn gates(&self) -> GatePipeline {
        GatePipeline::from_config(&self.project_dir, &self.toml)
    }

    pub fn recovery(&self) -> RecoveryDetector {
        RecoveryDetector::new(self.store()).with_freshness(self.freshness())
    }

    pub fn advisories(&self) -> AdvisoryTable {
        AdvisoryTable::builtin().with_overrides(&self.toml.advisories)
    }

    /// Create the root directory layout.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.checkpoints_dir(),
            self.results_dir(),
            self.backups_dir(),
            self.archive_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Write a starter `waypoint.toml` unless one exists. Returns whether a
    /// file was written.
    pub fn write_starter(&self) -> Result<bool> {
        let path = self.config_file();
        if path.exists() {
            return Ok(false);
        }
        WaypointToml::starter().save(&path)?;
        Ok(true)
    }
}

/// Walk up from `start` to the nearest directory holding a `.waypoint` root.
pub fn find_project_dir(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(ROOT_DIR).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_root_under_project() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None).unwrap();
        assert!(config.root.ends_with(ROOT_DIR));
        assert_eq!(config.max_agents(), 4);
        assert_eq!(config.freshness(), Duration::from_secs(24 * 3600));
        assert!(config.auto_checkpoint());
    }

    #[test]
    fn test_relative_root_override_is_joined() {
        let dir = tempdir().unwrap();
        let config =
            Config::new(dir.path().to_path_buf(), Some(PathBuf::from("custom"))).unwrap();
        assert!(config.root.ends_with("custom"));
        assert!(config.root.is_absolute());
    }

    #[test]
    fn test_loads_toml_and_cli_override_wins() {
        let dir = tempdir().unwrap();
        let root = dir.path().join(ROOT_DIR);
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join(CONFIG_FILE),
            "[parallelExecution]\nmaxAgents = 2\nworkerTimeoutSecs = 60\n",
        )
        .unwrap();

        let config = Config::new(dir.path().to_path_buf(), None).unwrap();
        assert_eq!(config.max_agents(), 2);
        assert_eq!(config.worker_timeout(), Duration::from_secs(60));

        let config = config.with_max_agents(Some(8));
        assert_eq!(config.max_agents(), 8);
        assert_eq!(config.with_max_agents(Some(0)).max_agents(), 1);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let root = dir.path().join(ROOT_DIR);
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(CONFIG_FILE), "[checkpoints\n").unwrap();
        assert!(Config::new(dir.path().to_path_buf(), None).is_err());
    }

    #[test]
    fn test_ensure_directories_and_starter() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.checkpoints_dir().is_dir());
        assert!(config.results_dir().is_dir());
        assert!(config.backups_dir().is_dir());
        assert!(config.archive_dir().is_dir());

        assert!(config.write_starter().unwrap());
        assert!(!config.write_starter().unwrap());
        let reloaded = Config::new(dir.path().to_path_buf(), None).unwrap();
        assert!(reloaded.toml().gates.contains_key("pre_complete"));
    }

    #[test]
    fn test_find_project_dir_walks_up() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(ROOT_DIR)).unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_dir(&nested).as_deref(), Some(dir.path()));

        let other = tempdir().unwrap();
        assert!(find_project_dir(other.path()).is_none());
    }
}
