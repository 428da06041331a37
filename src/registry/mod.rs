//! Registry of dispatched workers.
//!
//! Handles persist in `registry.json` so separate CLI invocations share one
//! view; results are cached as `results/{agent_id}.json`. Updates run under
//! an exclusive lock on `registry.lock`.
//!
//! Protocol violations (`DuplicateAgent`, `UnknownAgent`, `AlreadyFinished`)
//! are `RegistryError`s carried inside the returned `anyhow::Error`.

mod handle;

pub use handle::{CachedResult, WorkerHandle, WorkerStatus};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dag::DagScheduler;
use crate::errors::{RegistryError, SchedulingError};
use crate::state::WorkUnit;
use crate::util::{FileLock, atomic_write};

pub const REGISTRY_FILE: &str = "registry.json";
pub const REGISTRY_LOCK: &str = "registry.lock";
pub const RESULTS_DIR: &str = "results";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    handles: Vec<WorkerHandle>,
}

/// Pool statistics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Completed / finished, in [0, 1]; `None` before anything finished
    pub success_rate: Option<f64>,
    pub mean_duration_secs: Option<f64>,
}

pub struct WorkerRegistry {
    root: PathBuf,
    history_limit: usize,
}

impl WorkerRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            history_limit: 100,
        }
    }

    /// Number of finished handles retained; older ones are evicted.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    fn result_path(&self, agent_id: &str) -> PathBuf {
        self.results_dir().join(format!("{agent_id}.json"))
    }

    /// Record a newly dispatched worker.
    pub fn register(&self, agent_id: &str, unit_id: &str, kind: &str) -> Result<WorkerHandle> {
        validate_agent_id(agent_id)?;
        self.update(|doc| {
            if doc.handles.iter().any(|h| h.agent_id == agent_id) {
                return Err(RegistryError::DuplicateAgent {
                    agent_id: agent_id.to_string(),
                }
                .into());
            }
            let handle = WorkerHandle::new(agent_id, unit_id, kind);
            doc.handles.push(handle.clone());
            info!(agent = agent_id, unit = unit_id, kind, "registered worker");
            Ok(handle)
        })
    }

    /// Cache the result of a worker and mark it finished with `status`.
    pub fn record_result(
        &self,
        agent_id: &str,
        result: serde_json::Value,
        status: WorkerStatus,
    ) -> Result<WorkerHandle> {
        if !status.is_finished() {
            return Err(RegistryError::NotFinalStatus {
                status: status.to_string(),
            }
            .into());
        }
        validate_agent_id(agent_id)?;
        let path = self.result_path(agent_id);
        self.update(|doc| {
            let handle = running_handle(doc, agent_id)?;
            let cached = CachedResult {
                agent_id: agent_id.to_string(),
                unit_id: handle.unit_id.clone(),
                status,
                result,
                recorded_at: Utc::now(),
            };
            let json = serde_json::to_string_pretty(&cached)?;
            atomic_write(&path, json.as_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;

            handle.status = status;
            handle.completed_at = Some(cached.recorded_at);
            handle.result_ref = Some(path);
            let out = handle.clone();
            debug!(agent = agent_id, status = %status, "recorded worker result");
            Ok(out)
        })
    }

    /// Mark a running worker as timed out.
    pub fn record_timeout(&self, agent_id: &str) -> Result<WorkerHandle> {
        self.update(|doc| {
            let handle = running_handle(doc, agent_id)?;
            handle.status = WorkerStatus::TimedOut;
            handle.completed_at = Some(Utc::now());
            warn!(agent = agent_id, unit = %handle.unit_id, "worker timed out");
            Ok(handle.clone())
        })
    }

    /// Mark every worker running for longer than `limit` as timed out.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>, limit: Duration) -> Result<Vec<String>> {
        let limit = chrono::Duration::from_std(limit).unwrap_or(chrono::Duration::MAX);
        self.update(|doc| {
            let mut swept = Vec::new();
            for handle in doc
                .handles
                .iter_mut()
                .filter(|h| h.status == WorkerStatus::Running && now - h.started_at > limit)
            {
                handle.status = WorkerStatus::TimedOut;
                handle.completed_at = Some(now);
                swept.push(handle.agent_id.clone());
            }
            if !swept.is_empty() {
                warn!(count = swept.len(), "swept timed out workers");
            }
            Ok(swept)
        })
    }

    pub fn list(&self) -> Result<Vec<WorkerHandle>> {
        Ok(self.load()?.handles)
    }

    pub fn get(&self, agent_id: &str) -> Result<Option<WorkerHandle>> {
        Ok(self
            .load()?
            .handles
            .into_iter()
            .find(|h| h.agent_id == agent_id))
    }

    /// The cached result of `agent_id`, if one was recorded.
    pub fn cached_result(&self, agent_id: &str) -> Result<Option<CachedResult>> {
        validate_agent_id(agent_id)?;
        let path = self.result_path(agent_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let cached = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(cached))
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let handles = self.list()?;
        let count = |s: WorkerStatus| handles.iter().filter(|h| h.status == s).count();
        let completed = count(WorkerStatus::Completed);
        let failed = count(WorkerStatus::Failed);
        let timed_out = count(WorkerStatus::TimedOut);
        let finished = completed + failed + timed_out;

        let durations: Vec<f64> = handles
            .iter()
            .filter_map(|h| h.duration())
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect();

        Ok(PoolStats {
            total: handles.len(),
            running: count(WorkerStatus::Running),
            completed,
            failed,
            timed_out,
            success_rate: (finished > 0).then(|| completed as f64 / finished as f64),
            mean_duration_secs: (!durations.is_empty())
                .then(|| durations.iter().sum::<f64>() / durations.len() as f64),
        })
    }

    /// Dependency-respecting batches for `units`.
    pub fn suggest_batches(units: &[WorkUnit]) -> Result<Vec<Vec<String>>, SchedulingError> {
        DagScheduler::from_units(units)?.compute_batches()
    }

    fn load(&self) -> Result<RegistryDocument> {
        let path = self.root.join(REGISTRY_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryDocument::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut RegistryDocument) -> Result<T>) -> Result<T> {
        let lock_path = self.root.join(REGISTRY_LOCK);
        let _lock = FileLock::acquire(&lock_path)
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        let mut doc = self.load()?;
        let out = f(&mut doc)?;
        self.evict(&mut doc);
        let path = self.root.join(REGISTRY_FILE);
        let json = serde_json::to_string_pretty(&doc)?;
        atomic_write(&path, json.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(out)
    }

    /// Drop the oldest finished handles beyond the history limit.
    fn evict(&self, doc: &mut RegistryDocument) {
        let mut finished: Vec<(DateTime<Utc>, String)> = doc
            .handles
            .iter()
            .filter(|h| h.status.is_finished())
            .map(|h| (h.completed_at.unwrap_or(h.started_at), h.agent_id.clone()))
            .collect();
        if finished.len() <= self.history_limit {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.history_limit;
        let evicted: Vec<String> = finished.into_iter().take(excess).map(|(_, id)| id).collect();
        doc.handles.retain(|h| !evicted.contains(&h.agent_id));
        for id in evicted.iter().filter(|id| validate_agent_id(id).is_ok()) {
            remove_if_exists(&self.result_path(id));
        }
        debug!(evicted = evicted.len(), "evicted finished worker handles");
    }
}

/// Agent ids double as result file names and must stay inside `results/`.
fn validate_agent_id(agent_id: &str) -> Result<(), RegistryError> {
    let valid = !agent_id.is_empty()
        && !agent_id.starts_with('.')
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidAgentId {
            agent_id: agent_id.to_string(),
        })
    }
}

fn running_handle<'a>(doc: &'a mut RegistryDocument, agent_id: &str) -> Result<&'a mut WorkerHandle> {
    let handle = doc
        .handles
        .iter_mut()
        .find(|h| h.agent_id == agent_id)
        .ok_or_else(|| RegistryError::UnknownAgent {
            agent_id: agent_id.to_string(),
        })?;
    if handle.status.is_finished() {
        return Err(RegistryError::AlreadyFinished {
            agent_id: agent_id.to_string(),
            status: handle.status.to_string(),
        }
        .into());
    }
    Ok(handle)
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove cached result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn registry_err(err: &anyhow::Error) -> &RegistryError {
        err.downcast_ref::<RegistryError>()
            .expect("expected a RegistryError")
    }

    #[test]
    fn test_register_and_duplicate() {
        let dir = tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path());
        let handle = registry.register("a1", "S1", "general").unwrap();
        assert_eq!(handle.status, WorkerStatus::Running);

        let err = registry.register("a1", "S2", "general").unwrap_err();
        assert_eq!(
            registry_err(&err),
            &RegistryError::DuplicateAgent {
                agent_id: "a1".into()
            }
        );

        // Visible to a second registry instance over the same directory
        let other = WorkerRegistry::new(dir.path());
        assert_eq!(other.list().unwrap().len(), 1);
    }

    #[test]
    fn test_agent_ids_stay_inside_results_dir() {
        let dir = tempdir().unwrap();
        let root = dir.path().join(".waypoint");
        let registry = WorkerRegistry::new(&root);

        for bad in ["../../escaped", "a/b", "..", ".hidden", ""] {
            let err = registry.register(bad, "S1", "general").unwrap_err();
            assert_eq!(
                registry_err(&err),
                &RegistryError::InvalidAgentId {
                    agent_id: bad.into()
                }
            );
        }
        assert!(registry.list().unwrap().is_empty());

        let err = registry
            .record_result("../../escaped", json!("done"), WorkerStatus::Completed)
            .unwrap_err();
        assert!(matches!(
            registry_err(&err),
            RegistryError::InvalidAgentId { .. }
        ));
        assert!(!dir.path().join("escaped.json").exists());

        registry.register("S1.T2-1a2b3c4d", "S1.T2", "general").unwrap();
    }

    #[test]
    fn test_record_result_for_unknown_agent() {
        let dir = tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path());
        registry.register("a1", "S1", "general").unwrap();
        let err = registry
            .record_result("a2", json!("done"), WorkerStatus::Completed)
            .unwrap_err();
        assert_eq!(
            registry_err(&err),
            &RegistryError::UnknownAgent {
                agent_id: "a2".into()
            }
        );
    }

    #[test]
    fn test_record_result_caches_and_finishes_once() {
        let dir = tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path());
        registry.register("a1", "S1", "general").unwrap();

        let handle = registry
            .record_result("a1", json!({"files": ["src/login.rs"]}), WorkerStatus::Completed)
            .unwrap();
        assert_eq!(handle.status, WorkerStatus::Completed);
        assert!(handle.completed_at.is_some());
        assert!(handle.result_ref.as_ref().unwrap().exists());

        let cached = registry.cached_result("a1").unwrap().unwrap();
        assert_eq!(cached.unit_id, "S1");
        assert_eq!(cached.result["files"][0], "src/login.rs");

        let err = registry
            .record_result("a1", json!("again"), WorkerStatus::Failed)
            .unwrap_err();
        assert!(matches!(
            registry_err(&err),
            RegistryError::AlreadyFinished { .. }
        ));

        let err = registry
            .record_result("a1", json!(null), WorkerStatus::Running)
            .unwrap_err();
        assert!(matches!(
            registry_err(&err),
            RegistryError::NotFinalStatus { .. }
        ));
    }

    #[test]
    fn test_timeouts() {
        let dir = tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path());
        registry.register("a1", "S1", "general").unwrap();
        registry.register("a2", "S2", "general").unwrap();

        let timed_out = registry.record_timeout("a1").unwrap();
        assert_eq!(timed_out.status, WorkerStatus::TimedOut);

        let later = Utc::now() + chrono::Duration::hours(1);
        let swept = registry
            .sweep_timeouts(later, Duration::from_secs(60))
            .unwrap();
        assert_eq!(swept, vec!["a2"]);
        assert_eq!(
            registry.get("a2").unwrap().unwrap().status,
            WorkerStatus::TimedOut
        );
        assert!(registry.sweep_timeouts(later, Duration::from_secs(60)).unwrap().is_empty());
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path());
        let empty = registry.stats().unwrap();
        assert_eq!(empty.total, 0);
        assert!(empty.success_rate.is_none());

        for id in ["a1", "a2", "a3", "a4"] {
            registry.register(id, "S1", "general").unwrap();
        }
        registry.record_result("a1", json!("ok"), WorkerStatus::Completed).unwrap();
        registry.record_result("a2", json!("ok"), WorkerStatus::Completed).unwrap();
        registry.record_result("a3", json!("no"), WorkerStatus::Failed).unwrap();

        let stats = registry.stats().unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        let rate = stats.success_rate.unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(stats.mean_duration_secs.unwrap() >= 0.0);
    }

    #[test]
    fn test_history_limit_evicts_oldest_finished() {
        let dir = tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path()).with_history_limit(2);
        for id in ["a1", "a2", "a3"] {
            registry.register(id, "S1", "general").unwrap();
            registry.record_result(id, json!(id), WorkerStatus::Completed).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        registry.register("a4", "S1", "general").unwrap();

        let ids: Vec<String> = registry.list().unwrap().into_iter().map(|h| h.agent_id).collect();
        assert_eq!(ids, vec!["a2", "a3", "a4"]);
        assert!(registry.cached_result("a1").unwrap().is_none());
    }

    #[test]
    fn test_suggest_batches() {
        let units = vec![
            WorkUnit::story("S1", "Form", &[]),
            WorkUnit::story("S2", "Session", &["S1"]),
        ];
        assert_eq!(
            WorkerRegistry::suggest_batches(&units).unwrap(),
            vec![vec!["S1"], vec!["S2"]]
        );
    }
}
