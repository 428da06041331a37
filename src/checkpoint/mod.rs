//! Named, immutable snapshots of the execution record.
//!
//! Each checkpoint is one JSON file `checkpoints/{id}.json` where the id is
//! `{timestamp}-{name}`. The file carries a SHA-256 digest of the snapshot so
//! a damaged file is refused on restore instead of silently loaded.
//!
//! Lookup never guesses: `resolve` returns every candidate for an identifier
//! and operations that need a single checkpoint fail with `Ambiguous` when
//! more than one matches.

mod diff;

pub use diff::{RecordDiff, StatusChange, UnitChange, diff_records};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{CheckpointError, StateError};
use crate::phase::Phase;
use crate::state::{ExecutionRecord, StateStore};
use crate::util::{atomic_write, slugify, timestamp_id};

pub const CHECKPOINT_DIR: &str = "checkpoints";
pub const BACKUP_DIR: &str = "backups";
/// Backups retained by `backup()`.
pub const BACKUP_KEEP: usize = 10;
/// Name of the snapshot taken automatically before every restore.
pub const PRE_RESTORE: &str = "pre-restore";

/// A persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the serialized `record`
    pub digest: String,
    pub record: ExecutionRecord,
}

impl Checkpoint {
    fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            checkpoint_id: self.checkpoint_id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            session_id: self.record.session_id.clone(),
            phase: self.record.phase,
            version: self.record.version,
        }
    }
}

/// Listing entry; the snapshot itself is loaded on demand.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub session_id: String,
    pub phase: Phase,
    pub version: u64,
}

/// Result of a restore.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RestoreOutcome {
    pub restored: String,
    pub pre_restore: String,
}

fn digest_of(record: &ExecutionRecord) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(record)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct CheckpointManager {
    store: StateStore,
    dir: PathBuf,
    backup_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(store: StateStore) -> Self {
        let dir = store.root().join(CHECKPOINT_DIR);
        let backup_dir = store.root().join(BACKUP_DIR);
        Self {
            store,
            dir,
            backup_dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the current record under `name` and register it in the record.
    pub fn create(&self, name: &str) -> Result<CheckpointSummary, CheckpointError> {
        let summary = self.store.apply(|record| {
            let checkpoint = self.write_snapshot(record, name)?;
            record.last_checkpoint = Some(checkpoint.checkpoint_id.clone());
            record
                .checkpoint_list
                .push(checkpoint.checkpoint_id.clone());
            Ok::<_, CheckpointError>(checkpoint.summary())
        })?;
        info!(checkpoint = %summary.checkpoint_id, "created checkpoint");
        Ok(summary)
    }

    /// All readable checkpoints, newest first. A missing directory is an empty list.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut summaries = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_file(&path) {
                Ok(checkpoint) => summaries.push(checkpoint.summary()),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        summaries.sort_by(|a, b| b.checkpoint_id.cmp(&a.checkpoint_id));
        Ok(summaries)
    }

    pub fn latest(&self) -> Result<Option<CheckpointSummary>, CheckpointError> {
        Ok(self.list()?.into_iter().next())
    }

    /// Candidate ids for `identifier`, newest first: the exact id if it
    /// exists, else checkpoints whose name equals it, else ids containing it.
    pub fn resolve(&self, identifier: &str) -> Result<Vec<String>, CheckpointError> {
        let all = self.list()?;
        if all.iter().any(|c| c.checkpoint_id == identifier) {
            return Ok(vec![identifier.to_string()]);
        }
        let by_name: Vec<String> = all
            .iter()
            .filter(|c| c.name == identifier)
            .map(|c| c.checkpoint_id.clone())
            .collect();
        if !by_name.is_empty() {
            return Ok(by_name);
        }
        Ok(all
            .iter()
            .filter(|c| c.checkpoint_id.contains(identifier))
            .map(|c| c.checkpoint_id.clone())
            .collect())
    }

    /// The single checkpoint `identifier` refers to.
    pub fn resolve_one(&self, identifier: &str) -> Result<String, CheckpointError> {
        let mut matches = self.resolve(identifier)?;
        match matches.len() {
            0 => Err(CheckpointError::NotFound {
                identifier: identifier.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(CheckpointError::Ambiguous {
                identifier: identifier.to_string(),
                matches,
            }),
        }
    }

    /// Load and verify a checkpoint by exact id.
    pub fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(CheckpointError::NotFound {
                identifier: id.to_string(),
            });
        }
        let checkpoint = Self::read_file(&path)?;
        let actual = digest_of(&checkpoint.record)
            .map_err(|e| CheckpointError::State(StateError::Serialize(e)))?;
        if actual != checkpoint.digest {
            return Err(CheckpointError::DigestMismatch { id: id.to_string() });
        }
        Ok(checkpoint)
    }

    /// Replace the current record with a snapshot.
    ///
    /// A `pre-restore` checkpoint of the current record is written first; both
    /// steps happen inside one store update. The restored record keeps the
    /// live checkpoint history and points `last_checkpoint` at the restored id.
    pub fn restore(&self, identifier: &str) -> Result<RestoreOutcome, CheckpointError> {
        let id = self.resolve_one(identifier)?;
        let checkpoint = self.load(&id)?;

        let outcome = self.store.apply(|record| {
            let backup = self.write_snapshot(record, PRE_RESTORE)?;
            let mut history = std::mem::take(&mut record.checkpoint_list);
            history.push(backup.checkpoint_id.clone());

            *record = checkpoint.record.clone();
            record.checkpoint_list = history;
            record.last_checkpoint = Some(id.clone());
            Ok::<_, CheckpointError>(RestoreOutcome {
                restored: id.clone(),
                pre_restore: backup.checkpoint_id,
            })
        })?;
        info!(restored = %outcome.restored, pre_restore = %outcome.pre_restore, "restored checkpoint");
        Ok(outcome)
    }

    /// Delete the checkpoint `identifier` refers to; returns its id.
    pub fn delete(&self, identifier: &str) -> Result<String, CheckpointError> {
        let id = self.resolve_one(identifier)?;
        let path = self.path_for(&id);
        fs::remove_file(&path).map_err(|source| CheckpointError::Io { path, source })?;
        debug!(checkpoint = %id, "deleted checkpoint");
        Ok(id)
    }

    /// Keep the newest `keep` checkpoints and delete the rest; returns deleted ids.
    pub fn cleanup(&self, keep: usize) -> Result<Vec<String>, CheckpointError> {
        let mut deleted = Vec::new();
        for summary in self.list()?.into_iter().skip(keep) {
            let path = self.path_for(&summary.checkpoint_id);
            fs::remove_file(&path).map_err(|source| CheckpointError::Io { path, source })?;
            deleted.push(summary.checkpoint_id);
        }
        if !deleted.is_empty() {
            info!(deleted = deleted.len(), kept = keep, "cleaned up checkpoints");
        }
        Ok(deleted)
    }

    /// Differences between the checkpoint and the current record.
    pub fn diff(&self, identifier: &str) -> Result<RecordDiff, CheckpointError> {
        let id = self.resolve_one(identifier)?;
        let checkpoint = self.load(&id)?;
        let current = self.store.read()?;
        Ok(diff_records(&checkpoint.record, &current))
    }

    /// Write a timestamped copy of the current record to `backups/`,
    /// keeping the newest `BACKUP_KEEP`.
    pub fn backup(&self) -> Result<PathBuf, CheckpointError> {
        let record = self.store.read()?;
        let path = self
            .backup_dir
            .join(format!("{}.json", timestamp_id(Utc::now())));
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| CheckpointError::State(StateError::Serialize(e)))?;
        atomic_write(&path, json.as_bytes()).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;

        let mut backups: Vec<PathBuf> = fs::read_dir(&self.backup_dir)
            .map_err(|source| CheckpointError::Io {
                path: self.backup_dir.clone(),
                source,
            })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        backups.sort();
        let excess = backups.len().saturating_sub(BACKUP_KEEP);
        for old in backups.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&old) {
                warn!(path = %old.display(), error = %e, "failed to prune backup");
            }
        }
        Ok(path)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read_file(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write a snapshot of `record` without touching the record itself.
    fn write_snapshot(
        &self,
        record: &ExecutionRecord,
        name: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let created_at = Utc::now();
        let base = format!("{}-{}", timestamp_id(created_at), slugify(name));
        let mut checkpoint_id = base.clone();
        let mut n = 1;
        while self.path_for(&checkpoint_id).exists() {
            n += 1;
            checkpoint_id = format!("{base}-{n}");
        }

        let digest = digest_of(record)
            .map_err(|e| CheckpointError::State(StateError::Serialize(e)))?;
        let checkpoint = Checkpoint {
            checkpoint_id,
            name: name.to_string(),
            created_at,
            digest,
            record: record.clone(),
        };
        let path = self.path_for(&checkpoint.checkpoint_id);
        let json = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| CheckpointError::State(StateError::Serialize(e)))?;
        atomic_write(&path, json.as_bytes())
            .map_err(|source| CheckpointError::Io { path, source })?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{UnitStatus, WorkUnit};
    use tempfile::tempdir;

    fn setup() -> (CheckpointManager, StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".waypoint"));
        store.init("add login").unwrap();
        (CheckpointManager::new(store.clone()), store, dir)
    }

    #[test]
    fn test_create_registers_in_record() {
        let (manager, store, _dir) = setup();
        let cp = manager.create("after S1").unwrap();
        assert!(cp.checkpoint_id.ends_with("-after-s1"));
        assert_eq!(cp.name, "after S1");

        let rec = store.read().unwrap();
        assert_eq!(rec.last_checkpoint.as_deref(), Some(cp.checkpoint_id.as_str()));
        assert_eq!(rec.checkpoint_list, vec![cp.checkpoint_id.clone()]);
        assert!(manager.dir().join(format!("{}.json", cp.checkpoint_id)).exists());
    }

    #[test]
    fn test_create_without_record() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(StateStore::new(dir.path()));
        assert!(matches!(
            manager.create("x"),
            Err(CheckpointError::NoActiveRecord)
        ));
        assert!(manager.list().unwrap().is_empty());
        assert!(manager.latest().unwrap().is_none());
    }

    #[test]
    fn test_same_name_twice_gets_distinct_ids() {
        let (manager, _store, _dir) = setup();
        let a = manager.create("x").unwrap();
        let b = manager.create("x").unwrap();
        assert_ne!(a.checkpoint_id, b.checkpoint_id);
        assert_eq!(manager.list().unwrap().len(), 2);
    }

    #[test]
    fn test_restore_round_trip() {
        let (manager, store, _dir) = setup();
        store
            .apply(|r| {
                crate::phase::PhaseMachine::begin(r, Phase::Preparation)?;
                r.preparation.detected_signals.insert("rust".into());
                r.add_unit(None, WorkUnit::story("S1", "Form", &[]))?;
                Ok::<_, crate::errors::StateError>(())
            })
            .unwrap();
        let before = store.read().unwrap();
        let cp = manager.create("x").unwrap();

        store
            .apply(|r| {
                crate::phase::PhaseMachine::complete(r, Phase::Preparation)?;
                r.preparation.invoked_advisories.insert("rust-idioms".into());
                r.set_unit_status("S1", UnitStatus::Failed)?;
                r.record_error("mistake", Some("S1"));
                let report = crate::gates::GateReport::from_results("post_batch", true, vec![]);
                crate::gates::record_report(r, &report);
                r.original_request = "add login and logout".into();
                Ok::<_, crate::errors::StateError>(())
            })
            .unwrap();

        let outcome = manager.restore(&cp.checkpoint_id).unwrap();
        assert_eq!(outcome.restored, cp.checkpoint_id);

        let after = store.read().unwrap();
        assert_eq!(after.plan, before.plan);
        assert_eq!(after.execution, before.execution);
        assert_eq!(after.preparation, before.preparation);
        assert_eq!(after.verification, before.verification);
        assert_eq!(after.phase, before.phase);
        assert_eq!(after.original_request, before.original_request);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.session_id, before.session_id);
        assert_eq!(after.last_checkpoint.as_deref(), Some(cp.checkpoint_id.as_str()));
        assert_eq!(
            after.checkpoint_list,
            vec![cp.checkpoint_id.clone(), outcome.pre_restore.clone()]
        );
        assert!(after.version > before.version);
        assert!(after.updated_at >= before.updated_at);

        // The pre-restore snapshot holds the state that was replaced
        let pre = manager.load(&outcome.pre_restore).unwrap();
        assert_eq!(pre.name, PRE_RESTORE);
        assert_eq!(
            pre.record.find_unit("S1").unwrap().status,
            UnitStatus::Failed
        );
    }

    #[test]
    fn test_resolve_exact_name_and_substring() {
        let (manager, _store, _dir) = setup();
        let after_s1 = manager.create("after-s1").unwrap();
        let after_s10 = manager.create("after-s10").unwrap();

        assert_eq!(
            manager.resolve(&after_s1.checkpoint_id).unwrap(),
            vec![after_s1.checkpoint_id.clone()]
        );
        // Name equality wins over substring matching
        assert_eq!(
            manager.resolve_one("after-s1").unwrap(),
            after_s1.checkpoint_id
        );
        let err = manager.resolve_one("after").unwrap_err();
        match err {
            CheckpointError::Ambiguous { matches, .. } => {
                assert_eq!(matches, vec![after_s10.checkpoint_id, after_s1.checkpoint_id]);
            }
            other => panic!("Expected Ambiguous, got {other:?}"),
        }
        assert!(matches!(
            manager.resolve_one("nothing"),
            Err(CheckpointError::NotFound { .. })
        ));
    }

    #[test]
    fn test_ambiguous_restore_changes_nothing() {
        let (manager, store, _dir) = setup();
        manager.create("after-a").unwrap();
        manager.create("after-b").unwrap();
        let before = store.read().unwrap();
        assert!(manager.restore("after").is_err());
        assert_eq!(store.read().unwrap(), before);
        assert_eq!(manager.list().unwrap().len(), 2);
    }

    #[test]
    fn test_tampered_checkpoint_is_refused() {
        let (manager, store, _dir) = setup();
        let cp = manager.create("x").unwrap();
        let path = manager.dir().join(format!("{}.json", cp.checkpoint_id));
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("add login", "add logout")).unwrap();

        let before = store.read().unwrap();
        assert!(matches!(
            manager.restore(&cp.checkpoint_id),
            Err(CheckpointError::DigestMismatch { .. })
        ));
        assert_eq!(store.read().unwrap(), before);
    }

    #[test]
    fn test_delete_cleanup_latest() {
        let (manager, _store, _dir) = setup();
        let ids: Vec<String> = (0..4)
            .map(|i| manager.create(&format!("cp{i}")).unwrap().checkpoint_id)
            .collect();

        assert_eq!(manager.latest().unwrap().unwrap().checkpoint_id, ids[3]);
        assert_eq!(manager.delete("cp3").unwrap(), ids[3]);
        assert_eq!(manager.latest().unwrap().unwrap().checkpoint_id, ids[2]);

        let deleted = manager.cleanup(1).unwrap();
        assert_eq!(deleted, vec![ids[1].clone(), ids[0].clone()]);
        let left: Vec<String> = manager
            .list()
            .unwrap()
            .into_iter()
            .map(|c| c.checkpoint_id)
            .collect();
        assert_eq!(left, vec![ids[2].clone()]);
    }

    #[test]
    fn test_diff_against_current() {
        let (manager, store, _dir) = setup();
        let cp = manager.create("start").unwrap();
        store
            .update(|r| {
                r.execution.files_modified.insert("src/login.rs".into());
            })
            .unwrap();
        let diff = manager.diff(&cp.checkpoint_id).unwrap();
        assert_eq!(diff.files_added, vec![PathBuf::from("src/login.rs")]);
    }

    #[test]
    fn test_backup_keeps_last_ten() {
        let (manager, store, _dir) = setup();
        let mut last = PathBuf::new();
        for _ in 0..12 {
            last = manager.backup().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let count = fs::read_dir(store.root().join(BACKUP_DIR)).unwrap().count();
        assert_eq!(count, BACKUP_KEEP);
        assert!(last.exists());
    }
}
