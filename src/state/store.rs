//! File-backed state store for the execution record.
//!
//! The record lives in a single JSON document. Every update is a full
//! read-modify-write performed while holding an exclusive lock on
//! `state.lock`, so concurrent writers (the controller, hooks, separate CLI
//! invocations) are serialized and cannot lose each other's updates. The
//! write itself goes through a temp file and a rename, so readers never see a
//! partial document.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::record::ExecutionRecord;
use crate::errors::StateError;
use crate::util::{FileLock, atomic_write};

/// File name of the canonical record.
pub const STATE_FILE: &str = "state.json";
/// Lock file serializing writers.
pub const LOCK_FILE: &str = "state.lock";
/// Directory receiving finished records.
pub const ARCHIVE_DIR: &str = "archive";

/// Owner of the canonical `ExecutionRecord`.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    /// Read the record if one exists.
    pub fn try_read(&self) -> Result<Option<ExecutionRecord>, StateError> {
        let path = self.state_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };
        let record = serde_json::from_str(&content)
            .map_err(|source| StateError::Corrupt { path, source })?;
        Ok(Some(record))
    }

    /// Read the record, failing with `NotInitialized` when there is none.
    pub fn read(&self) -> Result<ExecutionRecord, StateError> {
        self.try_read()?.ok_or_else(|| StateError::NotInitialized {
            root: self.root.clone(),
        })
    }

    /// Whether a non-terminal record exists.
    pub fn active(&self) -> Result<bool, StateError> {
        Ok(self.try_read()?.is_some_and(|r| !r.is_terminal()))
    }

    /// Start a new session for `request`.
    ///
    /// Fails with `AlreadyActive` if a non-terminal record exists. A terminal
    /// record is moved to the archive first.
    pub fn init(&self, request: &str) -> Result<ExecutionRecord, StateError> {
        self.init_inner(request, false)
    }

    /// Start a new session, archiving any existing record even if it is
    /// still active. Used for abandoned (stale) sessions.
    pub fn reinit(&self, request: &str) -> Result<ExecutionRecord, StateError> {
        self.init_inner(request, true)
    }

    fn init_inner(&self, request: &str, replace_active: bool) -> Result<ExecutionRecord, StateError> {
        let _lock = self.lock()?;
        if let Some(existing) = self.try_read()? {
            if !existing.is_terminal() && !replace_active {
                return Err(StateError::AlreadyActive {
                    session_id: existing.session_id,
                    phase: existing.phase.to_string(),
                });
            }
            let archived = self.archive_record(&existing)?;
            info!(session = %existing.session_id, path = %archived.display(), "archived previous session");
        }

        let record = ExecutionRecord::new(request);
        self.write(&record)?;
        info!(session = %record.session_id, "initialized execution record");
        Ok(record)
    }

    /// Atomically apply `transform` to the persisted record.
    ///
    /// The transform runs under the writer lock. If it fails nothing is
    /// written; otherwise `version` is incremented, `updated_at` is stamped and
    /// the full document is rewritten.
    pub fn apply<T, E, F>(&self, transform: F) -> Result<T, E>
    where
        F: FnOnce(&mut ExecutionRecord) -> Result<T, E>,
        E: From<StateError>,
    {
        self.apply_inner(None, transform)
    }

    /// Like `apply`, but fails with `VersionConflict` unless the persisted
    /// record is still at `expected_version`.
    pub fn apply_expecting<T, E, F>(&self, expected_version: u64, transform: F) -> Result<T, E>
    where
        F: FnOnce(&mut ExecutionRecord) -> Result<T, E>,
        E: From<StateError>,
    {
        self.apply_inner(Some(expected_version), transform)
    }

    /// Apply an infallible mutation and return the updated record.
    pub fn update<F>(&self, mutate: F) -> Result<ExecutionRecord, StateError>
    where
        F: FnOnce(&mut ExecutionRecord),
    {
        self.apply(|record| {
            mutate(record);
            Ok::<_, StateError>(())
        })?;
        self.read()
    }

    /// Copy the current record into the archive directory.
    pub fn archive(&self) -> Result<PathBuf, StateError> {
        let record = self.read()?;
        self.archive_record(&record)
    }

    fn apply_inner<T, E, F>(&self, expected: Option<u64>, transform: F) -> Result<T, E>
    where
        F: FnOnce(&mut ExecutionRecord) -> Result<T, E>,
        E: From<StateError>,
    {
        let _lock = self.lock()?;
        let mut record = self.read()?;
        let base_version = record.version;

        if let Some(expected) = expected
            && expected != base_version
        {
            return Err(StateError::VersionConflict {
                expected,
                found: base_version,
            }
            .into());
        }

        let out = transform(&mut record)?;

        record.version = base_version + 1;
        record.updated_at = Utc::now();
        self.write(&record)?;
        debug!(version = record.version, phase = %record.phase, "applied state update");
        Ok(out)
    }

    fn archive_record(&self, record: &ExecutionRecord) -> Result<PathBuf, StateError> {
        let path = self
            .archive_dir()
            .join(format!("{}.json", record.session_id));
        let json = serde_json::to_string_pretty(record).map_err(StateError::Serialize)?;
        atomic_write(&path, json.as_bytes()).map_err(|e| StateError::io(&path, e))?;
        Ok(path)
    }

    fn write(&self, record: &ExecutionRecord) -> Result<(), StateError> {
        let path = self.state_path();
        let json = serde_json::to_string_pretty(record).map_err(StateError::Serialize)?;
        atomic_write(&path, json.as_bytes()).map_err(|e| StateError::io(path, e))
    }

    fn lock(&self) -> Result<FileLock, StateError> {
        let path = self.root.join(LOCK_FILE);
        FileLock::acquire(&path).map_err(|e| StateError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SchedulingError;
    use crate::phase::{Phase, PhaseMachine};
    use crate::state::{UnitStatus, WorkUnit};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn make_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (StateStore::new(dir.path().join(".waypoint")), dir)
    }

    fn finish(store: &StateStore) {
        store
            .apply(|r| {
                for phase in Phase::WORK_PHASES {
                    PhaseMachine::begin(r, phase)?;
                    PhaseMachine::complete(r, phase)?;
                }
                PhaseMachine::finish(r)?;
                Ok::<_, StateError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_read_uninitialized() {
        let (store, _dir) = make_store();
        assert!(store.try_read().unwrap().is_none());
        assert!(matches!(
            store.read(),
            Err(StateError::NotInitialized { .. })
        ));
        assert!(!store.active().unwrap());
        let err = store.update(|_| {}).unwrap_err();
        assert!(matches!(err, StateError::NotInitialized { .. }));
    }

    #[test]
    fn test_init_then_already_active() {
        let (store, _dir) = make_store();
        let rec = store.init("add login").unwrap();
        assert!(store.active().unwrap());
        assert_eq!(store.read().unwrap().session_id, rec.session_id);

        let err = store.init("something else").unwrap_err();
        match err {
            StateError::AlreadyActive { session_id, phase } => {
                assert_eq!(session_id, rec.session_id);
                assert_eq!(phase, "preparation");
            }
            other => panic!("Expected AlreadyActive, got {other:?}"),
        }
    }

    #[test]
    fn test_init_archives_completed_record() {
        let (store, _dir) = make_store();
        let first = store.init("first").unwrap();
        finish(&store);
        assert!(!store.active().unwrap());

        let second = store.init("second").unwrap();
        assert_ne!(first.session_id, second.session_id);
        let archived = store.archive_dir().join(format!("{}.json", first.session_id));
        assert!(archived.exists());
    }

    #[test]
    fn test_reinit_replaces_active_record() {
        let (store, _dir) = make_store();
        let first = store.init("first").unwrap();
        let second = store.reinit("second").unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(store.read().unwrap().original_request, "second");
        assert!(
            store
                .archive_dir()
                .join(format!("{}.json", first.session_id))
                .exists()
        );
    }

    #[test]
    fn test_apply_stamps_version_and_updated_at() {
        let (store, _dir) = make_store();
        let rec = store.init("add login").unwrap();
        let updated = store
            .update(|r| r.record_error("boom", None))
            .unwrap();
        assert_eq!(updated.version, rec.version + 1);
        assert!(updated.updated_at >= rec.updated_at);
        assert_eq!(updated.execution.errors.len(), 1);
    }

    #[test]
    fn test_failed_transform_writes_nothing() {
        let (store, _dir) = make_store();
        store.init("add login").unwrap();
        let before = store.read().unwrap();

        let err = store
            .apply(|r| {
                r.record_error("partial", None);
                r.set_unit_status("S404", UnitStatus::Completed)
                    .map_err(StateError::from)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::Scheduling(SchedulingError::UnknownUnit { .. })
        ));
        assert_eq!(store.read().unwrap(), before);
    }

    #[test]
    fn test_apply_expecting_detects_conflict() {
        let (store, _dir) = make_store();
        let rec = store.init("add login").unwrap();
        store.update(|r| r.record_error("first", None)).unwrap();

        let err = store
            .apply_expecting(rec.version, |r| {
                r.record_error("stale", None);
                Ok::<_, StateError>(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::VersionConflict {
                expected: 0,
                found: 1
            }
        ));

        store
            .apply_expecting(1, |r| {
                r.record_error("fresh", None);
                Ok::<_, StateError>(())
            })
            .unwrap();
        assert_eq!(store.read().unwrap().execution.errors.len(), 2);
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let (store, _dir) = make_store();
        fs::create_dir_all(store.root()).unwrap();
        fs::write(store.state_path(), "{ not json").unwrap();
        assert!(matches!(store.read(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let (store, _dir) = make_store();
        store.init("add login").unwrap();
        store
            .apply(|r| {
                for i in 0..8 {
                    r.add_unit(None, WorkUnit::story(&format!("S{i}"), "story", &[]))?;
                }
                Ok::<_, StateError>(())
            })
            .unwrap();

        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .apply(|r| {
                            r.set_unit_status(&format!("S{i}"), UnitStatus::Completed)?;
                            Ok::<_, StateError>(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let rec = store.read().unwrap();
        assert_eq!(rec.completed_stories().len(), 8);
        assert_eq!(rec.version, 9);
    }

    #[test]
    fn test_recovery_after_restart() {
        let dir = tempdir().unwrap();
        let root = dir.path().join(".waypoint");
        let session = {
            let store = StateStore::new(&root);
            let rec = store.init("add login").unwrap();
            store
                .update(|r| r.execution.current_unit_path = Some("S1.T2".into()))
                .unwrap();
            rec.session_id
        };

        let store = StateStore::new(&root);
        let rec = store.read().unwrap();
        assert_eq!(rec.session_id, session);
        assert_eq!(rec.execution.current_unit_path.as_deref(), Some("S1.T2"));
    }
}
