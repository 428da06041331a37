//! Recovery detection: where execution stands after an interruption.
//!
//! The persisted record is the only input. `resume_phase` is a pure function
//! of the record; `detect` adds the "is there an active session at all" check
//! (absent, terminal, or stale records are not resumed).
//!
//! Precedence, first match wins:
//! 1. Verification `in_progress`
//! 2. Execution `in_progress` (resume at `current_unit_path`)
//! 3. Planning `in_progress`
//! 4. Preparation `in_progress`
//! 5. the first `pending` phase whose predecessor is `completed`
//! 6. the first phase that is not `completed`
//! 7. Verification
//!
//! Several phases `in_progress` at once should not happen; the report then
//! names the most advanced one and sets `ambiguous`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::errors::StateError;
use crate::phase::{Phase, PhaseStatus};
use crate::state::{ExecutionRecord, StateStore};

/// Why there is no session to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    NoRecord,
    Completed,
    Stale,
}

impl std::fmt::Display for InactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InactiveReason::NoRecord => write!(f, "no execution record"),
            InactiveReason::Completed => write!(f, "session completed"),
            InactiveReason::Stale => write!(f, "record is stale"),
        }
    }
}

/// Where to continue within an active record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumePoint {
    pub phase: Phase,
    /// Unit to resume at; set for the Execution phase
    pub unit: Option<String>,
    /// More than one phase was `in_progress`
    pub ambiguous: bool,
    pub in_progress: Vec<Phase>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactive_reason: Option<InactiveReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumePoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RecoveryReport {
    fn inactive(reason: InactiveReason, record: Option<&ExecutionRecord>) -> Self {
        Self {
            active: false,
            inactive_reason: Some(reason),
            session_id: record.map(|r| r.session_id.clone()),
            resume: None,
            last_checkpoint: record.and_then(|r| r.last_checkpoint.clone()),
            updated_at: record.map(|r| r.updated_at),
        }
    }
}

/// Derive the resume phase of a non-terminal record.
pub fn resume_phase(record: &ExecutionRecord) -> ResumePoint {
    let in_progress: Vec<Phase> = Phase::WORK_PHASES
        .into_iter()
        .rev()
        .filter(|p| record.status_of(*p) == PhaseStatus::InProgress)
        .collect();

    let phase = in_progress
        .first()
        .copied()
        .or_else(|| {
            Phase::WORK_PHASES.into_iter().find(|p| {
                record.status_of(*p) == PhaseStatus::Pending
                    && p
                        .predecessor()
                        .is_none_or(|prev| record.status_of(prev) == PhaseStatus::Completed)
            })
        })
        .or_else(|| {
            Phase::WORK_PHASES
                .into_iter()
                .find(|p| record.status_of(*p) != PhaseStatus::Completed)
        })
        .unwrap_or(Phase::Verification);

    let unit = (phase == Phase::Execution)
        .then(|| record.execution.current_unit_path.clone())
        .flatten();

    ResumePoint {
        phase,
        unit,
        ambiguous: in_progress.len() > 1,
        in_progress,
    }
}

/// Recovery report for `record` as of `now`.
pub fn detect(
    record: Option<&ExecutionRecord>,
    now: DateTime<Utc>,
    freshness: Duration,
) -> RecoveryReport {
    let Some(record) = record else {
        return RecoveryReport::inactive(InactiveReason::NoRecord, None);
    };
    if record.is_terminal() {
        return RecoveryReport::inactive(InactiveReason::Completed, Some(record));
    }
    let window = chrono::Duration::from_std(freshness).unwrap_or(chrono::Duration::MAX);
    if now - record.updated_at > window {
        return RecoveryReport::inactive(InactiveReason::Stale, Some(record));
    }

    RecoveryReport {
        active: true,
        inactive_reason: None,
        session_id: Some(record.session_id.clone()),
        resume: Some(resume_phase(record)),
        last_checkpoint: record.last_checkpoint.clone(),
        updated_at: Some(record.updated_at),
    }
}

/// Reads the store and reports where to resume.
pub struct RecoveryDetector {
    store: StateStore,
    freshness: Duration,
}

impl RecoveryDetector {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            freshness: Duration::from_secs(24 * 3600),
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn detect(&self) -> Result<RecoveryReport, StateError> {
        let record = self.store.try_read()?;
        Ok(detect(record.as_ref(), Utc::now(), self.freshness))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn with_statuses(statuses: [PhaseStatus; 4]) -> ExecutionRecord {
        let mut rec = ExecutionRecord::new("add login");
        for (phase, status) in Phase::WORK_PHASES.into_iter().zip(statuses) {
            rec.set_status(phase, status);
        }
        rec
    }

    #[test]
    fn test_fresh_record_resumes_preparation() {
        let rec = ExecutionRecord::new("add login");
        let point = resume_phase(&rec);
        assert_eq!(point.phase, Phase::Preparation);
        assert!(!point.ambiguous);
    }

    #[test]
    fn test_execution_in_progress_resumes_at_unit() {
        use PhaseStatus::*;
        let mut rec = with_statuses([Completed, Completed, InProgress, Pending]);
        rec.execution.current_unit_path = Some("S1.T2".into());
        let point = resume_phase(&rec);
        assert_eq!(point.phase, Phase::Execution);
        assert_eq!(point.unit.as_deref(), Some("S1.T2"));
    }

    #[test]
    fn test_pending_after_completed_predecessor() {
        use PhaseStatus::*;
        let rec = with_statuses([Completed, Completed, Pending, Pending]);
        assert_eq!(resume_phase(&rec).phase, Phase::Execution);
    }

    #[test]
    fn test_multiple_in_progress_picks_most_advanced() {
        use PhaseStatus::*;
        let rec = with_statuses([InProgress, Completed, InProgress, Pending]);
        let point = resume_phase(&rec);
        assert_eq!(point.phase, Phase::Execution);
        assert!(point.ambiguous);
        assert_eq!(point.in_progress, vec![Phase::Execution, Phase::Preparation]);
    }

    #[test]
    fn test_failed_phase_is_resumed() {
        use PhaseStatus::*;
        let rec = with_statuses([Completed, Completed, Failed, Pending]);
        assert_eq!(resume_phase(&rec).phase, Phase::Execution);
    }

    #[test]
    fn test_resume_is_deterministic_over_all_permutations() {
        use PhaseStatus::*;
        let all = [Pending, InProgress, Completed, Failed];
        for a in all {
            for b in all {
                for c in all {
                    for d in all {
                        let rec = with_statuses([a, b, c, d]);
                        let first = resume_phase(&rec);
                        assert_eq!(first, resume_phase(&rec));
                        assert!(Phase::WORK_PHASES.contains(&first.phase));

                        let most_advanced_in_progress = Phase::WORK_PHASES
                            .into_iter()
                            .rev()
                            .find(|p| rec.status_of(*p) == InProgress);
                        if let Some(expected) = most_advanced_in_progress {
                            assert_eq!(first.phase, expected);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_all_completed_falls_back_to_verification() {
        use PhaseStatus::*;
        let rec = with_statuses([Completed, Completed, Completed, Completed]);
        assert_eq!(resume_phase(&rec).phase, Phase::Verification);
    }

    #[test]
    fn test_detect_inactive_cases() {
        let now = Utc::now();
        let report = detect(None, now, DAY);
        assert!(!report.active);
        assert_eq!(report.inactive_reason, Some(InactiveReason::NoRecord));

        let mut rec = ExecutionRecord::new("add login");
        rec.updated_at = now - chrono::Duration::hours(25);
        let report = detect(Some(&rec), now, DAY);
        assert_eq!(report.inactive_reason, Some(InactiveReason::Stale));
        assert_eq!(report.session_id.as_deref(), Some(rec.session_id.as_str()));

        rec.updated_at = now;
        rec.phase = Phase::Completed;
        let report = detect(Some(&rec), now, DAY);
        assert_eq!(report.inactive_reason, Some(InactiveReason::Completed));
    }

    #[test]
    fn test_detector_reads_store() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let detector = RecoveryDetector::new(store.clone()).with_freshness(DAY);
        assert!(!detector.detect().unwrap().active);

        store.init("add login").unwrap();
        let report = detector.detect().unwrap();
        assert!(report.active);
        assert_eq!(report.resume.unwrap().phase, Phase::Preparation);
    }
}
