//! The canonical execution record persisted by the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

use super::unit::{UnitStatus, WorkUnit};
use crate::dag::check_dispatch;
use crate::errors::SchedulingError;
use crate::gates::GateReport;
use crate::phase::{Phase, PhaseStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreparationState {
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub detected_signals: BTreeSet<String>,
    #[serde(default)]
    pub recommended_advisories: BTreeSet<String>,
    #[serde(default)]
    pub invoked_advisories: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanState {
    #[serde(default)]
    pub status: PhaseStatus,
    /// Story-level units; tasks and subtasks hang off `children`
    #[serde(default)]
    pub units: Vec<WorkUnit>,
}

/// An error recorded during execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEntry {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionState {
    #[serde(default)]
    pub status: PhaseStatus,
    /// Id of the unit most recently dispatched; the resume point after an interruption
    #[serde(default)]
    pub current_unit_path: Option<String>,
    #[serde(default)]
    pub files_modified: BTreeSet<PathBuf>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VerificationState {
    #[serde(default)]
    pub status: PhaseStatus,
    /// Latest gate report per gate phase
    #[serde(default)]
    pub gates: BTreeMap<String, GateReport>,
}

/// The root execution record, one per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub session_id: String,
    /// Incremented on every successful store update
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub original_request: String,
    /// Top-level phase pointer; `completed` is terminal
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub preparation: PreparationState,
    #[serde(default)]
    pub plan: PlanState,
    #[serde(default)]
    pub execution: ExecutionState,
    #[serde(default)]
    pub verification: VerificationState,
    #[serde(default)]
    pub last_checkpoint: Option<String>,
    /// Append-only history of checkpoint ids taken for this session
    #[serde(default)]
    pub checkpoint_list: Vec<String>,
}

impl ExecutionRecord {
    pub fn new(request: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            version: 0,
            created_at: now,
            updated_at: now,
            original_request: request.to_string(),
            phase: Phase::Preparation,
            preparation: PreparationState::default(),
            plan: PlanState::default(),
            execution: ExecutionState::default(),
            verification: VerificationState::default(),
            last_checkpoint: None,
            checkpoint_list: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Sub-status of a work phase. `Completed` reports `completed` once reached.
    pub fn status_of(&self, phase: Phase) -> PhaseStatus {
        match phase {
            Phase::Preparation => self.preparation.status,
            Phase::Planning => self.plan.status,
            Phase::Execution => self.execution.status,
            Phase::Verification => self.verification.status,
            Phase::Completed => {
                if self.is_terminal() {
                    PhaseStatus::Completed
                } else {
                    PhaseStatus::Pending
                }
            }
        }
    }

    /// Overwrite a phase sub-status without transition checks.
    pub fn set_status(&mut self, phase: Phase, status: PhaseStatus) {
        match phase {
            Phase::Preparation => self.preparation.status = status,
            Phase::Planning => self.plan.status = status,
            Phase::Execution => self.execution.status = status,
            Phase::Verification => self.verification.status = status,
            Phase::Completed => {}
        }
    }

    pub fn stories(&self) -> &[WorkUnit] {
        &self.plan.units
    }

    pub fn find_unit(&self, id: &str) -> Option<&WorkUnit> {
        self.plan.units.iter().find_map(|u| u.find(id))
    }

    pub fn find_unit_mut(&mut self, id: &str) -> Option<&mut WorkUnit> {
        self.plan.units.iter_mut().find_map(|u| u.find_mut(id))
    }

    /// The story that contains unit `id`.
    pub fn story_of(&self, id: &str) -> Option<&WorkUnit> {
        self.plan.units.iter().find(|s| s.find(id).is_some())
    }

    /// Ids of stories whose effective status is `completed`.
    pub fn completed_stories(&self) -> HashSet<String> {
        self.plan
            .units
            .iter()
            .filter(|s| s.effective_status() == UnitStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Add a unit as a new story (no parent) or as a child of `parent`.
    pub fn add_unit(&mut self, parent: Option<&str>, unit: WorkUnit) -> Result<(), SchedulingError> {
        let existing: HashSet<String> = self.plan.units.iter().flat_map(|u| u.ids()).collect();
        if let Some(dup) = unit.ids().into_iter().find(|id| existing.contains(id)) {
            return Err(SchedulingError::DuplicateUnit { id: dup });
        }
        match parent {
            None => self.plan.units.push(unit),
            Some(parent_id) => {
                let parent = self
                    .find_unit_mut(parent_id)
                    .ok_or_else(|| SchedulingError::UnknownUnit {
                        id: parent_id.to_string(),
                    })?;
                parent.children.push(unit);
            }
        }
        Ok(())
    }

    /// Change the status of a unit.
    ///
    /// Moving a unit to `in_progress` or `completed` requires every dependency
    /// of its story to be completed.
    pub fn set_unit_status(&mut self, id: &str, status: UnitStatus) -> Result<(), SchedulingError> {
        let story = self
            .story_of(id)
            .ok_or_else(|| SchedulingError::UnknownUnit { id: id.to_string() })?;
        if status.requires_dependencies() {
            check_dispatch(story, &self.completed_stories())?;
        }
        if let Some(unit) = self.find_unit_mut(id) {
            unit.status = status;
        }
        Ok(())
    }

    /// Mark a unit and all of its descendants with `status`.
    pub fn set_subtree_status(&mut self, id: &str, status: UnitStatus) -> Result<(), SchedulingError> {
        self.set_unit_status(id, status)?;
        if let Some(unit) = self.find_unit_mut(id) {
            unit.set_subtree_status(status);
        }
        Ok(())
    }

    pub fn record_error(&mut self, message: impl Into<String>, unit: Option<&str>) {
        self.execution.errors.push(ErrorEntry {
            message: message.into(),
            unit: unit.map(str::to_string),
            recorded_at: Utc::now(),
        });
    }
}
