//! Structured difference between two execution records.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::phase::{Phase, PhaseStatus};
use crate::state::{ExecutionRecord, UnitStatus, WorkUnit};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusChange<T> {
    pub from: T,
    pub to: T,
}

/// A unit that was added, removed, or changed status. `None` means absent.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UnitChange {
    pub id: String,
    pub from: Option<UnitStatus>,
    pub to: Option<UnitStatus>,
}

/// What changed going from a snapshot (`from`) to another record (`to`).
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct RecordDiff {
    pub version_from: u64,
    pub version_to: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<StatusChange<Phase>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub phase_statuses: BTreeMap<String, StatusChange<PhaseStatus>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<UnitChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files_added: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files_removed: Vec<PathBuf>,
    /// Change in the number of recorded errors
    pub errors_delta: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gates_changed: Vec<String>,
}

impl RecordDiff {
    pub fn is_empty(&self) -> bool {
        self.phase.is_none()
            && self.phase_statuses.is_empty()
            && self.units.is_empty()
            && self.files_added.is_empty()
            && self.files_removed.is_empty()
            && self.errors_delta == 0
            && self.gates_changed.is_empty()
    }
}

fn flatten(units: &[WorkUnit], out: &mut BTreeMap<String, UnitStatus>) {
    for unit in units {
        out.insert(unit.id.clone(), unit.status);
        flatten(&unit.children, out);
    }
}

pub fn diff_records(from: &ExecutionRecord, to: &ExecutionRecord) -> RecordDiff {
    let mut diff = RecordDiff {
        version_from: from.version,
        version_to: to.version,
        ..Default::default()
    };

    if from.phase != to.phase {
        diff.phase = Some(StatusChange {
            from: from.phase,
            to: to.phase,
        });
    }

    for phase in Phase::WORK_PHASES {
        let (a, b) = (from.status_of(phase), to.status_of(phase));
        if a != b {
            diff.phase_statuses
                .insert(phase.to_string(), StatusChange { from: a, to: b });
        }
    }

    let mut before = BTreeMap::new();
    let mut after = BTreeMap::new();
    flatten(&from.plan.units, &mut before);
    flatten(&to.plan.units, &mut after);
    for (id, status) in &before {
        match after.get(id) {
            Some(new) if new == status => {}
            new => diff.units.push(UnitChange {
                id: id.clone(),
                from: Some(*status),
                to: new.copied(),
            }),
        }
    }
    for (id, status) in &after {
        if !before.contains_key(id) {
            diff.units.push(UnitChange {
                id: id.clone(),
                from: None,
                to: Some(*status),
            });
        }
    }
    diff.units.sort_by(|a, b| a.id.cmp(&b.id));

    let (old_files, new_files) = (&from.execution.files_modified, &to.execution.files_modified);
    diff.files_added = new_files.difference(old_files).cloned().collect();
    diff.files_removed = old_files.difference(new_files).cloned().collect();

    diff.errors_delta = to.execution.errors.len() as i64 - from.execution.errors.len() as i64;

    for (gate, report) in &to.verification.gates {
        if from.verification.gates.get(gate) != Some(report) {
            diff.gates_changed.push(gate.clone());
        }
    }
    for gate in from.verification.gates.keys() {
        if !to.verification.gates.contains_key(gate) {
            diff.gates_changed.push(gate.clone());
        }
    }
    diff.gates_changed.sort();
    diff.gates_changed.dedup();

    diff
}

impl std::fmt::Display for RecordDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes (version {} -> {})", self.version_from, self.version_to);
        }
        writeln!(f, "version: {} -> {}", self.version_from, self.version_to)?;
        if let Some(change) = &self.phase {
            writeln!(f, "phase: {} -> {}", change.from, change.to)?;
        }
        for (phase, change) in &self.phase_statuses {
            writeln!(f, "{}: {} -> {}", phase, change.from, change.to)?;
        }
        let show = |s: Option<UnitStatus>| s.map_or("(absent)".to_string(), |s| s.to_string());
        for unit in &self.units {
            writeln!(f, "unit {}: {} -> {}", unit.id, show(unit.from), show(unit.to))?;
        }
        for path in &self.files_added {
            writeln!(f, "+ {}", path.display())?;
        }
        for path in &self.files_removed {
            writeln!(f, "- {}", path.display())?;
        }
        if self.errors_delta != 0 {
            writeln!(f, "errors: {:+}", self.errors_delta)?;
        }
        if !self.gates_changed.is_empty() {
            writeln!(f, "gates changed: {}", self.gates_changed.join(", "))?;
        }
        Ok(())
    }
}
