//! Declarative state transforms.
//!
//! External writers (hooks, scripts) cannot pass closures, so `waypoint state
//! apply` accepts a JSON operation document instead. A document is either a
//! single operation or an array of them; the whole list is applied inside one
//! store update, so either every operation lands or none does.
//!
//! ```json
//! [
//!   {"op": "set_phase_status", "phase": "execution", "status": "in_progress"},
//!   {"op": "set_current_unit", "unit": "S1.T2"},
//!   {"op": "merge", "patch": {"execution": {"errors": []}}}
//! ]
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

use super::record::ExecutionRecord;
use super::unit::{UnitStatus, WorkUnit};
use crate::phase::{Phase, PhaseMachine, PhaseStatus};

/// A single state operation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    /// Drive a phase through the state machine.
    SetPhaseStatus { phase: Phase, status: PhaseStatus },
    /// Add a story (no parent) or a child unit.
    AddUnit {
        #[serde(default)]
        parent: Option<String>,
        unit: WorkUnit,
    },
    SetUnitStatus {
        unit: String,
        status: UnitStatus,
        /// Apply to every descendant as well
        #[serde(default)]
        recursive: bool,
    },
    SetCurrentUnit { unit: Option<String> },
    AddFileModified { path: PathBuf },
    RecordError {
        message: String,
        #[serde(default)]
        unit: Option<String>,
    },
    /// Replace detected signals and the advisories recommended for them.
    SetSignals {
        signals: Vec<String>,
        #[serde(default)]
        advisories: Vec<String>,
    },
    InvokeAdvisory { advisory: String },
    /// RFC 7396 JSON merge patch over the whole record.
    Merge { patch: Value },
}

impl Transform {
    pub fn apply(&self, record: &mut ExecutionRecord) -> Result<()> {
        match self {
            Transform::SetPhaseStatus { phase, status } => match status {
                PhaseStatus::InProgress => PhaseMachine::begin(record, *phase)?,
                PhaseStatus::Completed if phase.is_terminal() => PhaseMachine::finish(record)?,
                PhaseStatus::Completed => PhaseMachine::complete(record, *phase)?,
                PhaseStatus::Failed => PhaseMachine::fail(record, *phase)?,
                PhaseStatus::Pending => {
                    bail!("Cannot move phase {} back to pending", phase)
                }
            },
            Transform::AddUnit { parent, unit } => {
                record.add_unit(parent.as_deref(), unit.clone())?;
            }
            Transform::SetUnitStatus {
                unit,
                status,
                recursive,
            } => {
                if *recursive {
                    record.set_subtree_status(unit, *status)?;
                } else {
                    record.set_unit_status(unit, *status)?;
                }
            }
            Transform::SetCurrentUnit { unit } => {
                if let Some(id) = unit
                    && record.find_unit(id).is_none()
                {
                    bail!("Unit {} not found in plan", id);
                }
                record.execution.current_unit_path = unit.clone();
            }
            Transform::AddFileModified { path } => {
                record.execution.files_modified.insert(path.clone());
            }
            Transform::RecordError { message, unit } => {
                record.record_error(message.clone(), unit.as_deref());
            }
            Transform::SetSignals {
                signals,
                advisories,
            } => {
                record.preparation.detected_signals = signals.iter().cloned().collect();
                record.preparation.recommended_advisories = advisories.iter().cloned().collect();
            }
            Transform::InvokeAdvisory { advisory } => {
                record
                    .preparation
                    .invoked_advisories
                    .insert(advisory.clone());
            }
            Transform::Merge { patch } => {
                check_merge_patch(patch)?;
                let mut doc = serde_json::to_value(&*record)?;
                merge_patch(&mut doc, patch);
                let mut patched: ExecutionRecord = serde_json::from_value(doc)
                    .context("Merge patch produced an invalid execution record")?;
                // Identity and checkpoint bookkeeping are owned by the store
                patched.session_id = std::mem::take(&mut record.session_id);
                patched.version = record.version;
                patched.created_at = record.created_at;
                patched.last_checkpoint = record.last_checkpoint.take();
                patched.checkpoint_list = std::mem::take(&mut record.checkpoint_list);
                *record = patched;
            }
        }
        Ok(())
    }
}

/// Record sections whose status belongs to the phase machine.
const PHASE_SECTIONS: [&str; 4] = ["preparation", "plan", "execution", "verification"];

/// Reject merge patches that would sidestep the phase machine, the dispatch
/// rules on units or the gate pipeline. Those go through their own operations.
fn check_merge_patch(patch: &Value) -> Result<()> {
    let Value::Object(fields) = patch else {
        bail!("Merge patch must be a JSON object");
    };
    if fields.contains_key("phase") {
        bail!("Merge patch may not change phase; use set_phase_status");
    }
    for section in PHASE_SECTIONS {
        let Some(value) = fields.get(section) else {
            continue;
        };
        let Value::Object(inner) = value else {
            bail!("Merge patch may not replace {section}; patch individual fields instead");
        };
        if inner.contains_key("status") {
            bail!("Merge patch may not change {section}.status; use set_phase_status");
        }
    }
    if let Some(Value::Object(plan)) = fields.get("plan")
        && plan.contains_key("units")
    {
        bail!("Merge patch may not change plan.units; use add_unit or set_unit_status");
    }
    if let Some(Value::Object(verification)) = fields.get("verification")
        && verification.contains_key("gates")
    {
        bail!("Merge patch may not change verification.gates; use `waypoint gate run-phase`");
    }
    Ok(())
}

/// Parse a transform document: one operation object or an array of them.
pub fn parse_transforms(input: &str) -> Result<Vec<Transform>> {
    let value: Value = serde_json::from_str(input).context("Transform is not valid JSON")?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                serde_json::from_value(item)
                    .with_context(|| format!("Invalid transform at index {i}"))
            })
            .collect(),
        Value::Object(_) => Ok(vec![
            serde_json::from_value(value).context("Invalid transform")?,
        ]),
        _ => bail!("Transform must be a JSON object or an array of objects"),
    }
}

/// Apply `transforms` in order, stopping at the first failure.
pub fn apply_transforms(record: &mut ExecutionRecord, transforms: &[Transform]) -> Result<()> {
    for (i, transform) in transforms.iter().enumerate() {
        transform
            .apply(record)
            .with_context(|| format!("Transform {i} failed"))?;
    }
    Ok(())
}

/// RFC 7396: objects merge recursively, `null` removes a key, anything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}
