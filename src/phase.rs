//! Top-level phases and the phase state machine.
//!
//! This module provides:
//! - `Phase`: the four work phases plus the terminal `Completed`
//! - `PhaseStatus`: the local sub-status carried by each work phase
//! - `PhaseMachine`: the legal transitions, applied to an `ExecutionRecord`
//!
//! Transitions only move forward. A phase may be started only once its
//! predecessor is `completed`; `Completed` is terminal and only a fresh
//! `init` (which archives the record) leaves it.

use serde::{Deserialize, Serialize};

use crate::errors::PhaseError;
use crate::gates::PRE_COMPLETE;
use crate::state::ExecutionRecord;

/// A top-level execution phase.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Preparation,
    Planning,
    Execution,
    Verification,
    /// Terminal state; no transition out except a new session.
    Completed,
}

impl Phase {
    /// The four work phases in execution order.
    pub const WORK_PHASES: [Phase; 4] = [
        Phase::Preparation,
        Phase::Planning,
        Phase::Execution,
        Phase::Verification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preparation => "preparation",
            Phase::Planning => "planning",
            Phase::Execution => "execution",
            Phase::Verification => "verification",
            Phase::Completed => "completed",
        }
    }

    /// The phase that must be `completed` before this one may start.
    pub fn predecessor(&self) -> Option<Phase> {
        match self {
            Phase::Preparation => None,
            Phase::Planning => Some(Phase::Preparation),
            Phase::Execution => Some(Phase::Planning),
            Phase::Verification => Some(Phase::Execution),
            Phase::Completed => Some(Phase::Verification),
        }
    }

    /// The phase that follows this one.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Preparation => Some(Phase::Planning),
            Phase::Planning => Some(Phase::Execution),
            Phase::Execution => Some(Phase::Verification),
            Phase::Verification => Some(Phase::Completed),
            Phase::Completed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preparation" | "prep" => Ok(Phase::Preparation),
            "planning" | "plan" => Ok(Phase::Planning),
            "execution" | "exec" => Ok(Phase::Execution),
            "verification" | "verify" => Ok(Phase::Verification),
            "completed" => Ok(Phase::Completed),
            _ => Err(PhaseError::UnknownPhase(s.to_string())),
        }
    }
}

/// Local sub-status of a work phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PhaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PhaseStatus::Pending),
            "in_progress" | "in-progress" | "inprogress" => Ok(PhaseStatus::InProgress),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            _ => anyhow::bail!(
                "Invalid phase status '{}'. Valid values: pending, in_progress, completed, failed",
                s
            ),
        }
    }
}

/// Legal phase transitions over an `ExecutionRecord`.
pub struct PhaseMachine;

impl PhaseMachine {
    /// Mark `phase` in progress. Re-entering an `in_progress` or `failed`
    /// phase is allowed so an interrupted or failed phase can be resumed.
    pub fn begin(record: &mut ExecutionRecord, phase: Phase) -> Result<(), PhaseError> {
        Self::ensure_open(record, phase, PhaseStatus::InProgress)?;
        if phase.is_terminal() {
            return Err(illegal(phase, PhaseStatus::InProgress, "use finish()"));
        }
        if let Some(prev) = phase.predecessor()
            && record.status_of(prev) != PhaseStatus::Completed
        {
            return Err(illegal(
                phase,
                PhaseStatus::InProgress,
                &format!("predecessor {} is {}", prev, record.status_of(prev)),
            ));
        }
        if record.status_of(phase) == PhaseStatus::Completed {
            return Err(illegal(phase, PhaseStatus::InProgress, "already completed"));
        }
        record.set_status(phase, PhaseStatus::InProgress);
        record.phase = phase;
        Ok(())
    }

    /// Mark an in-progress `phase` completed and point the record at the next phase.
    pub fn complete(record: &mut ExecutionRecord, phase: Phase) -> Result<(), PhaseError> {
        Self::ensure_open(record, phase, PhaseStatus::Completed)?;
        let current = record.status_of(phase);
        if current != PhaseStatus::InProgress {
            return Err(illegal(
                phase,
                PhaseStatus::Completed,
                &format!("phase is {current}, not in_progress"),
            ));
        }
        record.set_status(phase, PhaseStatus::Completed);
        if let Some(next) = phase.next()
            && !next.is_terminal()
        {
            record.phase = next;
        }
        Ok(())
    }

    /// Mark `phase` failed. The record stays on that phase so recovery resumes it.
    pub fn fail(record: &mut ExecutionRecord, phase: Phase) -> Result<(), PhaseError> {
        Self::ensure_open(record, phase, PhaseStatus::Failed)?;
        record.set_status(phase, PhaseStatus::Failed);
        record.phase = phase;
        Ok(())
    }

    /// Enter the terminal `Completed` phase.
    ///
    /// Requires Verification to be completed and refuses to finish while a
    /// recorded `pre_complete` gate report has failed.
    pub fn finish(record: &mut ExecutionRecord) -> Result<(), PhaseError> {
        if record.phase.is_terminal() {
            return Ok(());
        }
        if record.status_of(Phase::Verification) != PhaseStatus::Completed {
            return Err(illegal(
                Phase::Completed,
                PhaseStatus::Completed,
                "verification is not completed",
            ));
        }
        if let Some(report) = record.verification.gates.get(PRE_COMPLETE)
            && !report.passed
        {
            return Err(illegal(
                Phase::Completed,
                PhaseStatus::Completed,
                "pre_complete gate failed",
            ));
        }
        record.phase = Phase::Completed;
        Ok(())
    }

    fn ensure_open(
        record: &ExecutionRecord,
        phase: Phase,
        to: PhaseStatus,
    ) -> Result<(), PhaseError> {
        if record.phase.is_terminal() {
            return Err(illegal(phase, to, "session is completed"));
        }
        Ok(())
    }
}

fn illegal(phase: Phase, to: PhaseStatus, reason: &str) -> PhaseError {
    PhaseError::IllegalTransition {
        phase: phase.to_string(),
        to: to.to_string(),
        reason: reason.to_string(),
    }
}
