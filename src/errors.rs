//! Typed error hierarchy for waypoint.
//!
//! One enum per subsystem:
//! - `StateError` — state store initialization, locking and persistence
//! - `SchedulingError` — dependency graph and dispatch-order violations
//! - `PhaseError` — illegal phase transitions
//! - `CheckpointError` — snapshot creation, lookup and restore
//! - `RegistryError` — worker registration protocol violations
//! - `GateError` — quality gate configuration errors
//!
//! A failing quality check is *not* an error: it is recorded as a
//! `GateResult` with status `fail`.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("No execution record at {root}. Run 'waypoint state init <request>' first")]
    NotInitialized { root: PathBuf },

    #[error("Session {session_id} is still active (phase: {phase}); finish or archive it first")]
    AlreadyActive { session_id: String, phase: String },

    #[error("State version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("Failed to parse execution record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize execution record: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the dependency scheduler and from dispatch-order checks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("Cyclic dependency between units: {}", units.join(", "))]
    CyclicDependency { units: Vec<String> },

    #[error("Unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Duplicate unit id: {id}")]
    DuplicateUnit { id: String },

    #[error("Unit {id} not found in plan")]
    UnknownUnit { id: String },

    #[error("Unit {unit} cannot start: dependencies not completed: {}", pending.join(", "))]
    DependenciesUnmet { unit: String, pending: Vec<String> },
}

/// Errors from the phase state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("Illegal transition of {phase} to {to}: {reason}")]
    IllegalTransition {
        phase: String,
        to: String,
        reason: String,
    },

    #[error("Unknown phase '{0}'. Valid values: preparation, planning, execution, verification")]
    UnknownPhase(String),
}

/// Errors from the checkpoint manager.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No active execution record to checkpoint")]
    NoActiveRecord,

    #[error("Checkpoint '{identifier}' not found. Run 'waypoint checkpoint list' to see available checkpoints")]
    NotFound { identifier: String },

    #[error("Checkpoint identifier '{identifier}' is ambiguous; matches: {}", matches.join(", "))]
    Ambiguous {
        identifier: String,
        matches: Vec<String>,
    },

    #[error("Checkpoint {id} failed integrity check (digest mismatch)")]
    DigestMismatch { id: String },

    #[error("Failed to parse checkpoint at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(StateError),
}

impl From<StateError> for CheckpointError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotInitialized { .. } => CheckpointError::NoActiveRecord,
            other => CheckpointError::State(other),
        }
    }
}

/// Errors from the worker registry. These indicate caller protocol violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Agent {agent_id} is already registered")]
    DuplicateAgent { agent_id: String },

    #[error("Agent {agent_id} is not registered")]
    UnknownAgent { agent_id: String },

    #[error("Agent {agent_id} already finished with status {status}")]
    AlreadyFinished { agent_id: String, status: String },

    #[error("Status '{status}' is not a final worker status")]
    NotFinalStatus { status: String },

    #[error("Invalid agent id '{agent_id}': use letters, digits, '-', '_' or '.', not starting with '.'")]
    InvalidAgentId { agent_id: String },
}

/// Errors from the quality gate pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("Unknown check '{name}'. Define it under [checks.{name}] in waypoint.toml")]
    UnknownCheck { name: String },

    #[error("No gate configured for phase '{phase}'")]
    UnknownGatePhase { phase: String },
}
