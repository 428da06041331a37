//! Canonical execution state.
//!
//! - `record`: the `ExecutionRecord` document and its phase sections
//! - `unit`: the Story → Task → Subtask work hierarchy
//! - `store`: locked, atomic persistence of the record
//! - `transform`: JSON operation documents applied by `waypoint state apply`

pub mod record;
pub mod store;
pub mod transform;
pub mod unit;

pub use record::{
    ErrorEntry, ExecutionRecord, ExecutionState, PlanState, PreparationState, VerificationState,
};
pub use store::{ARCHIVE_DIR, LOCK_FILE, STATE_FILE, StateStore};
pub use transform::{Transform, apply_transforms, parse_transforms};
pub use unit::{UnitLevel, UnitStatus, WorkUnit};
