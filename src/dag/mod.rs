//! Dependency-aware batch scheduling for stories.
//!
//! ## Architecture
//!
//! 1. **Builder** - Constructs a `StoryGraph` from story-level work units,
//!    rejecting duplicate ids and unknown dependencies
//! 2. **Scheduler** - Partitions the graph into batches that can run in
//!    parallel, detects cycles, and answers readiness queries
//!
//! The scheduler is authoritative: `check_dispatch` is consulted by the
//! execution record before any unit of a story is started or completed.
//!
//! ## Example
//!
//! ```
//! use waypoint::dag::DagScheduler;
//! use waypoint::state::WorkUnit;
//!
//! let stories = vec![
//!     WorkUnit::story("S1", "Login form", &[]),
//!     WorkUnit::story("S2", "Session cookie", &["S1"]),
//!     WorkUnit::story("S3", "Logout", &["S1"]),
//! ];
//! let scheduler = DagScheduler::from_units(&stories).unwrap();
//! let batches = scheduler.compute_batches().unwrap();
//! assert_eq!(batches, vec![vec!["S1"], vec!["S2", "S3"]]);
//! ```

mod builder;
mod scheduler;

pub use builder::{DagBuilder, StoryGraph, StoryIndex};
pub use scheduler::{DagScheduler, check_dispatch};
