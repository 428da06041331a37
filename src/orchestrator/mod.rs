//! Execution controller.
//!
//! `Controller` wires the state store, scheduler, worker registry, gates and
//! checkpoints into the phase loop. The work of a unit is delegated to a
//! `Worker`; the decomposition of a request to a `Planner`.

mod controller;
mod planner;
mod worker;

pub use controller::{Controller, RunOutcome, RunStatus};
pub use planner::{FilePlanner, Planner, StaticPlanner, parse_plan};
pub use worker::{Assignment, CommandWorker, Worker, WorkerOutcome};
