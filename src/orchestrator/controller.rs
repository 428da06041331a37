//! The controller decision loop.
//!
//! One pass of `run` drives the record from wherever recovery says it stands
//! to `completed`, stopping early on a failed batch, a failed gate or
//! cancellation. Every decision is persisted before it is acted on, so an
//! interruption at any point leaves a record that the next `run` resumes.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::planner::Planner;
use super::worker::{Assignment, Worker, WorkerOutcome};
use crate::config::Config;
use crate::dag::DagScheduler;
use crate::errors::{SchedulingError, StateError};
use crate::gates::{GatePipeline, POST_BATCH, POST_PLANNING, PRE_COMPLETE, VERIFICATION, record_report};
use crate::phase::{Phase, PhaseMachine};
use crate::recovery::InactiveReason;
use crate::registry::{WorkerRegistry, WorkerStatus};
use crate::signals::detect_project_signals;
use crate::state::{StateStore, UnitStatus};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed { phase: Phase, reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    pub resumed: bool,
    pub batches_run: usize,
    #[serde(flatten)]
    pub status: RunStatus,
}

enum Step {
    Next,
    Stop(RunStatus),
}

#[derive(Debug, Default)]
struct BatchReport {
    succeeded: Vec<String>,
    failed: Vec<String>,
    cancelled: Vec<String>,
}

/// Drives an execution record through its phases.
pub struct Controller {
    config: Config,
    store: StateStore,
    registry: WorkerRegistry,
    gates: GatePipeline,
    worker: Arc<dyn Worker>,
    planner: Arc<dyn Planner>,
    cancel: CancellationToken,
    worker_timeout: Duration,
}

impl Controller {
    pub fn new(config: Config, worker: Arc<dyn Worker>, planner: Arc<dyn Planner>) -> Self {
        Self {
            store: config.store(),
            registry: config.registry(),
            gates: config.gates(),
            worker_timeout: config.worker_timeout(),
            config,
            worker,
            planner,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_worker_timeout(mut self, limit: Duration) -> Self {
        self.worker_timeout = limit;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a session for `request`, or resume the active one.
    pub async fn run(&self, request: &str) -> Result<RunOutcome> {
        self.config.ensure_directories()?;

        let report = self.config.recovery().detect()?;
        let (record, start, resumed) = match report.resume.filter(|_| report.active) {
            Some(point) => {
                let record = self.store.read()?;
                if record.original_request != request {
                    warn!(
                        session = %record.session_id,
                        "resuming active session; ignoring new request text"
                    );
                }
                info!(
                    session = %record.session_id,
                    phase = %point.phase,
                    unit = point.unit.as_deref().unwrap_or("-"),
                    ambiguous = point.ambiguous,
                    "resuming session"
                );
                (record, point.phase, true)
            }
            None => {
                let record = if report.inactive_reason == Some(InactiveReason::Stale) {
                    warn!("previous session is stale; archiving it");
                    self.store.reinit(request)?
                } else {
                    self.store.init(request)?
                };
                (record, Phase::Preparation, false)
            }
        };

        let mut outcome = RunOutcome {
            session_id: record.session_id.clone(),
            resumed,
            batches_run: 0,
            status: RunStatus::Completed,
        };

        let mut phase = start;
        while !phase.is_terminal() {
            if self.cancel.is_cancelled() {
                outcome.status = self.cancelled()?;
                return Ok(outcome);
            }
            let step = match phase {
                Phase::Preparation => self.prepare()?,
                Phase::Planning => self.plan().await?,
                Phase::Execution => self.execute(&mut outcome.batches_run).await?,
                Phase::Verification => self.verify().await?,
                Phase::Completed => break,
            };
            match step {
                Step::Next => phase = phase.next().unwrap_or(Phase::Completed),
                Step::Stop(status) => {
                    outcome.status = status;
                    return Ok(outcome);
                }
            }
        }

        info!(session = %outcome.session_id, batches = outcome.batches_run, "session completed");
        Ok(outcome)
    }

    fn prepare(&self) -> Result<Step> {
        let signals = detect_project_signals(&self.config.project_dir);
        let advisories = self.config.advisories().classify(&signals);
        info!(signals = ?signals, advisories = ?advisories, "preparation");

        self.store.apply(|rec| {
            PhaseMachine::begin(rec, Phase::Preparation)?;
            rec.preparation.detected_signals = signals;
            rec.preparation.recommended_advisories = advisories;
            PhaseMachine::complete(rec, Phase::Preparation)?;
            Ok::<_, StateError>(())
        })?;
        Ok(Step::Next)
    }

    async fn plan(&self) -> Result<Step> {
        self.begin(Phase::Planning)?;
        let record = self.store.read()?;

        if record.plan.units.is_empty() {
            let units = match self.planner.plan(&record.original_request).await {
                Ok(units) => units,
                Err(e) => return self.fail(Phase::Planning, format!("planner failed: {e:#}")),
            };
            if let Err(e) = DagScheduler::from_units(&units) {
                return self.fail(Phase::Planning, e.to_string());
            }
            info!(stories = units.len(), "plan accepted");
            self.store.apply(|rec| {
                for unit in units {
                    rec.add_unit(None, unit)?;
                }
                Ok::<_, StateError>(())
            })?;
        } else {
            info!(stories = record.plan.units.len(), "plan already recorded");
        }

        if let Some(stop) = self.gate(POST_PLANNING, Phase::Planning).await? {
            return Ok(stop);
        }
        self.complete(Phase::Planning)?;
        self.auto_checkpoint("after-planning")?;
        Ok(Step::Next)
    }

    async fn execute(&self, batches_run: &mut usize) -> Result<Step> {
        self.begin(Phase::Execution)?;
        let record = self.store.read()?;

        let batches = match DagScheduler::from_units(record.stories())
            .and_then(|s| s.remaining_batches(&record.completed_stories()))
        {
            Ok(batches) => batches,
            Err(e) => return self.fail(Phase::Execution, e.to_string()),
        };
        info!(batches = batches.len(), "execution");

        for (index, batch) in batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(Step::Stop(self.cancelled()?));
            }
            info!(batch = index + 1, units = ?batch, "dispatching batch");
            let mut report = self.run_batch(batch).await?;
            *batches_run += 1;

            if !report.cancelled.is_empty() || self.cancel.is_cancelled() {
                return Ok(Step::Stop(self.cancelled()?));
            }
            if !report.failed.is_empty() {
                report.failed.sort();
                return self.fail(
                    Phase::Execution,
                    format!("units failed: {}", report.failed.join(", ")),
                );
            }
            info!(batch = index + 1, succeeded = report.succeeded.len(), "batch completed");

            if let Some(stop) = self.gate(POST_BATCH, Phase::Execution).await? {
                return Ok(stop);
            }
            self.auto_checkpoint(&format!("after-batch-{}", index + 1))?;
        }

        self.store.apply(|rec| {
            rec.execution.current_unit_path = None;
            PhaseMachine::complete(rec, Phase::Execution)?;
            Ok::<_, StateError>(())
        })?;
        Ok(Step::Next)
    }

    async fn verify(&self) -> Result<Step> {
        self.auto_checkpoint("before-verification")?;
        self.begin(Phase::Verification)?;

        for gate in [VERIFICATION, PRE_COMPLETE] {
            if let Some(stop) = self.gate(gate, Phase::Verification).await? {
                return Ok(stop);
            }
        }

        self.store.apply(|rec| {
            PhaseMachine::complete(rec, Phase::Verification)?;
            PhaseMachine::finish(rec)?;
            Ok::<_, StateError>(())
        })?;
        self.auto_checkpoint("completed")?;
        Ok(Step::Next)
    }

    /// Dispatch every unit of a batch and wait for all of them.
    async fn run_batch(&self, batch: &[String]) -> Result<BatchReport> {
        let record = self.store.read()?;
        let advisories: Vec<String> = record
            .preparation
            .recommended_advisories
            .iter()
            .cloned()
            .collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_agents()));
        let mut join_set = JoinSet::new();
        // unit -> agent for every dispatched worker not yet joined
        let mut pending: BTreeMap<String, String> = BTreeMap::new();

        for unit_id in batch {
            let unit = record
                .find_unit(unit_id)
                .cloned()
                .ok_or_else(|| SchedulingError::UnknownUnit { id: unit_id.clone() })?;
            let agent_id = agent_id_for(unit_id);

            self.registry.register(&agent_id, unit_id, self.worker.kind())?;
            self.store.apply(|rec| {
                rec.set_unit_status(unit_id, UnitStatus::InProgress)?;
                rec.execution.current_unit_path = Some(unit_id.clone());
                Ok::<_, StateError>(())
            })?;
            pending.insert(unit_id.clone(), agent_id.clone());

            let assignment = Assignment {
                agent_id: agent_id.clone(),
                session_id: record.session_id.clone(),
                original_request: record.original_request.clone(),
                project_dir: self.config.project_dir.clone(),
                unit,
                advisories: advisories.clone(),
            };
            let worker = Arc::clone(&self.worker);
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.child_token();
            let limit = self.worker_timeout;
            let unit_id = unit_id.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = timeout(limit, worker.execute(assignment, cancel)).await;
                (agent_id, unit_id, outcome)
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = join_set.join_next().await {
            let (agent_id, unit_id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "worker task aborted");
                    continue;
                }
            };
            pending.remove(&unit_id);

            match outcome {
                Ok(Ok(outcome)) if outcome.success => {
                    self.record_success(&agent_id, &unit_id, outcome)?;
                    report.succeeded.push(unit_id);
                }
                Ok(Ok(outcome)) => {
                    let message = format!("worker {agent_id} reported failure");
                    self.registry
                        .record_result(&agent_id, outcome.result, WorkerStatus::Failed)?;
                    self.record_failure(&unit_id, &message)?;
                    report.failed.push(unit_id);
                }
                Ok(Err(e)) if self.cancel.is_cancelled() => {
                    self.registry.record_result(
                        &agent_id,
                        serde_json::json!({ "cancelled": true, "error": format!("{e:#}") }),
                        WorkerStatus::Failed,
                    )?;
                    self.store.apply(|rec| {
                        rec.set_unit_status(&unit_id, UnitStatus::Pending)?;
                        Ok::<_, StateError>(())
                    })?;
                    report.cancelled.push(unit_id);
                }
                Ok(Err(e)) => {
                    let message = format!("worker {agent_id} errored: {e:#}");
                    self.registry.record_result(
                        &agent_id,
                        serde_json::json!({ "error": format!("{e:#}") }),
                        WorkerStatus::Failed,
                    )?;
                    self.record_failure(&unit_id, &message)?;
                    report.failed.push(unit_id);
                }
                Err(_) => {
                    let message = format!(
                        "worker {agent_id} timed out after {} seconds",
                        self.worker_timeout.as_secs()
                    );
                    self.registry.record_timeout(&agent_id)?;
                    self.record_failure(&unit_id, &message)?;
                    report.failed.push(unit_id);
                }
            }
        }

        for (unit_id, agent_id) in pending {
            self.registry.record_result(
                &agent_id,
                serde_json::json!({ "aborted": true }),
                WorkerStatus::Failed,
            )?;
            self.record_failure(&unit_id, &format!("worker {agent_id} task aborted"))?;
            report.failed.push(unit_id);
        }
        Ok(report)
    }

    fn record_success(&self, agent_id: &str, unit_id: &str, outcome: WorkerOutcome) -> Result<()> {
        self.registry
            .record_result(agent_id, outcome.result, WorkerStatus::Completed)?;
        self.store.apply(|rec| {
            rec.set_subtree_status(unit_id, UnitStatus::Completed)?;
            rec.execution.files_modified.extend(outcome.files_modified);
            Ok::<_, StateError>(())
        })?;
        info!(agent = agent_id, unit = unit_id, "unit completed");
        Ok(())
    }

    fn record_failure(&self, unit_id: &str, message: &str) -> Result<()> {
        warn!(unit = unit_id, message, "unit failed");
        self.store.apply(|rec| {
            rec.set_subtree_status(unit_id, UnitStatus::Failed)?;
            rec.record_error(message, Some(unit_id));
            Ok::<_, StateError>(())
        })?;
        Ok(())
    }

    /// Run a gate phase if one is configured. Returns a stop step when it fails.
    async fn gate(&self, gate: &str, phase: Phase) -> Result<Option<Step>> {
        if !self.gates.has_phase(gate) {
            return Ok(None);
        }
        let report = self
            .gates
            .run_phase(gate, true)
            .await
            .with_context(|| format!("Failed to run gate '{gate}'"))?;
        self.store.update(|rec| record_report(rec, &report))?;

        if report.passed {
            return Ok(None);
        }
        let reason = match report.first_failure() {
            Some(failure) => format!(
                "gate {gate} failed at {}: {}",
                failure.check_name, failure.message
            ),
            None => format!("gate {gate} failed"),
        };
        self.fail(phase, reason).map(Some)
    }

    fn begin(&self, phase: Phase) -> Result<()> {
        self.store.apply(|rec| {
            PhaseMachine::begin(rec, phase)?;
            Ok::<_, StateError>(())
        })?;
        Ok(())
    }

    fn complete(&self, phase: Phase) -> Result<()> {
        self.store.apply(|rec| {
            PhaseMachine::complete(rec, phase)?;
            Ok::<_, StateError>(())
        })?;
        Ok(())
    }

    fn fail(&self, phase: Phase, reason: String) -> Result<Step> {
        error!(phase = %phase, reason = %reason, "phase failed");
        self.store.apply(|rec| {
            rec.record_error(reason.clone(), None);
            PhaseMachine::fail(rec, phase)?;
            Ok::<_, StateError>(())
        })?;
        Ok(Step::Stop(RunStatus::Failed { phase, reason }))
    }

    fn cancelled(&self) -> Result<RunStatus> {
        warn!("run cancelled; leaving session resumable");
        let checkpoints = self.config.checkpoints();
        checkpoints.create("cancelled")?;
        checkpoints.backup()?;
        Ok(RunStatus::Cancelled)
    }

    fn auto_checkpoint(&self, name: &str) -> Result<()> {
        if self.config.auto_checkpoint() {
            self.config.checkpoints().create(name)?;
        }
        Ok(())
    }
}

fn agent_id_for(unit_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{unit_id}-{}", &suffix[..8])
}
