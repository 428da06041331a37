//! Quality gate pipeline.
//!
//! A gate phase is a named boundary (`post_planning`, `post_batch`,
//! `verification`, `pre_complete`) owning an ordered list of check names.
//! `run_phase` runs them in order and records one `GateResult` per executed
//! check. With fail-fast (the default) the first failure stops the phase and
//! later checks are not executed.
//!
//! A failing check is an outcome, not an error. Errors are reserved for
//! configuration mistakes: an unknown gate phase or an unknown check name,
//! both detected before anything runs.

pub mod checks;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

pub use checks::{Check, CheckContext, CommandCheck, FileExistsCheck, ScriptCheck};

use crate::errors::GateError;
use crate::state::ExecutionRecord;
use crate::waypoint_config::WaypointToml;

pub const POST_PLANNING: &str = "post_planning";
pub const POST_BATCH: &str = "post_batch";
pub const VERIFICATION: &str = "verification";
pub const PRE_COMPLETE: &str = "pre_complete";

/// Gate phases run by the controller, in lifecycle order.
pub const STANDARD_GATE_PHASES: [&str; 4] = [POST_PLANNING, POST_BATCH, VERIFICATION, PRE_COMPLETE];

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Fail,
    Skip,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStatus::Pass => write!(f, "pass"),
            GateStatus::Fail => write!(f, "fail"),
            GateStatus::Skip => write!(f, "skip"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateResult {
    pub check_name: String,
    pub status: GateStatus,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

impl GateResult {
    pub fn new(check_name: &str, status: GateStatus, message: &str) -> Self {
        Self {
            check_name: check_name.to_string(),
            status,
            message: message.to_string(),
            checked_at: Utc::now(),
        }
    }
}

/// Aggregated outcome of one gate phase run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateReport {
    pub phase: String,
    /// False when any executed check failed
    pub passed: bool,
    pub fail_fast: bool,
    pub results: Vec<GateResult>,
    pub ran_at: DateTime<Utc>,
}

impl GateReport {
    pub fn from_results(phase: &str, fail_fast: bool, results: Vec<GateResult>) -> Self {
        Self {
            phase: phase.to_string(),
            passed: results.iter().all(|r| r.status != GateStatus::Fail),
            fail_fast,
            results,
            ran_at: Utc::now(),
        }
    }

    pub fn count(&self, status: GateStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn first_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| r.status == GateStatus::Fail)
    }
}

/// An ordered list of checks for one boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct GatePhase {
    pub enabled: bool,
    pub checks: Vec<String>,
}

/// Registry of checks plus the phase -> checks map.
pub struct GatePipeline {
    project_dir: PathBuf,
    phases: BTreeMap<String, GatePhase>,
    checks: BTreeMap<String, Box<dyn Check>>,
}

impl GatePipeline {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            phases: BTreeMap::new(),
            checks: BTreeMap::new(),
        }
    }

    /// Build a pipeline from `[gates.*]` and `[checks.*]`.
    pub fn from_config(project_dir: impl Into<PathBuf>, config: &WaypointToml) -> Self {
        let mut pipeline = Self::new(project_dir);
        for (name, check) in &config.checks {
            pipeline
                .checks
                .insert(name.clone(), checks::from_config(name, check));
        }
        for (phase, gate) in &config.gates {
            pipeline.phases.insert(
                phase.clone(),
                GatePhase {
                    enabled: gate.enabled,
                    checks: gate.checks.clone(),
                },
            );
        }
        pipeline
    }

    /// Register a check, replacing any check with the same name.
    pub fn with_check(mut self, check: Box<dyn Check>) -> Self {
        self.checks.insert(check.name().to_string(), check);
        self
    }

    pub fn with_phase(mut self, phase: &str, checks: &[&str]) -> Self {
        self.phases.insert(
            phase.to_string(),
            GatePhase {
                enabled: true,
                checks: checks.iter().map(|c| c.to_string()).collect(),
            },
        );
        self
    }

    pub fn has_phase(&self, phase: &str) -> bool {
        self.phases.contains_key(phase)
    }

    /// Configured gate phases and their checks.
    pub fn list(&self) -> &BTreeMap<String, GatePhase> {
        &self.phases
    }

    pub fn check_names(&self) -> impl Iterator<Item = &str> {
        self.checks.keys().map(String::as_str)
    }

    /// Run a single check outside of any gate phase.
    pub async fn check(&self, name: &str, args: Vec<String>) -> Result<GateResult, GateError> {
        let check = self.checks.get(name).ok_or_else(|| GateError::UnknownCheck {
            name: name.to_string(),
        })?;
        let ctx = CheckContext::new(&self.project_dir).with_args(args);
        Ok(check.run(&ctx).await)
    }

    /// Run every check of `phase` in order.
    pub async fn run_phase(&self, phase: &str, fail_fast: bool) -> Result<GateReport, GateError> {
        let gate = self
            .phases
            .get(phase)
            .ok_or_else(|| GateError::UnknownGatePhase {
                phase: phase.to_string(),
            })?;

        let mut selected = Vec::with_capacity(gate.checks.len());
        for name in &gate.checks {
            let check = self
                .checks
                .get(name)
                .ok_or_else(|| GateError::UnknownCheck { name: name.clone() })?;
            selected.push(check);
        }

        if !gate.enabled {
            let results = gate
                .checks
                .iter()
                .map(|name| GateResult::new(name, GateStatus::Skip, "gate disabled"))
                .collect();
            return Ok(GateReport::from_results(phase, fail_fast, results));
        }

        let ctx = CheckContext::new(&self.project_dir).with_gate_phase(phase);
        let mut results = Vec::with_capacity(selected.len());
        for check in selected {
            let result = check.run(&ctx).await;
            let failed = result.status == GateStatus::Fail;
            if failed {
                warn!(gate = phase, check = check.name(), message = %result.message, "check failed");
            }
            results.push(result);
            if failed && fail_fast {
                break;
            }
        }

        let report = GateReport::from_results(phase, fail_fast, results);
        info!(
            gate = phase,
            passed = report.passed,
            executed = report.results.len(),
            "gate phase finished"
        );
        Ok(report)
    }
}

/// Store `report` as the latest report for its phase.
pub fn record_report(record: &mut ExecutionRecord, report: &GateReport) {
    record
        .verification
        .gates
        .insert(report.phase.clone(), report.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct FixedCheck {
        name: String,
        status: GateStatus,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Check for FixedCheck {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _ctx: &CheckContext) -> GateResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            GateResult::new(&self.name, self.status, "fixed")
        }
    }

    fn fixed(name: &str, status: GateStatus) -> (Box<dyn Check>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let check = Box::new(FixedCheck {
            name: name.to_string(),
            status,
            calls: Arc::clone(&calls),
        });
        (check, calls)
    }

    #[tokio::test]
    async fn test_fail_fast_stops_at_first_failure() {
        let (lint, _) = fixed("lint", GateStatus::Fail);
        let (tests, test_calls) = fixed("tests", GateStatus::Pass);
        let pipeline = GatePipeline::new(".")
            .with_check(lint)
            .with_check(tests)
            .with_phase(PRE_COMPLETE, &["lint", "tests"]);

        let report = pipeline.run_phase(PRE_COMPLETE, true).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].check_name, "lint");
        assert_eq!(test_calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.first_failure().unwrap().check_name, "lint");
    }

    #[tokio::test]
    async fn test_no_fail_fast_runs_everything() {
        let (lint, _) = fixed("lint", GateStatus::Fail);
        let (tests, test_calls) = fixed("tests", GateStatus::Pass);
        let (docs, _) = fixed("docs", GateStatus::Skip);
        let pipeline = GatePipeline::new(".")
            .with_check(lint)
            .with_check(tests)
            .with_check(docs)
            .with_phase(PRE_COMPLETE, &["lint", "tests", "docs"]);

        let report = pipeline.run_phase(PRE_COMPLETE, false).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.results.len(), 3);
        assert_eq!(test_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.count(GateStatus::Pass), 1);
        assert_eq!(report.count(GateStatus::Skip), 1);
    }

    #[tokio::test]
    async fn test_skips_do_not_fail_a_phase() {
        let (a, _) = fixed("a", GateStatus::Pass);
        let (b, _) = fixed("b", GateStatus::Skip);
        let pipeline = GatePipeline::new(".")
            .with_check(a)
            .with_check(b)
            .with_phase(POST_BATCH, &["a", "b"]);
        assert!(pipeline.run_phase(POST_BATCH, true).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_unknown_check_detected_before_running() {
        let (lint, calls) = fixed("lint", GateStatus::Pass);
        let pipeline = GatePipeline::new(".")
            .with_check(lint)
            .with_phase(PRE_COMPLETE, &["lint", "ghost"]);

        let err = pipeline.run_phase(PRE_COMPLETE, true).await.unwrap_err();
        assert_eq!(err, GateError::UnknownCheck { name: "ghost".into() });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let err = pipeline.check("ghost", vec![]).await.unwrap_err();
        assert_eq!(err, GateError::UnknownCheck { name: "ghost".into() });
    }

    #[tokio::test]
    async fn test_unknown_gate_phase() {
        let pipeline = GatePipeline::new(".");
        let err = pipeline.run_phase("nightly", true).await.unwrap_err();
        assert_eq!(
            err,
            GateError::UnknownGatePhase {
                phase: "nightly".into()
            }
        );
    }

    #[tokio::test]
    async fn test_from_config_and_disabled_gate() {
        let dir = tempdir().unwrap();
        let config = WaypointToml::parse(
            r#"
            [gates.pre_complete]
            checks = ["ok", "bad"]

            [gates.post_batch]
            enabled = false
            checks = ["ok"]

            [checks.ok]
            command = "true"

            [checks.bad]
            command = "false"
            "#,
        )
        .unwrap();
        let pipeline = GatePipeline::from_config(dir.path(), &config);
        assert!(pipeline.has_phase(PRE_COMPLETE));
        assert_eq!(pipeline.check_names().collect::<Vec<_>>(), vec!["bad", "ok"]);

        let report = pipeline.run_phase(PRE_COMPLETE, true).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.results[0].status, GateStatus::Pass);
        assert_eq!(report.results[1].status, GateStatus::Fail);

        let report = pipeline.run_phase(POST_BATCH, true).await.unwrap();
        assert!(report.passed);
        assert_eq!(report.results[0].status, GateStatus::Skip);
        assert_eq!(report.results[0].message, "gate disabled");

        let single = pipeline.check("ok", vec![]).await.unwrap();
        assert_eq!(single.status, GateStatus::Pass);
    }

    #[test]
    fn test_record_report_overwrites_previous_run() {
        let mut rec = ExecutionRecord::new("add login");
        let first = GateReport::from_results(
            PRE_COMPLETE,
            true,
            vec![GateResult::new("lint", GateStatus::Fail, "warnings")],
        );
        record_report(&mut rec, &first);
        let second = GateReport::from_results(
            PRE_COMPLETE,
            true,
            vec![GateResult::new("lint", GateStatus::Pass, "clean")],
        );
        record_report(&mut rec, &second);
        assert_eq!(rec.verification.gates.len(), 1);
        assert!(rec.verification.gates[PRE_COMPLETE].passed);
    }

    #[test]
    fn test_gate_status_serde() {
        let json = serde_json::to_string(&GateStatus::Skip).unwrap();
        assert_eq!(json, "\"skip\"");
        assert_eq!(GateStatus::Fail.to_string(), "fail");
    }
}
