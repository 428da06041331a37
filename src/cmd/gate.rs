//! Quality gate commands: `waypoint gate`.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

use super::super::GateCommands;
use super::Output;
use waypoint::config::Config;
use waypoint::gates::{GateReport, GateResult, GateStatus, record_report};

#[derive(Serialize)]
struct GateListing {
    phases: BTreeMap<String, PhaseListing>,
    checks: Vec<String>,
}

#[derive(Serialize)]
struct PhaseListing {
    enabled: bool,
    checks: Vec<String>,
}

pub async fn cmd_gate(config: &Config, out: &Output, command: GateCommands) -> Result<()> {
    let pipeline = config.gates();

    match command {
        GateCommands::Check { name, args } => {
            let result = pipeline.check(&name, args).await?;
            out.emit(&result, print_result)?;
            if result.status == GateStatus::Fail {
                anyhow::bail!("Check '{}' failed", name);
            }
        }
        GateCommands::RunPhase {
            phase,
            no_fail_fast,
        } => {
            let report = pipeline.run_phase(&phase, !no_fail_fast).await?;
            let store = config.store();
            if store.active()? {
                store.update(|rec| record_report(rec, &report))?;
            }
            out.emit(&report, print_report)?;
            if !report.passed {
                anyhow::bail!("Gate phase '{}' failed", phase);
            }
        }
        GateCommands::Status => {
            let reports: BTreeMap<String, GateReport> = config
                .store()
                .try_read()?
                .map(|r| r.verification.gates)
                .unwrap_or_default();
            out.emit(&reports, |reports| {
                if reports.is_empty() {
                    println!("No gate results recorded");
                }
                for report in reports.values() {
                    print_report(report);
                }
            })?;
        }
        GateCommands::List => {
            let listing = GateListing {
                phases: pipeline
                    .list()
                    .iter()
                    .map(|(name, gate)| {
                        (
                            name.clone(),
                            PhaseListing {
                                enabled: gate.enabled,
                                checks: gate.checks.clone(),
                            },
                        )
                    })
                    .collect(),
                checks: pipeline.check_names().map(str::to_string).collect(),
            };
            out.emit(&listing, |l| {
                if l.phases.is_empty() {
                    println!("No gate phases configured. Add [gates.<phase>] to waypoint.toml");
                }
                for (name, phase) in &l.phases {
                    let state = if phase.enabled { "" } else { " (disabled)" };
                    println!("{name}{state}: {}", phase.checks.join(", "));
                }
            })?;
        }
    }
    Ok(())
}

fn status_label(status: GateStatus) -> console::StyledObject<String> {
    let label = status.to_string().to_uppercase();
    match status {
        GateStatus::Pass => console::style(label).green(),
        GateStatus::Fail => console::style(label).red().bold(),
        GateStatus::Skip => console::style(label).dim(),
    }
}

fn print_result(result: &GateResult) {
    println!(
        "  {:<6} {:<20} {}",
        status_label(result.status),
        result.check_name,
        result.message
    );
}

fn print_report(report: &GateReport) {
    let verdict = if report.passed {
        console::style("passed").green().bold()
    } else {
        console::style("failed").red().bold()
    };
    println!(
        "Gate {} {} ({} pass, {} fail, {} skip)",
        report.phase,
        verdict,
        report.count(GateStatus::Pass),
        report.count(GateStatus::Fail),
        report.count(GateStatus::Skip)
    );
    for result in &report.results {
        print_result(result);
    }
}
