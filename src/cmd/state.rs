//! Execution record commands: `waypoint state`.

use anyhow::Result;
use serde::Serialize;

use super::super::StateCommands;
use super::{Output, read_arg};
use waypoint::config::Config;
use waypoint::phase::Phase;
use waypoint::recovery::RecoveryReport;
use waypoint::state::{ExecutionRecord, WorkUnit, apply_transforms, parse_transforms};

#[derive(Serialize)]
struct ActiveStatus {
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

pub fn cmd_state(config: &Config, out: &Output, command: StateCommands) -> Result<()> {
    let store = config.store();

    match command {
        StateCommands::Init { request, force } => {
            config.ensure_directories()?;
            let record = if force {
                store.reinit(&request)?
            } else {
                store.init(&request)?
            };
            out.emit(&record, |r| {
                println!(
                    "{} session {}",
                    console::style("Initialized").green().bold(),
                    r.session_id
                );
            })?;
        }
        StateCommands::Get => {
            let record = store.read()?;
            out.emit(&record, print_record)?;
        }
        StateCommands::Apply {
            transform,
            expect_version,
        } => {
            let transforms = parse_transforms(&read_arg(&transform)?)?;
            match expect_version {
                Some(version) => store.apply_expecting(version, |rec| {
                    apply_transforms(rec, &transforms)
                })?,
                None => store.apply(|rec| apply_transforms(rec, &transforms))?,
            }
            let record = store.read()?;
            out.emit(&record, |r| {
                println!(
                    "Applied {} operation(s); record at version {}",
                    transforms.len(),
                    r.version
                );
            })?;
        }
        StateCommands::Active => {
            let record = store.try_read()?;
            let status = ActiveStatus {
                active: record.as_ref().is_some_and(|r| !r.is_terminal()),
                session_id: record.map(|r| r.session_id),
            };
            out.emit(&status, |s| println!("{}", s.active))?;
            if !status.active {
                std::process::exit(1);
            }
        }
        StateCommands::Recovery => {
            let report = config.recovery().detect()?;
            out.emit(&report, print_recovery)?;
        }
    }
    Ok(())
}

fn print_record(record: &ExecutionRecord) {
    println!();
    println!("{}", console::style("Execution Record").bold().cyan());
    println!("  Session:  {}", record.session_id);
    println!("  Request:  {}", record.original_request);
    println!("  Phase:    {}", record.phase);
    println!("  Version:  {}", record.version);
    println!("  Updated:  {}", record.updated_at.to_rfc3339());
    if let Some(last) = &record.last_checkpoint {
        println!("  Last checkpoint: {last}");
    }
    println!();
    for phase in Phase::WORK_PHASES {
        println!("  {:<14} {}", phase.as_str(), record.status_of(phase));
    }
    if !record.plan.units.is_empty() {
        println!();
        println!("{}", console::style("Units").bold());
        for unit in &record.plan.units {
            print_unit(unit, 1);
        }
    }
    if !record.execution.errors.is_empty() {
        println!();
        println!("{}", console::style("Errors").red().bold());
        for err in &record.execution.errors {
            match &err.unit {
                Some(unit) => println!("  [{unit}] {}", err.message),
                None => println!("  {}", err.message),
            }
        }
    }
    println!();
}

fn print_unit(unit: &WorkUnit, depth: usize) {
    let deps = if unit.dependencies.is_empty() {
        String::new()
    } else {
        let deps: Vec<&str> = unit.dependencies.iter().map(String::as_str).collect();
        format!(" (after {})", deps.join(", "))
    };
    println!(
        "{}{:<10} {:<12} {}{}",
        "  ".repeat(depth),
        unit.id,
        unit.effective_status().as_str(),
        unit.title,
        console::style(deps).dim()
    );
    for child in &unit.children {
        print_unit(child, depth + 1);
    }
}

fn print_recovery(report: &RecoveryReport) {
    match (&report.resume, &report.inactive_reason) {
        (Some(point), _) => {
            println!(
                "Active session {}",
                report.session_id.as_deref().unwrap_or("-")
            );
            match &point.unit {
                Some(unit) => println!("Resume at: {} (unit {unit})", point.phase),
                None => println!("Resume at: {}", point.phase),
            }
            if point.ambiguous {
                let phases: Vec<&str> = point.in_progress.iter().map(|p| p.as_str()).collect();
                println!(
                    "{} several phases were in progress: {}",
                    console::style("Warning:").yellow().bold(),
                    phases.join(", ")
                );
            }
            if let Some(last) = &report.last_checkpoint {
                println!("Last checkpoint: {last}");
            }
        }
        (None, Some(reason)) => println!("No active session ({reason})"),
        (None, None) => println!("No active session"),
    }
}
