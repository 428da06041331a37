//! Worker registry commands: `waypoint agent`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;

use super::super::AgentCommands;
use super::{Output, read_arg};
use waypoint::config::Config;
use waypoint::orchestrator::parse_plan;
use waypoint::registry::{CachedResult, WorkerHandle, WorkerRegistry, WorkerStatus};

#[derive(Serialize)]
struct AgentDetail {
    handle: WorkerHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<CachedResult>,
}

#[derive(Serialize)]
struct Swept {
    timed_out: Vec<String>,
}

pub fn cmd_agent(config: &Config, out: &Output, command: AgentCommands) -> Result<()> {
    let registry = config.registry();

    match command {
        AgentCommands::Register {
            agent_id,
            unit_id,
            kind,
        } => {
            config.ensure_directories()?;
            let handle = registry.register(&agent_id, &unit_id, &kind)?;
            out.emit(&handle, |h| {
                println!("Registered {} for unit {} ({})", h.agent_id, h.unit_id, h.kind);
            })?;
        }
        AgentCommands::CacheResult {
            agent_id,
            result,
            status,
        } => {
            let status: WorkerStatus = status.parse()?;
            let raw = read_arg(&result)?;
            let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
            let handle = registry.record_result(&agent_id, value, status)?;
            out.emit(&handle, |h| println!("Recorded {} as {}", h.agent_id, h.status))?;
        }
        AgentCommands::Show { agent_id } => {
            let handle = registry
                .get(&agent_id)?
                .with_context(|| format!("Agent {agent_id} is not registered"))?;
            let detail = AgentDetail {
                result: registry.cached_result(&agent_id)?,
                handle,
            };
            out.emit(&detail, |d| {
                print_handles(std::slice::from_ref(&d.handle));
                if let Some(cached) = &d.result {
                    println!();
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&cached.result).unwrap_or_default()
                    );
                }
            })?;
        }
        AgentCommands::List => {
            let handles = registry.list()?;
            out.emit(&handles, |h| print_handles(h))?;
        }
        AgentCommands::Stats => {
            let stats = registry.stats()?;
            out.emit(&stats, |s| {
                println!("Workers:   {} total, {} running", s.total, s.running);
                println!(
                    "Finished:  {} completed, {} failed, {} timed out",
                    s.completed, s.failed, s.timed_out
                );
                match s.success_rate {
                    Some(rate) => println!("Success:   {:.1}%", rate * 100.0),
                    None => println!("Success:   -"),
                }
                if let Some(mean) = s.mean_duration_secs {
                    println!("Mean time: {mean:.1}s");
                }
            })?;
        }
        AgentCommands::SuggestBatch { units } => {
            let units = match units {
                Some(arg) => parse_plan(&read_arg(&arg)?)?,
                None => config.store().read()?.plan.units,
            };
            let batches = WorkerRegistry::suggest_batches(&units)?;
            out.emit(&batches, |batches| {
                for (i, batch) in batches.iter().enumerate() {
                    println!("Batch {}: {}", i + 1, batch.join(", "));
                }
            })?;
        }
        AgentCommands::Sweep { timeout_secs } => {
            let limit = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.worker_timeout());
            let swept = Swept {
                timed_out: registry.sweep_timeouts(chrono::Utc::now(), limit)?,
            };
            out.emit(&swept, |s| {
                println!("Marked {} worker(s) as timed out", s.timed_out.len());
            })?;
        }
    }
    Ok(())
}

fn print_handles(handles: &[WorkerHandle]) {
    if handles.is_empty() {
        println!("No workers registered");
        return;
    }
    println!("{:<24} {:<12} {:<10} {:<10} Started", "Agent", "Unit", "Kind", "Status");
    for h in handles {
        let status = match h.status {
            WorkerStatus::Running => console::style(h.status.to_string()).cyan(),
            WorkerStatus::Completed => console::style(h.status.to_string()).green(),
            WorkerStatus::Failed | WorkerStatus::TimedOut => console::style(h.status.to_string()).red(),
        };
        println!(
            "{:<24} {:<12} {:<10} {:<10} {}",
            h.agent_id,
            h.unit_id,
            h.kind,
            status,
            h.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}
