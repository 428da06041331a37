//! Snapshot commands: `waypoint checkpoint`.

use anyhow::Result;
use serde::Serialize;

use super::super::CheckpointCommands;
use super::Output;
use waypoint::checkpoint::CheckpointSummary;
use waypoint::config::Config;

#[derive(Serialize)]
struct Deleted {
    deleted: Vec<String>,
}

#[derive(Serialize)]
struct Resolved {
    identifier: String,
    matches: Vec<String>,
}

pub fn cmd_checkpoint(config: &Config, out: &Output, command: CheckpointCommands) -> Result<()> {
    let manager = config.checkpoints();

    match command {
        CheckpointCommands::Create { name } => {
            let summary = manager.create(name.as_deref().unwrap_or("manual"))?;
            out.emit(&summary, |s| {
                println!(
                    "{} {}",
                    console::style("Created checkpoint").green().bold(),
                    s.checkpoint_id
                );
            })?;
        }
        CheckpointCommands::List => {
            let all = manager.list()?;
            out.emit(&all, |all| print_summaries(all))?;
        }
        CheckpointCommands::Latest => {
            let latest = manager.latest()?;
            out.emit(&latest, |latest| match latest {
                Some(s) => println!("{}", s.checkpoint_id),
                None => println!("No checkpoints"),
            })?;
        }
        CheckpointCommands::Restore { identifier } => {
            let outcome = manager.restore(&identifier)?;
            out.emit(&outcome, |o| {
                println!(
                    "{} {} (previous state saved as {})",
                    console::style("Restored").green().bold(),
                    o.restored,
                    o.pre_restore
                );
            })?;
        }
        CheckpointCommands::Delete { identifier } => {
            let id = manager.delete(&identifier)?;
            let deleted = Deleted { deleted: vec![id] };
            out.emit(&deleted, |d| println!("Deleted {}", d.deleted[0]))?;
        }
        CheckpointCommands::Cleanup { keep } => {
            let keep = keep.unwrap_or_else(|| config.keep_last());
            let deleted = Deleted {
                deleted: manager.cleanup(keep)?,
            };
            out.emit(&deleted, |d| {
                println!("Deleted {} checkpoint(s), kept newest {keep}", d.deleted.len());
            })?;
        }
        CheckpointCommands::Diff { identifier } => {
            let diff = manager.diff(&identifier)?;
            out.emit(&diff, |d| print!("{d}"))?;
        }
        CheckpointCommands::Resolve { identifier } => {
            let matches = manager.resolve(&identifier)?;
            let resolved = Resolved {
                identifier,
                matches,
            };
            out.emit(&resolved, |r| {
                if r.matches.is_empty() {
                    println!("No checkpoint matches '{}'", r.identifier);
                }
                for id in &r.matches {
                    println!("{id}");
                }
            })?;
        }
        CheckpointCommands::Backup => {
            let path = manager.backup()?;
            out.emit(&path, |p| println!("Backup written to {}", p.display()))?;
        }
    }
    Ok(())
}

fn print_summaries(all: &[CheckpointSummary]) {
    if all.is_empty() {
        println!("No checkpoints");
        return;
    }
    println!(
        "{:<44} {:<14} {:<8} Created",
        "Checkpoint", "Phase", "Version"
    );
    for summary in all {
        println!(
            "{:<44} {:<14} {:<8} {}",
            summary.checkpoint_id,
            summary.phase.as_str(),
            summary.version,
            console::style(summary.created_at.format("%Y-%m-%d %H:%M:%S")).dim()
        );
    }
}
