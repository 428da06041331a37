//! End-to-end execution: `waypoint run`.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::Output;
use waypoint::config::Config;
use waypoint::orchestrator::{CommandWorker, Controller, FilePlanner, RunStatus};

pub struct RunArgs<'a> {
    pub request: &'a str,
    pub plan: &'a Path,
    pub worker_cmd: &'a str,
    pub max_agents: Option<usize>,
    pub worker_timeout_secs: Option<u64>,
}

pub async fn cmd_run(config: Config, out: &Output, args: RunArgs<'_>) -> Result<()> {
    let config = config.with_max_agents(args.max_agents);
    let mut controller = Controller::new(
        config,
        Arc::new(CommandWorker::new(args.worker_cmd)),
        Arc::new(FilePlanner::new(args.plan)),
    );
    if let Some(secs) = args.worker_timeout_secs {
        controller = controller.with_worker_timeout(Duration::from_secs(secs));
    }

    let token = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling workers");
            token.cancel();
        }
    });

    let outcome = controller.run(args.request).await?;
    out.emit(&outcome, |o| {
        let verb = if o.resumed { "Resumed" } else { "Started" };
        println!("{verb} session {} ({} batch(es) run)", o.session_id, o.batches_run);
        match &o.status {
            RunStatus::Completed => {
                println!("{}", console::style("Session completed").green().bold());
            }
            RunStatus::Failed { phase, reason } => {
                println!("{} {phase}: {reason}", console::style("Failed in").red().bold());
            }
            RunStatus::Cancelled => {
                println!(
                    "{}",
                    console::style("Cancelled; run again to resume").yellow().bold()
                );
            }
        }
    })?;

    match outcome.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Failed { phase, .. } => anyhow::bail!("Run failed in phase {}", phase),
        RunStatus::Cancelled => anyhow::bail!("Run cancelled"),
    }
}
