use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use waypoint::config::{Config, HOME_ENV, find_project_dir};
use waypoint::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(
    version,
    about = "Resumable multi-phase execution: state, scheduling, checkpoints and gates"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Print structured JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Log format on stderr: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Project directory (defaults to the nearest ancestor holding .waypoint)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Root directory for waypoint data (defaults to <project>/.waypoint)
    #[arg(long, global = true, env = HOME_ENV)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and update the execution record
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Create, list and restore snapshots
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Run quality checks
    Gate {
        #[command(subcommand)]
        command: GateCommands,
    },
    /// Track dispatched workers
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Drive a session from planning to completion, resuming if one is active
    Run {
        /// The request being executed
        request: String,
        /// JSON plan: an array of story units or {"units": [...]}
        #[arg(long)]
        plan: PathBuf,
        /// Shell command run once per unit; the assignment arrives on stdin
        #[arg(long)]
        worker_cmd: String,
        /// Maximum concurrent workers (overrides waypoint.toml)
        #[arg(long, env = "WAYPOINT_MAX_AGENTS")]
        max_agents: Option<usize>,
        /// Per-worker timeout in seconds (overrides waypoint.toml)
        #[arg(long)]
        worker_timeout: Option<u64>,
    },
    /// View and validate waypoint.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum StateCommands {
    /// Start a new session
    Init {
        request: String,
        /// Archive an active session instead of refusing
        #[arg(long)]
        force: bool,
    },
    /// Print the execution record
    Get,
    /// Apply a JSON transform (inline, '-' for stdin, or @file)
    Apply {
        transform: String,
        /// Fail unless the record is still at this version
        #[arg(long)]
        expect_version: Option<u64>,
    },
    /// Print whether a session is active; exits 1 when not
    Active,
    /// Report where an interrupted session would resume
    Recovery,
}

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// Snapshot the current record
    Create { name: Option<String> },
    /// List checkpoints, newest first
    List,
    /// Replace the record with a snapshot (a pre-restore snapshot is taken first)
    Restore { identifier: String },
    /// Delete a checkpoint
    Delete { identifier: String },
    /// Keep the newest N checkpoints (default: checkpoints.keepLast)
    Cleanup { keep: Option<usize> },
    /// Print the newest checkpoint
    Latest,
    /// Show what changed since a checkpoint
    Diff { identifier: String },
    /// List every checkpoint an identifier could refer to
    Resolve { identifier: String },
    /// Write a timestamped backup of the record
    Backup,
}

#[derive(Subcommand)]
pub enum GateCommands {
    /// Run a single check
    Check {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run every check of a gate phase
    RunPhase {
        phase: String,
        /// Run all checks even after a failure
        #[arg(long)]
        no_fail_fast: bool,
    },
    /// Show the latest recorded gate reports
    Status,
    /// List gate phases and checks
    List,
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Record a dispatched worker
    Register {
        agent_id: String,
        unit_id: String,
        #[arg(default_value = "general")]
        kind: String,
    },
    /// Cache a worker result (JSON, '-' for stdin, or @file) and finish it
    CacheResult {
        agent_id: String,
        result: String,
        #[arg(default_value = "completed")]
        status: String,
    },
    /// Show one worker and its cached result
    Show { agent_id: String },
    /// List workers
    List,
    /// Pool statistics
    Stats,
    /// Dependency-respecting batches for units (JSON) or the current plan
    SuggestBatch { units: Option<String> },
    /// Mark workers running past the timeout as timed out
    Sweep {
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a starter waypoint.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            find_project_dir(&cwd).unwrap_or(cwd)
        }
    };
    let config = Config::new(project_dir, cli.root.clone())?;
    let out = cmd::Output::new(cli.json);

    match cli.command {
        Commands::State { command } => cmd::cmd_state(&config, &out, command)?,
        Commands::Checkpoint { command } => cmd::cmd_checkpoint(&config, &out, command)?,
        Commands::Gate { command } => cmd::cmd_gate(&config, &out, command).await?,
        Commands::Agent { command } => cmd::cmd_agent(&config, &out, command)?,
        Commands::Run {
            request,
            plan,
            worker_cmd,
            max_agents,
            worker_timeout,
        } => {
            let args = cmd::run::RunArgs {
                request: &request,
                plan: &plan,
                worker_cmd: &worker_cmd,
                max_agents,
                worker_timeout_secs: worker_timeout,
            };
            cmd::cmd_run(config, &out, args).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&config, &out, command)?,
    }

    Ok(())
}
