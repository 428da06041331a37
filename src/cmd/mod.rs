//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module        | Commands handled                                        |
//! |---------------|---------------------------------------------------------|
//! | `state`       | `state init/get/apply/active/recovery`                  |
//! | `checkpoint`  | `checkpoint create/list/restore/delete/cleanup/...`     |
//! | `gate`        | `gate check/run-phase/status/list`                      |
//! | `agent`       | `agent register/cache-result/list/stats/suggest-batch`  |
//! | `run`         | `run`                                                   |
//! | `config`      | `config show/validate/init`                             |

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod gate;
pub mod run;
pub mod state;

pub use agent::cmd_agent;
pub use checkpoint::cmd_checkpoint;
pub use config::cmd_config;
pub use gate::cmd_gate;
pub use run::cmd_run;
pub use state::cmd_state;

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Read;

/// Chooses between `--json` and human-readable output.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Print `value` as JSON in `--json` mode, otherwise call `human`.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

/// Read an argument that may be inline text, `-` for stdin or `@path`.
pub fn read_arg(arg: &str) -> Result<String> {
    if arg == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        return Ok(buf);
    }
    if let Some(path) = arg.strip_prefix('@') {
        return std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"));
    }
    Ok(arg.to_string())
}
