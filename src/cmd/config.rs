//! Configuration view and validation commands: `waypoint config`.

use anyhow::{Context, Result};
use serde::Serialize;

use super::super::ConfigCommands;
use super::Output;
use waypoint::config::Config;

#[derive(Serialize)]
struct Validation {
    path: String,
    exists: bool,
    warnings: Vec<String>,
}

pub fn cmd_config(config: &Config, out: &Output, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            let toml = config.toml();
            if out.is_json() {
                return out.emit(toml, |_| {});
            }
            println!();
            println!("{}", console::style("Waypoint Configuration").bold().cyan());
            println!("======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No waypoint.toml found at {}", config_path.display());
                println!("Using default configuration:");
            }
            println!();
            let rendered =
                toml::to_string_pretty(toml).context("Failed to serialize configuration")?;
            println!("{rendered}");
            println!("Effective values (with env/CLI overrides):");
            println!("  root = \"{}\"", config.root.display());
            println!("  max_agents = {}", config.max_agents());
            println!("  worker_timeout_secs = {}", config.worker_timeout().as_secs());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let validation = Validation {
                path: config_path.display().to_string(),
                exists: config_path.exists(),
                warnings: config.toml().validate(),
            };
            out.emit(&validation, |v| {
                if !v.exists {
                    println!("No waypoint.toml at {}; defaults are valid", v.path);
                } else if v.warnings.is_empty() {
                    println!("{} {}", console::style("Valid:").green().bold(), v.path);
                } else {
                    println!(
                        "{} {} warning(s) in {}",
                        console::style("Warning:").yellow().bold(),
                        v.warnings.len(),
                        v.path
                    );
                    for warning in &v.warnings {
                        println!("  - {warning}");
                    }
                }
            })?;
        }
        Some(ConfigCommands::Init) => {
            config.ensure_directories()?;
            if config.write_starter()? {
                println!("Created {}", config_path.display());
            } else {
                println!("Config file already exists: {}", config_path.display());
            }
        }
    }
    Ok(())
}
