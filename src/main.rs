use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::info;

use devwarden::cli::{Cli, Command};
use devwarden::config::ProjectConfig;
use devwarden::config::render::{render_config_human, render_config_json};
use devwarden::evidence::{entries_from_text, select_for_analysis};
use devwarden::session::{self, SessionOptions};
use devwarden::shell_completion;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet = matches!(
        &cli.command,
        Command::Config { .. } | Command::Select { .. } | Command::Completions { .. }
    );

    let filter = match cli.verbose {
        0 if quiet => "devwarden=warn",
        0 => "devwarden=info",
        1 => "devwarden=debug",
        _ => "devwarden=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;

    match cli.command {
        Command::Run {
            command,
            cwd: run_dir,
            max_retries,
            json,
            no_journal,
        } => {
            let run_dir = match run_dir {
                Some(dir) if dir.is_absolute() => dir,
                Some(dir) => cwd.join(dir),
                None => cwd.clone(),
            };
            if !run_dir.is_dir() {
                anyhow::bail!("working directory not found: {}", run_dir.display());
            }

            let (mut config, config_path) = ProjectConfig::load(&run_dir)?;
            match config_path {
                Some(ref p) => info!("loaded config from {}", p.display()),
                None => info!("no .devwarden/config.toml found, using defaults"),
            }
            if let Some(max_retries) = max_retries {
                config.defaults.max_retries = max_retries;
                config.validate()?;
            }

            let project_root = config_path
                .as_deref()
                .and_then(|p| p.parent())
                .and_then(|p| p.parent())
                .map(PathBuf::from)
                .unwrap_or_else(|| run_dir.clone());
            let journal_dir =
                (!no_journal).then(|| SessionOptions::journal_dir_for(&project_root));

            let options = SessionOptions {
                command: command.unwrap_or_else(|| config.defaults.command.clone()),
                cwd: run_dir,
                json,
                journal_dir,
            };
            session::run(&config, config.control_settings(), options).await?;
        }
        Command::Select { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let entries = entries_from_text(&text, Utc::now());
            println!("{}", select_for_analysis(&entries));
        }
        Command::Config { json } => {
            let (config, config_path) = ProjectConfig::load(&cwd)?;
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
        Command::Completions { shell } => shell_completion::print(shell)?,
    }

    Ok(())
}
