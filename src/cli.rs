use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "devwarden",
    about = "Supervise a dev server, diagnose its crashes, and tell you when it is ready",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a dev server under supervision and accept commands on stdin
    Run {
        /// Command to run (defaults to `defaults.command` from config)
        command: Option<String>,

        /// Working directory for the process
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Override `defaults.max_retries`
        #[arg(long)]
        max_retries: Option<u32>,

        /// Print reports as JSON lines instead of human-readable text
        #[arg(long)]
        json: bool,

        /// Do not write a session journal under .devwarden/logs
        #[arg(long)]
        no_journal: bool,
    },

    /// Print the diagnosis excerpt that would be selected from a log file
    Select {
        /// Plain text log file, one entry per line
        file: PathBuf,
    },

    /// Show project configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
