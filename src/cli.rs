//! Command-line front end.
//!
//! Every command except `new` resumes its workspace from `--dir`, the same
//! way a stateless request handler would.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "provisioner",
    version,
    about = "Drive an infrastructure tool from resumable working directories.",
    long_about = None
)]
pub struct CliArgs {
    /// Orchestrator config (JSON). Defaults to the user config dir if present.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level. If omitted, `PROVISIONER_LOG` or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create a working directory and print its session token
    New,
    /// Write files, variables, environment and credentials
    Configure(ConfigureArgs),
    /// Run the tool and wait for it to finish
    Execute {
        #[command(flatten)]
        target: DirArg,
        /// Arguments passed to the tool
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Print the status of an execution
    Status(ExecutionArg),
    /// Print the output of an execution
    Output {
        #[command(flatten)]
        execution: ExecutionArg,
        /// Only print the last N lines
        #[arg(long, value_name = "N")]
        tail: Option<usize>,
    },
    /// Send a termination signal to a running execution
    Cancel(ExecutionArg),
    /// Package the working directory as .tar.gz
    Archive {
        #[command(flatten)]
        target: DirArg,
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
        /// Leave out tool CLI config and credential overlay
        #[arg(long)]
        exclude_internal: bool,
    },
    /// Remove the working directory
    Cleanup(DirArg),
}

#[derive(Debug, Clone, Args)]
pub struct DirArg {
    /// Working directory path from the session token
    #[arg(long, value_name = "PATH")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct ExecutionArg {
    #[command(flatten)]
    pub target: DirArg,
    /// Execution id (process id) returned by `execute`
    #[arg(long)]
    pub id: u32,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigureArgs {
    #[command(flatten)]
    pub target: DirArg,
    /// JSON object of variables (string, list of strings, integer)
    #[arg(long, value_name = "PATH")]
    pub vars: Option<PathBuf>,
    /// JSON credentials document
    #[arg(long, value_name = "PATH")]
    pub credentials: Option<PathBuf>,
    /// Extra environment, KEY=VALUE
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,
    /// Copy a file into the working directory, NAME=SOURCE
    #[arg(long = "file", value_name = "NAME=SOURCE", value_parser = parse_key_value)]
    pub files: Vec<(String, String)>,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
