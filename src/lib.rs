pub mod archive;
pub mod cli;
pub mod config;
pub mod errors;
pub mod exec;
mod lock;
pub mod logging;
pub mod orchestrator;
pub mod workdir;

use std::collections::BTreeMap;
use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::debug;

pub use crate::config::OrchestratorConfig;
pub use crate::errors::ProvisionError;
pub use crate::exec::{DoneSignal, Execution, ExecutionStatus, ExecutionTracker, OutputReader};
pub use crate::orchestrator::{
    Configuration, Orchestrator, SessionToken, TrackerFactory, Workspace,
};
pub use crate::workdir::{Credentials, Variable, Variables};

use crate::cli::{CliArgs, Command, ConfigureArgs};
use crate::workdir::WorkingDirectory;

/// Entry point used by `main.rs`. Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let config = OrchestratorConfig::load(args.config.as_deref())?;
    debug!(?config, "loaded orchestrator config");
    let orchestrator = Orchestrator::new(config);

    match args.command {
        Command::New => {
            let workspace = orchestrator.create()?;
            print_json(&workspace.session(None))?;
        }
        Command::Configure(configure) => {
            let mut workspace = orchestrator.resume(&configure.target.dir)?;
            let configuration = load_configuration(&configure)?;
            workspace.configure(&configuration)?;
        }
        Command::Execute { target, args } => {
            let workspace = orchestrator.resume(&target.dir)?;
            let mut execution = workspace.execute(&args)?;
            // The supervisor task lives in this process, so stay until it is done
            execution.done.wait().await;

            let status = workspace.status(execution.id);
            print_json(&serde_json::json!({
                "id": execution.id,
                "status": status,
                "session": workspace.session(Some(execution.id)),
            }))?;
            if matches!(status, ExecutionStatus::Failure(_)) {
                return Ok(1);
            }
        }
        Command::Status(execution) => {
            let workspace = orchestrator.resume(&execution.target.dir)?;
            print_json(&workspace.status(execution.id))?;
        }
        Command::Output { execution, tail } => {
            let workspace = orchestrator.resume(&execution.target.dir)?;
            let mut stdout = io::stdout().lock();
            match tail {
                Some(lines) => {
                    for line in workspace.output_tail(execution.id, lines)? {
                        writeln!(stdout, "{line}")?;
                    }
                }
                None => {
                    let mut log = workspace.output(execution.id)?;
                    io::copy(&mut log, &mut stdout)?;
                }
            }
        }
        Command::Cancel(execution) => {
            let workspace = orchestrator.resume(&execution.target.dir)?;
            workspace.cancel(execution.id)?;
        }
        Command::Archive {
            target,
            out,
            exclude_internal,
        } => {
            let workspace = orchestrator.resume(&target.dir)?;
            workspace.archive_to_path(&out, exclude_internal)?;
        }
        // Cleanup needs no binary, only the directory
        Command::Cleanup(target) => match WorkingDirectory::open(&target.dir) {
            Ok(dir) => dir.cleanup(),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        },
    }

    Ok(0)
}

fn load_configuration(args: &ConfigureArgs) -> Result<Configuration> {
    let variables = match &args.vars {
        Some(path) => {
            let value = read_json(path)?;
            Some(Variables::from_json(&value)?)
        }
        None => None,
    };

    let credentials = match &args.credentials {
        Some(path) => {
            let value = read_json(path)?;
            Some(Credentials::from_json(&value)?)
        }
        None => None,
    };

    let mut files = Vec::with_capacity(args.files.len());
    for (name, source) in &args.files {
        let content = std::fs::read(source).context(format!("Failed to read {source}"))?;
        files.push((name.clone(), content));
    }

    Ok(Configuration {
        files,
        variables,
        environment: args.env.iter().cloned().collect::<BTreeMap<_, _>>(),
        credentials,
    })
}

fn read_json(path: &std::path::Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).context(format!("Failed to parse {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{rendered}");
    Ok(())
}
