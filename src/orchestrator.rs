//! Composition of the working directory, config store, runner and tracker.
//!
//! A [`Workspace`] carries no state that is not also on disk, so any server
//! instance can rebuild it from the path alone with [`Orchestrator::resume`].

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::archive::ArtifactPackager;
use crate::config::OrchestratorConfig;
use crate::errors::{ProvisionError, Result};
use crate::exec::{
    terminate, BinaryLocator, Execution, ExecutionStatus, ExecutionTracker, FsTracker,
    OutputReader, ProcessRunner,
};
use crate::workdir::{
    normalize_environment, ConfigStore, Credentials, Variables, WorkingDirectory, OVERLAY_FILE,
};

/// Builds the status backend for a working directory from its logs dir.
pub type TrackerFactory = Arc<dyn Fn(PathBuf) -> Arc<dyn ExecutionTracker> + Send + Sync>;

/// Inputs applied by [`Workspace::configure`].
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    /// Files written relative to the working directory
    pub files: Vec<(String, Vec<u8>)>,
    pub variables: Option<Variables>,
    pub environment: BTreeMap<String, String>,
    pub credentials: Option<Credentials>,
}

/// Client-held session state: everything needed to find a workspace again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub path: PathBuf,
    #[serde(default)]
    pub last_execution: Option<u32>,
    pub issued_at: DateTime<Utc>,
}

/// Factory for workspaces.
pub struct Orchestrator {
    config: OrchestratorConfig,
    locator: BinaryLocator,
    tracker_factory: TrackerFactory,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let locator = BinaryLocator::from_config(&config);
        Self {
            config,
            locator,
            tracker_factory: Arc::new(fs_tracker),
        }
    }

    /// Replace the binary discovery rules derived from the config.
    pub fn with_locator(mut self, locator: BinaryLocator) -> Self {
        self.locator = locator;
        self
    }

    /// Replace the on-disk status records with another backend.
    pub fn with_tracker<F>(mut self, factory: F) -> Self
    where
        F: Fn(PathBuf) -> Arc<dyn ExecutionTracker> + Send + Sync + 'static,
    {
        self.tracker_factory = Arc::new(factory);
        self
    }

    /// Allocate a fresh working directory. On any failure nothing is left
    /// behind and no handle is returned.
    pub fn create(&self) -> Result<Workspace> {
        let binary = self.locator.locate()?;
        let dir = WorkingDirectory::create(&self.config.work_root)?;

        match self.initialize(&dir, binary) {
            Ok(workspace) => Ok(workspace),
            Err(e) => {
                dir.cleanup();
                Err(e)
            }
        }
    }

    fn initialize(&self, dir: &WorkingDirectory, binary: PathBuf) -> Result<Workspace> {
        let cli_config = dir.path().join(&self.config.cli_config_file);
        fs::write(&cli_config, &self.config.cli_config)
            .map_err(|e| ProvisionError::io(&cli_config, e))?;
        self.assemble(dir.clone(), binary)
    }

    /// Rebuild a handle from a bare path. Existing logs and markers are
    /// left untouched.
    pub fn resume(&self, path: impl AsRef<Path>) -> Result<Workspace> {
        let dir = WorkingDirectory::open(path)?;
        let binary = self.locator.locate()?;
        let workspace = self.assemble(dir, binary)?;
        info!(path = %workspace.path().display(), "resumed working directory");
        Ok(workspace)
    }

    /// Resume from a session token, rejecting an execution id that this
    /// directory has no record of.
    pub fn resume_session(&self, token: &SessionToken) -> Result<Workspace> {
        let workspace = self.resume(&token.path)?;
        if let Some(id) = token.last_execution {
            if workspace.status(id) == ExecutionStatus::Unknown {
                return Err(ProvisionError::Validation(format!(
                    "execution {id} is not recorded in {}",
                    token.path.display()
                )));
            }
        }
        Ok(workspace)
    }

    fn assemble(&self, dir: WorkingDirectory, binary: PathBuf) -> Result<Workspace> {
        let store = ConfigStore::open(&dir, self.config.variables_file.clone())?
            .with_reserved(&self.config.cli_config_file);
        let logs_dir = dir.logs_dir();
        let runner = ProcessRunner::new(binary, dir.path().to_path_buf(), logs_dir.clone());
        let tracker = (self.tracker_factory)(logs_dir);
        let packager = ArtifactPackager::new(dir.path())
            .with_internal(&self.config.cli_config_file)
            .with_internal(OVERLAY_FILE);

        Ok(Workspace {
            cli_config_path: dir.path().join(&self.config.cli_config_file),
            cli_config_env: self.config.cli_config_env.clone(),
            dir,
            store,
            runner,
            tracker,
            packager,
        })
    }
}

fn fs_tracker(logs_dir: PathBuf) -> Arc<dyn ExecutionTracker> {
    Arc::new(FsTracker::new(logs_dir))
}

/// Handle on one working directory.
pub struct Workspace {
    dir: WorkingDirectory,
    store: ConfigStore,
    runner: ProcessRunner,
    tracker: Arc<dyn ExecutionTracker>,
    packager: ArtifactPackager,
    cli_config_path: PathBuf,
    cli_config_env: String,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("path", &self.dir.path())
            .field("binary", &self.runner.binary())
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// The durable handle, to be stored in the client session.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn binary(&self) -> &Path {
        self.runner.binary()
    }

    pub fn session(&self, last_execution: Option<u32>) -> SessionToken {
        SessionToken {
            path: self.path().to_path_buf(),
            last_execution,
            issued_at: Utc::now(),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Apply files, variables, environment and credentials. Everything is
    /// validated before the first write.
    pub fn configure(&mut self, configuration: &Configuration) -> Result<()> {
        if let Some(credentials) = &configuration.credentials {
            credentials.validate()?;
        }
        let rendered = configuration
            .variables
            .as_ref()
            .map(Variables::render)
            .transpose()?;
        normalize_environment(&configuration.environment)?;
        for (name, _) in &configuration.files {
            self.store.check_file_name(name)?;
        }

        for (name, content) in &configuration.files {
            self.store.add_file(name, content)?;
        }
        if let Some(rendered) = rendered {
            self.store.add_variables(&rendered)?;
        }
        self.store
            .add_environment_variables(&configuration.environment)?;
        self.store
            .add_credentials(configuration.credentials.as_ref())?;

        info!(
            path = %self.path().display(),
            files = configuration.files.len(),
            "configured working directory"
        );
        Ok(())
    }

    /// Start the tool. Returns as soon as the process is running.
    pub fn execute<I, S>(&self, args: I) -> Result<Execution>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut env = BTreeMap::new();
        env.insert(
            self.cli_config_env.clone(),
            self.cli_config_path.to_string_lossy().into_owned(),
        );
        // Overlay wins over the injected defaults
        env.extend(self.store.overlay().clone());
        self.runner.execute(args, &env)
    }

    pub fn status(&self, id: u32) -> ExecutionStatus {
        self.tracker.status(id)
    }

    pub fn output(&self, id: u32) -> Result<OutputReader> {
        self.tracker.output(id)
    }

    pub fn output_tail(&self, id: u32, lines: usize) -> Result<Vec<String>> {
        self.tracker.output_tail(id, lines)
    }

    /// Ask a running execution to stop. The resulting exit is reported as
    /// an ordinary failure.
    pub fn cancel(&self, id: u32) -> Result<()> {
        match self.status(id) {
            ExecutionStatus::Unknown => Err(ProvisionError::NotFound(format!(
                "execution {id} is not recorded in this working directory"
            ))),
            ExecutionStatus::Running => {
                if terminate(id).map_err(|e| ProvisionError::io(self.path(), e))? {
                    info!(pid = id, "sent termination signal");
                } else {
                    info!(pid = id, "execution already exited");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn archive<W: Write>(&self, sink: W, exclude_internal: bool) -> Result<()> {
        self.packager.archive(sink, exclude_internal)
    }

    pub fn archive_to_path(&self, dest: &Path, exclude_internal: bool) -> Result<()> {
        self.packager.archive_to_path(dest, exclude_internal)
    }

    /// Remove the working directory. Idempotent and best-effort.
    pub fn cleanup(&self) {
        if !self.dir.exists() {
            return;
        }
        if self.has_running_executions() {
            warn!(path = %self.path().display(), "removing working directory with running executions");
        }
        self.dir.cleanup();
    }

    fn has_running_executions(&self) -> bool {
        let Ok(entries) = fs::read_dir(self.dir.logs_dir()) else {
            return false;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.strip_suffix(".log")?.parse::<u32>().ok()
            })
            .any(|id| self.status(id) == ExecutionStatus::Running)
    }
}
