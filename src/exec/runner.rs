use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::{ProvisionError, Result};
use crate::lock::{try_lock, LockMode};

/// Failure detail recorded when nobody is left to observe the exit.
pub(crate) const SUPERVISOR_LOST: &str = "supervisor lost before the outcome was recorded";

/// Fires once the process has exited, its outcome is recorded and its log
/// is flushed and closed.
#[derive(Debug, Clone)]
pub struct DoneSignal {
    rx: watch::Receiver<bool>,
}

impl DoneSignal {
    /// Wait for completion. Returns immediately if already done.
    pub async fn wait(&mut self) {
        // Err means the supervisor task is gone; nothing more will happen
        let _ = self.rx.wait_for(|done| *done).await;
    }

    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }
}

/// A started execution: the OS process id and its completion signal.
#[derive(Debug)]
pub struct Execution {
    pub id: u32,
    pub done: DoneSignal,
}

/// Spawns the external tool against a working directory.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: PathBuf,
    working_dir: PathBuf,
    logs_dir: PathBuf,
}

impl ProcessRunner {
    pub fn new(binary: PathBuf, working_dir: PathBuf, logs_dir: PathBuf) -> Self {
        Self {
            binary,
            working_dir,
            logs_dir,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn log_path(&self, id: u32) -> PathBuf {
        log_path(&self.logs_dir, id)
    }

    pub fn fail_path(&self, id: u32) -> PathBuf {
        fail_path(&self.logs_dir, id)
    }

    /// Start the tool without waiting for it.
    ///
    /// stdout and stderr share one pipe so the log keeps the order the
    /// child produced. Draining starts before this returns. Must be called
    /// from within a tokio runtime.
    pub fn execute<I, S>(&self, args: I, overlay: &BTreeMap<String, String>) -> Result<Execution>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();

        let (reader, writer) = io::pipe().map_err(|e| ProvisionError::io(&self.logs_dir, e))?;
        let writer_err = writer
            .try_clone()
            .map_err(|e| ProvisionError::io(&self.logs_dir, e))?;

        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .current_dir(&self.working_dir)
            .envs(overlay)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err));

        let spawned = command.spawn();
        // Closes our copies of the write end so the drain sees EOF at exit
        drop(command);

        let mut child = spawned.map_err(|source| ProvisionError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        let Some(id) = child.id() else {
            abandon(child);
            return Err(ProvisionError::Other(anyhow::anyhow!(
                "spawned process has no id"
            )));
        };

        let log_path = self.log_path(id);
        let fail_path = self.fail_path(id);
        let (log, lease) = match open_records(&log_path, &fail_path) {
            Ok(records) => records,
            Err(e) => {
                abandon(child);
                return Err(e);
            }
        };

        info!(pid = id, args = ?args, dir = %self.working_dir.display(), "started execution");

        let drain = tokio::task::spawn_blocking(move || -> io::Result<u64> {
            let mut reader = reader;
            let mut log = log;
            let copied = io::copy(&mut reader, &mut log)?;
            log.sync_all()?;
            Ok(copied)
        });

        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(async move {
            let exit = child.wait().await;
            let failure = failure_text(&exit);

            if let Err(e) = record_outcome(&fail_path, failure.as_deref()) {
                warn!(pid = id, error = %e, "failed to record execution outcome");
            }
            drop(lease);

            match drain.await {
                Ok(Ok(bytes)) => debug!(pid = id, bytes, "log drained"),
                Ok(Err(e)) => warn!(pid = id, error = %e, "failed to write execution log"),
                Err(e) => warn!(pid = id, error = %e, "log drain task failed"),
            }

            match &failure {
                None => info!(pid = id, "execution succeeded"),
                Some(detail) => info!(pid = id, detail = %detail, "execution failed"),
            }
            let _ = done_tx.send(true);
        });

        Ok(Execution {
            id,
            done: DoneSignal { rx: done_rx },
        })
    }
}

pub(crate) fn log_path(logs_dir: &Path, id: u32) -> PathBuf {
    logs_dir.join(format!("{id}.log"))
}

pub(crate) fn fail_path(logs_dir: &Path, id: u32) -> PathBuf {
    logs_dir.join(format!("{id}.fail"))
}

/// Exclusive lock on the `{pid}.fail` placeholder. Held by the supervisor
/// task until the outcome is on disk; released when the task is dropped or
/// its process dies.
#[derive(Debug)]
struct SupervisorLease {
    _file: File,
}

impl SupervisorLease {
    /// Create the empty placeholder, locked before it is visible by name.
    fn acquire(fail_path: &Path) -> io::Result<Self> {
        let staging = fail_path.with_extension("lock.tmp");
        let file = File::create(&staging)?;
        let published = match try_lock(&file, LockMode::Exclusive) {
            Ok(true) => fs::rename(&staging, fail_path),
            Ok(false) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "placeholder is locked by another supervisor",
            )),
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        Ok(Self { _file: file })
    }
}

/// True while a supervisor still holds the placeholder at `fail_path`.
#[cfg(unix)]
pub(crate) fn supervisor_attached(fail_path: &Path) -> io::Result<bool> {
    let file = File::open(fail_path)?;
    Ok(!try_lock(&file, LockMode::Shared)?)
}

// No flock: an unfinished record is assumed to have a live supervisor
#[cfg(not(unix))]
pub(crate) fn supervisor_attached(fail_path: &Path) -> io::Result<bool> {
    File::open(fail_path).map(|_| true)
}

/// Create the locked fail placeholder, then the log. A reader that sees
/// the log therefore always sees the placeholder too.
fn open_records(log_path: &Path, fail_path: &Path) -> Result<(File, SupervisorLease)> {
    if log_path.exists() {
        warn!(log = %log_path.display(), "process id reused in this directory, replacing record");
    }
    let lease = SupervisorLease::acquire(fail_path).map_err(|e| ProvisionError::io(fail_path, e))?;
    match File::create(log_path) {
        Ok(log) => Ok((log, lease)),
        Err(e) => {
            let _ = fs::remove_file(fail_path);
            Err(ProvisionError::io(log_path, e))
        }
    }
}

fn failure_text(exit: &io::Result<ExitStatus>) -> Option<String> {
    match exit {
        Ok(status) if status.success() => None,
        Ok(status) => Some(status.to_string()),
        Err(e) => Some(format!("failed to wait for process: {e}")),
    }
}

/// Remove the placeholder on success, or atomically replace it with the
/// non-empty error text on failure.
pub(crate) fn record_outcome(fail_path: &Path, failure: Option<&str>) -> io::Result<()> {
    match failure {
        None => match fs::remove_file(fail_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
        Some(detail) => {
            let detail = if detail.trim().is_empty() {
                "process exited with an error"
            } else {
                detail
            };
            let tmp = fail_path.with_extension("fail.tmp");
            fs::write(&tmp, detail)?;
            fs::rename(&tmp, fail_path)
        }
    }
}

/// Kill and reap a child we could not register.
fn abandon(mut child: Child) {
    let _ = child.start_kill();
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

/// Send SIGTERM to a process. Returns `Ok(false)` if it no longer exists.
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<bool> {
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid process id"))?;
    // SAFETY: kill has no memory-safety preconditions
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "cancellation is only supported on unix",
    ))
}
