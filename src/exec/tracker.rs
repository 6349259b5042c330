use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::runner::{fail_path, log_path, record_outcome, supervisor_attached, SUPERVISOR_LOST};
use crate::errors::{ProvisionError, Result};

/// Outcome of an execution as seen from its durable records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failure(String),
    /// No execution with this id was ever started in this directory
    Unknown,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure(_))
    }
}

/// Answers whether an OS process currently exists.
pub trait LivenessCheck: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness check backed by `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLiveness;

impl LivenessCheck for OsLiveness {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Some(pid) = libc::pid_t::try_from(pid).ok().filter(|p| *p > 0) else {
            return false;
        };
        // SAFETY: signal 0 only performs the existence and permission check
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

/// Combined output stream of one execution.
pub type OutputReader = Box<dyn Read + Send>;

/// Reports execution state using only out-of-process signals.
///
/// [`FsTracker`] reads the records the runner leaves on disk; any other
/// store can stand in through [`crate::Orchestrator::with_tracker`].
pub trait ExecutionTracker: Send + Sync {
    fn status(&self, id: u32) -> ExecutionStatus;

    /// Combined stdout/stderr of the execution.
    fn output(&self, id: u32) -> Result<OutputReader>;

    /// Last `lines` lines of the output.
    fn output_tail(&self, id: u32, lines: usize) -> Result<Vec<String>> {
        let reader = BufReader::new(self.output(id)?);
        let mut tail = VecDeque::with_capacity(lines.min(1024));
        for line in reader.split(b'\n') {
            let line = line.map_err(|e| ProvisionError::io(format!("output of execution {id}"), e))?;
            if tail.len() == lines {
                tail.pop_front();
            }
            if lines > 0 {
                tail.push_back(String::from_utf8_lossy(&line).into_owned());
            }
        }
        Ok(tail.into())
    }
}

/// Tracker over a directory of `{id}.log` / `{id}.fail` records.
pub struct FsTracker<P = OsLiveness> {
    logs_dir: PathBuf,
    liveness: P,
}

impl FsTracker<OsLiveness> {
    pub fn new(logs_dir: PathBuf) -> Self {
        Self::with_liveness(logs_dir, OsLiveness)
    }
}

impl<P: LivenessCheck> FsTracker<P> {
    pub fn with_liveness(logs_dir: PathBuf, liveness: P) -> Self {
        Self { logs_dir, liveness }
    }

    /// The process is gone but the placeholder is still empty. Either the
    /// supervisor is about to record the outcome, or it never will.
    fn resolve_unfinished(&self, id: u32) -> ExecutionStatus {
        let fail = fail_path(&self.logs_dir, id);
        match supervisor_attached(&fail) {
            Ok(true) => return ExecutionStatus::Running,
            Ok(false) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return ExecutionStatus::Success,
            Err(e) => return ExecutionStatus::Failure(format!("unreadable failure record: {e}")),
        }

        // The supervisor writes before it unlocks, so this read is final
        match fs::read_to_string(&fail) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => ExecutionStatus::Success,
            Ok(detail) if !detail.trim().is_empty() => {
                ExecutionStatus::Failure(detail.trim_end().to_string())
            }
            Ok(_) => {
                warn!(pid = id, "{SUPERVISOR_LOST}");
                if let Err(e) = record_outcome(&fail, Some(SUPERVISOR_LOST)) {
                    warn!(pid = id, error = %e, "failed to record lost execution");
                }
                ExecutionStatus::Failure(SUPERVISOR_LOST.to_string())
            }
            Err(e) => ExecutionStatus::Failure(format!("unreadable failure record: {e}")),
        }
    }
}

impl<P: LivenessCheck> ExecutionTracker for FsTracker<P> {
    fn status(&self, id: u32) -> ExecutionStatus {
        if !log_path(&self.logs_dir, id).exists() {
            return ExecutionStatus::Unknown;
        }
        if self.liveness.is_alive(id) {
            return ExecutionStatus::Running;
        }
        match fs::read_to_string(fail_path(&self.logs_dir, id)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => ExecutionStatus::Success,
            Ok(detail) if detail.trim().is_empty() => self.resolve_unfinished(id),
            Ok(detail) => ExecutionStatus::Failure(detail.trim_end().to_string()),
            Err(e) => ExecutionStatus::Failure(format!("unreadable failure record: {e}")),
        }
    }

    fn output(&self, id: u32) -> Result<OutputReader> {
        let path = log_path(&self.logs_dir, id);
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ProvisionError::NotFound(format!("no output recorded for execution {id}"))
            }
            _ => ProvisionError::io(&path, e),
        })?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedLiveness(bool);

    impl LivenessCheck for FixedLiveness {
        fn is_alive(&self, _pid: u32) -> bool {
            self.0
        }
    }

    fn tracker(alive: bool) -> (TempDir, FsTracker<FixedLiveness>) {
        let temp_dir = TempDir::new().unwrap();
        let tracker = FsTracker::with_liveness(temp_dir.path().to_path_buf(), FixedLiveness(alive));
        (temp_dir, tracker)
    }

    #[test]
    fn test_unknown_without_log() {
        let (_tmp, tracker) = tracker(false);
        assert_eq!(tracker.status(4242), ExecutionStatus::Unknown);
    }

    #[test]
    fn test_running_while_alive() {
        let (tmp, tracker) = tracker(true);
        fs::write(tmp.path().join("10.log"), "").unwrap();
        fs::write(tmp.path().join("10.fail"), "").unwrap();
        assert_eq!(tracker.status(10), ExecutionStatus::Running);
    }

    #[cfg(unix)]
    #[test]
    fn test_locked_placeholder_after_exit_is_still_running() {
        let (tmp, tracker) = tracker(false);
        fs::write(tmp.path().join("10.log"), "").unwrap();
        fs::write(tmp.path().join("10.fail"), "").unwrap();

        let supervisor = File::open(tmp.path().join("10.fail")).unwrap();
        assert!(crate::lock::try_lock(&supervisor, crate::lock::LockMode::Exclusive).unwrap());
        assert_eq!(tracker.status(10), ExecutionStatus::Running);

        // Outcome recorded while the lock is held, then released
        fs::remove_file(tmp.path().join("10.fail")).unwrap();
        drop(supervisor);
        assert_eq!(tracker.status(10), ExecutionStatus::Success);
    }

    #[cfg(unix)]
    #[test]
    fn test_orphaned_placeholder_resolves_to_failure() {
        let (tmp, tracker) = tracker(false);
        fs::write(tmp.path().join("15.log"), "partial").unwrap();
        fs::write(tmp.path().join("15.fail"), "").unwrap();

        assert_eq!(
            tracker.status(15),
            ExecutionStatus::Failure(SUPERVISOR_LOST.into())
        );
        // Settled on disk, no longer ambiguous
        assert_eq!(
            fs::read_to_string(tmp.path().join("15.fail")).unwrap(),
            SUPERVISOR_LOST
        );
        assert!(tracker.status(15).is_terminal());
    }

    #[test]
    fn test_success_without_marker() {
        let (tmp, tracker) = tracker(false);
        fs::write(tmp.path().join("11.log"), "done").unwrap();
        assert_eq!(tracker.status(11), ExecutionStatus::Success);
        assert!(tracker.status(11).is_terminal());
    }

    #[test]
    fn test_failure_carries_detail() {
        let (tmp, tracker) = tracker(false);
        fs::write(tmp.path().join("12.log"), "").unwrap();
        fs::write(tmp.path().join("12.fail"), "exit status: 1\n").unwrap();
        assert_eq!(
            tracker.status(12),
            ExecutionStatus::Failure("exit status: 1".into())
        );
    }

    #[test]
    fn test_output_missing_is_not_found() {
        let (_tmp, tracker) = tracker(false);
        assert!(tracker.output(99).err().unwrap().is_not_found());
    }

    #[test]
    fn test_output_reads_log() {
        let (tmp, tracker) = tracker(false);
        fs::write(tmp.path().join("13.log"), "a\nb\n").unwrap();

        let mut content = String::new();
        tracker.output(13).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "a\nb\n");
    }

    #[test]
    fn test_output_tail() {
        let (tmp, tracker) = tracker(false);
        fs::write(tmp.path().join("14.log"), "1\n2\n3\n4\n5\n").unwrap();

        assert_eq!(tracker.output_tail(14, 2).unwrap(), vec!["4", "5"]);
        assert_eq!(tracker.output_tail(14, 10).unwrap().len(), 5);
        assert!(tracker.output_tail(14, 0).unwrap().is_empty());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExecutionStatus::Failure("boom".into())).unwrap();
        assert_eq!(json, r#"{"state":"failure","detail":"boom"}"#);
        let json = serde_json::to_string(&ExecutionStatus::Running).unwrap();
        assert_eq!(json, r#"{"state":"running"}"#);
    }

    #[cfg(unix)]
    #[test]
    fn test_os_liveness_sees_self() {
        assert!(OsLiveness.is_alive(std::process::id()));
        assert!(!OsLiveness.is_alive(0));
    }
}
