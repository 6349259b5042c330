use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{ProvisionError, Result};

/// Execution records (`{pid}.log` / `{pid}.fail`)
pub const LOGS_DIR: &str = "logs";
/// Persisted environment overlay
pub const OVERLAY_FILE: &str = ".overlay.json";

const DIR_PREFIX: &str = "provisioner-";

/// On-disk root owning all state for one provisioning attempt.
///
/// The path is the only durable handle; everything else is rebuilt from it.
#[derive(Debug, Clone)]
pub struct WorkingDirectory {
    root: PathBuf,
}

impl WorkingDirectory {
    /// Allocate a fresh, uniquely named directory under `work_root`.
    pub fn create(work_root: &Path) -> Result<Self> {
        fs::create_dir_all(work_root).map_err(|e| ProvisionError::io(work_root, e))?;

        let name = format!("{}{}", DIR_PREFIX, Uuid::new_v4().simple());
        let root = work_root.join(name);
        // create_dir (not create_dir_all) so a collision can never reuse a directory
        fs::create_dir(&root).map_err(|e| ProvisionError::io(&root, e))?;
        restrict_permissions(&root)?;

        let dir = Self { root };
        let logs = dir.logs_dir();
        if let Err(e) = fs::create_dir(&logs) {
            dir.cleanup();
            return Err(ProvisionError::io(logs, e));
        }

        info!(path = %dir.root.display(), "created working directory");
        Ok(dir)
    }

    /// Re-open an existing directory without touching its contents.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(ProvisionError::NotFound(format!(
                "working directory {} no longer exists",
                root.display()
            )));
        }

        let dir = Self { root };
        if !dir.logs_dir().is_dir() {
            return Err(ProvisionError::Validation(format!(
                "{} is not a provisioning working directory",
                dir.root.display()
            )));
        }

        debug!(path = %dir.root.display(), "opened working directory");
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn overlay_path(&self) -> PathBuf {
        self.root.join(OVERLAY_FILE)
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Remove the directory tree. Idempotent and best-effort.
    pub fn cleanup(&self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => info!(path = %self.root.display(), "removed working directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.root.display(),
                error = %e,
                "failed to remove working directory"
            ),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|e| ProvisionError::io(path, e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
