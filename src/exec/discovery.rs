use std::path::PathBuf;

use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::errors::{ProvisionError, Result};

/// Finds the external tool binary.
///
/// Search order, first match wins:
/// 1. the server's own install directory
/// 2. the current working directory
/// 3. the executable search path
///
/// A pinned binary shipped next to the server therefore overrides any
/// system install.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    file_name: String,
    install_dir: Option<PathBuf>,
    cwd: Option<PathBuf>,
    search_path: bool,
}

impl BinaryLocator {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            install_dir: None,
            cwd: None,
            search_path: false,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            file_name: config.platform_binary_name(),
            install_dir: config.install_dir.clone(),
            cwd: if config.search_cwd {
                std::env::current_dir().ok()
            } else {
                None
            },
            search_path: config.search_path,
        }
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_search_path(mut self, enabled: bool) -> Self {
        self.search_path = enabled;
        self
    }

    /// Locate the binary. Presence is checked, not executability: a
    /// non-executable file is found here and fails later at spawn.
    pub fn locate(&self) -> Result<PathBuf> {
        for dir in [&self.install_dir, &self.cwd].into_iter().flatten() {
            let candidate = dir.join(&self.file_name);
            if candidate.is_file() {
                debug!(binary = %candidate.display(), "found tool binary");
                return Ok(candidate);
            }
        }

        if self.search_path {
            if let Ok(found) = which::which(&self.file_name) {
                debug!(binary = %found.display(), "found tool binary on PATH");
                return Ok(found);
            }
        }

        Err(ProvisionError::NotFound(format!(
            "{} binary not found in install dir, working dir{}",
            self.file_name,
            if self.search_path { " or PATH" } else { "" }
        )))
    }
}
