use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Overrides `work_root` when set.
pub const WORK_ROOT_ENV: &str = "PROVISIONER_WORK_ROOT";

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Base name of the external tool (platform suffix is added on Windows)
    pub binary_name: String,
    /// Directory under which working directories are created
    pub work_root: PathBuf,
    /// Directory searched first for the binary; defaults to the server's own install dir
    pub install_dir: Option<PathBuf>,
    /// Search the current working directory second
    pub search_cwd: bool,
    /// Fall back to the executable search path
    pub search_path: bool,
    /// Body of the tool's CLI configuration file
    pub cli_config: String,
    /// File name of the tool's CLI configuration inside a working directory
    pub cli_config_file: String,
    /// Environment variable that points the tool at its CLI configuration
    pub cli_config_env: String,
    /// Conventional variables file name
    pub variables_file: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            binary_name: "terraform".into(),
            work_root: std::env::temp_dir(),
            install_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
            search_cwd: true,
            search_path: true,
            cli_config: "disable_checkpoint = true\n".into(),
            cli_config_file: ".terraformrc".into(),
            cli_config_env: "TF_CLI_CONFIG_FILE".into(),
            variables_file: "terraform.tfvars".into(),
        }
    }
}

impl OrchestratorConfig {
    /// Default config file location (`<config dir>/provisioner/config.json`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("provisioner").join("config.json"))
    }

    /// Load from an explicit file, else the default location, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let mut config = match candidate {
            Some(config_path) => Self::from_file(&config_path)?,
            None => Self::default(),
        };

        if let Ok(root) = std::env::var(WORK_ROOT_ENV) {
            if !root.trim().is_empty() {
                config.work_root = PathBuf::from(root);
            }
        }

        Ok(config)
    }

    fn from_file(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .context(format!("Failed to read {}", config_path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .context(format!("Failed to parse {}", config_path.display()))?;

        // Accept either a bare config or one nested under "orchestrator"
        let section = value.get("orchestrator").cloned().unwrap_or(value);
        serde_json::from_value(section).context("Failed to parse orchestrator config")
    }

    /// Platform-appropriate binary file name
    pub fn platform_binary_name(&self) -> String {
        if cfg!(windows) && !self.binary_name.ends_with(".exe") {
            format!("{}.exe", self.binary_name)
        } else {
            self.binary_name.clone()
        }
    }
}
