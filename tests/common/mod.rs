//! Shared fixtures: a stand-in for the external tool.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use provisioner::{Orchestrator, OrchestratorConfig};
use tempfile::TempDir;

pub const BANNER: &str = "Terraform v1.5.7";

const FAKE_TOOL: &str = r#"#!/bin/sh
case "$1" in
  version)
    echo "Terraform v1.5.7"
    echo "on linux_amd64"
    ;;
  fail)
    echo "Error: no valid credential sources found" >&2
    exit 3
    ;;
  sleep)
    exec sleep "${2:-30}"
    ;;
  flood)
    i=0
    while [ "$i" -lt "${2:-5000}" ]; do
      echo "out $i"
      echo "err $i" >&2
      i=$((i + 1))
    done
    ;;
  env)
    echo "$2=$(printenv "$2")"
    ;;
  vars)
    cat terraform.tfvars
    ;;
  *)
    echo "unknown command: $1" >&2
    exit 64
    ;;
esac
"#;

static TOOL_DIR: OnceLock<TempDir> = OnceLock::new();
static BROKEN_TOOL_DIR: OnceLock<TempDir> = OnceLock::new();

/// Install the fake tool once per test binary. Writing an executable while
/// other tests fork can fail with ETXTBSY, so it is never rewritten.
fn install(cell: &'static OnceLock<TempDir>, mode: u32) -> &'static Path {
    cell.get_or_init(|| {
        let dir = tempfile::Builder::new()
            .prefix("provisioner-fixture-")
            .tempdir()
            .unwrap();
        let tool = dir.path().join("terraform");
        fs::write(&tool, FAKE_TOOL).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(mode)).unwrap();
        dir
    })
    .path()
}

pub fn tool_dir() -> &'static Path {
    install(&TOOL_DIR, 0o755)
}

/// A `terraform` file that exists but cannot be executed.
pub fn broken_tool_dir() -> &'static Path {
    install(&BROKEN_TOOL_DIR, 0o644)
}

pub fn config_for(install_dir: &Path, work_root: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        binary_name: "terraform".into(),
        work_root: work_root.to_path_buf(),
        install_dir: Some(install_dir.to_path_buf()),
        search_cwd: false,
        search_path: false,
        ..OrchestratorConfig::default()
    }
}

pub fn orchestrator(work_root: &Path) -> Orchestrator {
    Orchestrator::new(config_for(tool_dir(), work_root))
}

pub fn log_path(workspace_dir: &Path, id: u32) -> PathBuf {
    workspace_dir.join("logs").join(format!("{id}.log"))
}

pub fn fail_path(workspace_dir: &Path, id: u32) -> PathBuf {
    workspace_dir.join("logs").join(format!("{id}.fail"))
}
