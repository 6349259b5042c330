use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::credentials::Credentials;
use super::variables::Variables;
use super::workspace::{WorkingDirectory, LOGS_DIR, OVERLAY_FILE};
use crate::errors::{ProvisionError, Result};
use crate::lock::lock_exclusive;

/// Writes tool inputs into a working directory and owns the environment overlay.
pub struct ConfigStore {
    root: PathBuf,
    overlay_path: PathBuf,
    variables_file: String,
    /// Extra names `add_file` must not overwrite
    reserved: Vec<PathBuf>,
    /// Extra environment merged over the inherited one at spawn time
    overlay: BTreeMap<String, String>,
}

impl ConfigStore {
    /// Open the store for a directory, loading any persisted overlay.
    pub fn open(dir: &WorkingDirectory, variables_file: impl Into<String>) -> Result<Self> {
        let overlay_path = dir.overlay_path();
        let overlay = read_overlay(&overlay_path)?;

        Ok(Self {
            root: dir.path().to_path_buf(),
            overlay_path,
            variables_file: variables_file.into(),
            reserved: Vec::new(),
            overlay,
        })
    }

    /// Protect a file written by the orchestrator itself from `add_file`.
    pub fn with_reserved(mut self, name: impl Into<PathBuf>) -> Self {
        self.reserved.push(name.into());
        self
    }

    /// [`validate_file_name`] plus the names reserved on this store.
    pub fn check_file_name(&self, name: &str) -> Result<PathBuf> {
        let clean = validate_file_name(name)?;
        if self.reserved.iter().any(|reserved| clean == *reserved) {
            return Err(ProvisionError::Validation(format!(
                "file name {name:?} is reserved"
            )));
        }
        Ok(clean)
    }

    pub fn overlay(&self) -> &BTreeMap<String, String> {
        &self.overlay
    }

    pub fn variables_path(&self) -> PathBuf {
        self.root.join(&self.variables_file)
    }

    /// Write (or overwrite) a file relative to the root.
    pub fn add_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let relative = self.check_file_name(name)?;
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ProvisionError::io(parent, e))?;
        }
        fs::write(&path, content).map_err(|e| ProvisionError::io(&path, e))?;
        debug!(file = %name, bytes = content.len(), "wrote configuration file");
        Ok(path)
    }

    /// Write the canonical variables file.
    pub fn add_variables(&self, content: &str) -> Result<PathBuf> {
        let path = self.variables_path();
        fs::write(&path, content).map_err(|e| ProvisionError::io(&path, e))?;
        debug!(file = %path.display(), "wrote variables file");
        Ok(path)
    }

    /// Render typed variables, then write them.
    pub fn add_variable_set(&self, vars: &Variables) -> Result<PathBuf> {
        let rendered = vars.render()?;
        self.add_variables(&rendered)
    }

    /// Merge into the overlay with keys normalised to upper snake case.
    pub fn add_environment_variables(&mut self, vars: &BTreeMap<String, String>) -> Result<()> {
        let normalized = normalize_environment(vars)?;
        if normalized.is_empty() {
            return Ok(());
        }
        self.merge_overlay(normalized)
    }

    /// Map credentials into the overlay. `None` leaves the overlay untouched.
    pub fn add_credentials(&mut self, credentials: Option<&Credentials>) -> Result<()> {
        let Some(credentials) = credentials else {
            return Ok(());
        };
        let env = credentials.to_env()?;
        debug!(provider = credentials.provider(), "added credentials to overlay");
        self.merge_overlay(env)
    }

    /// Read-modify-write under a lock on the directory, so handles opened
    /// by other requests never drop each other's keys.
    fn merge_overlay(&mut self, entries: BTreeMap<String, String>) -> Result<()> {
        let _lock = lock_exclusive(&self.root).map_err(|e| ProvisionError::io(&self.root, e))?;

        let mut merged = read_overlay(&self.overlay_path)?;
        merged.extend(entries);

        let content = serde_json::to_vec_pretty(&merged)
            .map_err(|e| ProvisionError::Serialization(e.to_string()))?;
        let tmp = self.overlay_path.with_extension("json.tmp");
        write_private(&tmp, &content)?;
        fs::rename(&tmp, &self.overlay_path)
            .map_err(|e| ProvisionError::io(&self.overlay_path, e))?;

        self.overlay = merged;
        Ok(())
    }
}

fn read_overlay(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(ProvisionError::io(path, e)),
    };
    serde_json::from_str(&content).map_err(|e| {
        ProvisionError::Validation(format!(
            "corrupt environment overlay {}: {e}",
            path.display()
        ))
    })
}

/// Reject names that would escape the root or clobber execution records.
pub fn validate_file_name(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ProvisionError::Validation(format!(
                    "file name {name:?} escapes the working directory"
                )));
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(ProvisionError::Validation(format!(
            "file name {name:?} is empty"
        )));
    }
    if clean.starts_with(LOGS_DIR) || clean == Path::new(OVERLAY_FILE) {
        return Err(ProvisionError::Validation(format!(
            "file name {name:?} is reserved"
        )));
    }
    Ok(clean)
}

/// Upper-case keys and map `-`/`.` to `_`; last write wins on collision.
pub fn normalize_environment(vars: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (key, value) in vars {
        out.insert(normalize_key(key)?, value.clone());
    }
    Ok(out)
}

fn normalize_key(key: &str) -> Result<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() || trimmed.contains(['=', '\0']) {
        return Err(ProvisionError::Validation(format!(
            "invalid environment variable name {key:?}"
        )));
    }
    Ok(trimmed
        .chars()
        .map(|c| match c {
            '-' | '.' | ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect())
}

fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| ProvisionError::io(path, e))?;
    file.write_all(content).map_err(|e| ProvisionError::io(path, e))?;
    file.sync_all().map_err(|e| ProvisionError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, WorkingDirectory, ConfigStore) {
        let temp_dir = TempDir::new().unwrap();
        let dir = WorkingDirectory::create(temp_dir.path()).unwrap();
        let store = ConfigStore::open(&dir, "terraform.tfvars").unwrap();
        (temp_dir, dir, store)
    }

    // ========================================
    // Files
    // ========================================

    #[test]
    fn test_add_file_creates_parents_and_overwrites() {
        let (_tmp, dir, store) = store();

        store.add_file("modules/net/main.tf", b"first").unwrap();
        store.add_file("modules/net/main.tf", b"second").unwrap();

        let content = fs::read_to_string(dir.path().join("modules/net/main.tf")).unwrap();
        assert_eq!(content, "second");
    }

    #[test]
    fn test_add_file_rejects_traversal() {
        let (_tmp, _dir, store) = store();

        for bad in ["../escape", "a/../../b", "/etc/passwd", "", "."] {
            assert!(
                matches!(store.add_file(bad, b"x"), Err(ProvisionError::Validation(_))),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_add_file_rejects_reserved_names() {
        let (_tmp, _dir, store) = store();
        assert!(store.add_file("logs/1.fail", b"").is_err());
        assert!(store.add_file(".overlay.json", b"{}").is_err());
    }

    #[test]
    fn test_add_file_rejects_store_reserved_names() {
        let (_tmp, dir, store) = store();
        fs::write(dir.path().join(".terraformrc"), "disable_checkpoint = true\n").unwrap();
        let store = store.with_reserved(".terraformrc");

        for name in [".terraformrc", "./.terraformrc"] {
            assert!(matches!(
                store.add_file(name, b"plugin_cache_dir = \"/tmp\""),
                Err(ProvisionError::Validation(_))
            ));
        }
        let rc = fs::read_to_string(dir.path().join(".terraformrc")).unwrap();
        assert_eq!(rc, "disable_checkpoint = true\n");
        // Only the exact name is reserved
        assert!(store.add_file("nested/.terraformrc", b"").is_ok());
    }

    #[test]
    fn test_add_variables_writes_canonical_file() {
        let (_tmp, dir, store) = store();
        let mut vars = Variables::new();
        vars.insert("count", 3);

        store.add_variable_set(&vars).unwrap();

        let content = fs::read_to_string(dir.path().join("terraform.tfvars")).unwrap();
        assert_eq!(content, "count = 3\n");
    }

    // ========================================
    // Overlay
    // ========================================

    #[test]
    fn test_environment_keys_are_normalized() {
        let (_tmp, _dir, mut store) = store();
        let mut vars = BTreeMap::new();
        vars.insert("tf-log".to_string(), "DEBUG".to_string());
        vars.insert("http.proxy".to_string(), "http://proxy".to_string());

        store.add_environment_variables(&vars).unwrap();

        assert_eq!(store.overlay()["TF_LOG"], "DEBUG");
        assert_eq!(store.overlay()["HTTP_PROXY"], "http://proxy");
    }

    #[test]
    fn test_environment_last_write_wins() {
        let (_tmp, _dir, mut store) = store();
        let first = BTreeMap::from([("region".to_string(), "a".to_string())]);
        let second = BTreeMap::from([("REGION".to_string(), "b".to_string())]);

        store.add_environment_variables(&first).unwrap();
        store.add_environment_variables(&second).unwrap();

        assert_eq!(store.overlay()["REGION"], "b");
    }

    #[test]
    fn test_environment_rejects_bad_keys() {
        let (_tmp, _dir, mut store) = store();
        let vars = BTreeMap::from([("A=B".to_string(), "x".to_string())]);
        assert!(store.add_environment_variables(&vars).is_err());
    }

    #[test]
    fn test_overlay_persists_across_open() {
        let (_tmp, dir, mut store) = store();
        let creds = Credentials::Aws {
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            session_token: None,
            region: None,
        };
        store.add_credentials(Some(&creds)).unwrap();

        let reopened = ConfigStore::open(&dir, "terraform.tfvars").unwrap();
        assert_eq!(reopened.overlay()["AWS_ACCESS_KEY_ID"], "AKIA");
    }

    #[test]
    fn test_overlay_merges_writes_from_other_handles() {
        let (_tmp, dir, mut first) = store();
        let mut second = ConfigStore::open(&dir, "terraform.tfvars").unwrap();

        first
            .add_environment_variables(&BTreeMap::from([("TF_LOG".to_string(), "INFO".to_string())]))
            .unwrap();
        // `second` was opened before that write landed
        second
            .add_environment_variables(&BTreeMap::from([("REGION".to_string(), "b".to_string())]))
            .unwrap();

        assert_eq!(second.overlay()["TF_LOG"], "INFO");
        let reopened = ConfigStore::open(&dir, "terraform.tfvars").unwrap();
        assert_eq!(reopened.overlay()["TF_LOG"], "INFO");
        assert_eq!(reopened.overlay()["REGION"], "b");
    }

    #[cfg(unix)]
    #[test]
    fn test_overlay_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let (_tmp, dir, mut store) = store();
        let vars = BTreeMap::from([("K".to_string(), "v".to_string())]);
        store.add_environment_variables(&vars).unwrap();

        let mode = fs::metadata(dir.overlay_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_absent_credentials_is_noop() {
        let (_tmp, dir, mut store) = store();
        store.add_credentials(None).unwrap();
        assert!(store.overlay().is_empty());
        assert!(!dir.overlay_path().exists());
    }

    #[test]
    fn test_malformed_credentials_write_nothing() {
        let (_tmp, dir, mut store) = store();
        let creds = Credentials::Aws {
            access_key_id: String::new(),
            secret_access_key: "secret".into(),
            session_token: None,
            region: None,
        };

        assert!(matches!(
            store.add_credentials(Some(&creds)),
            Err(ProvisionError::Validation(_))
        ));
        assert!(store.overlay().is_empty());
        assert!(!dir.overlay_path().exists());
    }
}
