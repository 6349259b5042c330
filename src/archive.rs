//! Bundles a working directory into a deterministic `.tar.gz`.
//!
//! The archive is always built in a temporary file first. A sink or
//! destination only ever sees a complete archive.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::{ProvisionError, Result};

pub struct ArtifactPackager {
    root: PathBuf,
    /// Paths (relative to root) dropped when internal files are excluded
    internal: Vec<PathBuf>,
}

impl ArtifactPackager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            internal: Vec::new(),
        }
    }

    pub fn with_internal(mut self, relative: impl Into<PathBuf>) -> Self {
        self.internal.push(relative.into());
        self
    }

    /// Stream the archive into `sink`.
    pub fn archive<W: Write>(&self, mut sink: W, exclude_internal: bool) -> Result<()> {
        let staging = tempfile::tempfile().map_err(|e| ProvisionError::io(std::env::temp_dir(), e))?;
        let mut staged = self.write_archive(staging, exclude_internal)?;

        staged
            .rewind()
            .map_err(|e| ProvisionError::io(&self.root, e))?;
        io::copy(&mut staged, &mut sink).map_err(|e| ProvisionError::io(&self.root, e))?;
        sink.flush().map_err(|e| ProvisionError::io(&self.root, e))
    }

    /// Write the archive to `dest`, replacing it only once complete.
    pub fn archive_to_path(&self, dest: &Path, exclude_internal: bool) -> Result<()> {
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        // The `.tmp` suffix keeps the staging file out of its own archive
        // when `dest` lies inside the tree
        let staging = tempfile::Builder::new()
            .prefix(".archive-")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| ProvisionError::io(&parent, e))?;
        let (file, temp_path) = staging.into_parts();

        let file = self.write_archive(file, exclude_internal)?;
        file.sync_all().map_err(|e| ProvisionError::io(dest, e))?;
        temp_path
            .persist(dest)
            .map_err(|e| ProvisionError::io(dest, e.error))?;

        info!(archive = %dest.display(), "wrote working directory archive");
        Ok(())
    }

    fn write_archive(&self, out: File, exclude_internal: bool) -> Result<File> {
        let encoder = GzEncoder::new(out, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let rel = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
                !is_transient(rel) && !(exclude_internal && self.is_internal(rel))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                ProvisionError::io(path, e.into())
            })?;
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(&self.root) else {
                continue;
            };
            let name = archive_name(rel);

            let file_type = entry.file_type();
            if file_type.is_dir() {
                let mut header = base_header(tar::EntryType::Directory, 0o755, 0);
                builder
                    .append_data(&mut header, &name, io::empty())
                    .map_err(|e| ProvisionError::io(path, e))?;
            } else if file_type.is_file() {
                let file = match File::open(path) {
                    Ok(f) => f,
                    // Records can be replaced while we walk
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(ProvisionError::io(path, e)),
                };
                let metadata = file.metadata().map_err(|e| ProvisionError::io(path, e))?;
                let size = metadata.len();
                let mut header = base_header(tar::EntryType::Regular, file_mode(&metadata), size);
                // Logs may still be growing; take exactly what the header promises
                builder
                    .append_data(&mut header, &name, file.take(size))
                    .map_err(|e| ProvisionError::io(path, e))?;
            } else {
                debug!(path = %path.display(), "skipping non-regular file");
            }
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| ProvisionError::io(&self.root, e))?;
        encoder
            .finish()
            .map_err(|e| ProvisionError::io(&self.root, e))
    }

    fn is_internal(&self, rel: &Path) -> bool {
        self.internal.iter().any(|internal| rel.starts_with(internal))
    }
}

/// Half-written files: record and overlay staging, archive staging.
fn is_transient(rel: &Path) -> bool {
    rel.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(".tmp"))
}

fn archive_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn base_header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::write(root.join("terraform.tfvars"), "count = 3\n").unwrap();
        fs::write(root.join(".terraformrc"), "disable_checkpoint = true\n").unwrap();
        fs::write(root.join(".overlay.json"), "{}").unwrap();
        fs::write(root.join("logs/100.log"), "hello\n").unwrap();
        temp_dir
    }

    fn packager(root: &Path) -> ArtifactPackager {
        ArtifactPackager::new(root)
            .with_internal(".terraformrc")
            .with_internal(".overlay.json")
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_archive_contains_tree_sorted() {
        let tree = sample_tree();
        let mut out = Vec::new();
        packager(tree.path()).archive(&mut out, false).unwrap();

        let names = entry_names(&out);
        assert_eq!(
            names,
            vec![
                ".overlay.json",
                ".terraformrc",
                "logs",
                "logs/100.log",
                "terraform.tfvars"
            ]
        );
    }

    #[test]
    fn test_archive_excludes_internal() {
        let tree = sample_tree();
        let mut out = Vec::new();
        packager(tree.path()).archive(&mut out, true).unwrap();

        let names = entry_names(&out);
        assert!(!names.iter().any(|n| n == ".terraformrc" || n == ".overlay.json"));
        assert!(names.iter().any(|n| n == "terraform.tfvars"));
    }

    #[test]
    fn test_archive_is_deterministic() {
        let tree = sample_tree();
        let packager = packager(tree.path());

        let mut first = Vec::new();
        let mut second = Vec::new();
        packager.archive(&mut first, true).unwrap();
        packager.archive(&mut second, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_archive_preserves_content() {
        let tree = sample_tree();
        let mut out = Vec::new();
        packager(tree.path()).archive(&mut out, true).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(out.as_slice()));
        let mut found = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().ends_with("100.log") {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                found = Some(content);
            }
        }
        assert_eq!(found.as_deref(), Some("hello\n"));
    }

    #[test]
    fn test_archive_to_path() {
        let tree = sample_tree();
        let out_dir = TempDir::new().unwrap();
        let dest = out_dir.path().join("cluster.tar.gz");

        packager(tree.path()).archive_to_path(&dest, true).unwrap();

        let bytes = fs::read(&dest).unwrap();
        assert!(entry_names(&bytes).contains(&"terraform.tfvars".to_string()));
        // only the finished archive is left behind
        assert_eq!(fs::read_dir(out_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_archive_to_path_inside_tree_skips_staging() {
        let tree = sample_tree();
        fs::write(tree.path().join("logs/100.fail.tmp"), "half").unwrap();
        let dest = tree.path().join("bundle.tar.gz");

        packager(tree.path()).archive_to_path(&dest, false).unwrap();

        let names = entry_names(&fs::read(&dest).unwrap());
        assert_eq!(
            names,
            vec![
                ".overlay.json",
                ".terraformrc",
                "logs",
                "logs/100.log",
                "terraform.tfvars"
            ]
        );
    }

    #[test]
    fn test_missing_root_leaves_no_destination() {
        let out_dir = TempDir::new().unwrap();
        let dest = out_dir.path().join("cluster.tar.gz");

        let result = ArtifactPackager::new(out_dir.path().join("gone")).archive_to_path(&dest, false);
        assert!(result.is_err());
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(out_dir.path()).unwrap().count(), 0);
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sink_failure_is_reported() {
        let tree = sample_tree();
        assert!(matches!(
            packager(tree.path()).archive(BrokenSink, false),
            Err(ProvisionError::Io { .. })
        ));
    }
}
