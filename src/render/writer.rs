//! Atomic artifact writes.
//!
//! Content is staged in a temporary file next to the destination, flushed to
//! disk, given its final mode and then renamed over the destination. Readers
//! see either the old file or the new one. A staged file that is dropped
//! without being committed is deleted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::errors::{Result, RotationError};

/// Result of [`AtomicWriter::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Destination already held identical content
    Unchanged,
}

/// Content staged next to its destination, not yet visible.
#[derive(Debug)]
pub struct StagedArtifact {
    file: NamedTempFile,
    destination: PathBuf,
}

impl StagedArtifact {
    /// Rename the staged file over the destination.
    pub fn commit(self) -> Result<()> {
        let destination = self.destination;
        self.file.persist(&destination).map_err(|e| {
            RotationError::render(&destination, format!("atomic rename failed: {}", e.error))
        })?;
        sync_parent(&destination);
        Ok(())
    }

    /// Path of the temporary file.
    pub fn temp_path(&self) -> &Path {
        self.file.path()
    }
}

/// Writes artifacts via temp file + fsync + rename.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicWriter;

impl AtomicWriter {
    pub fn new() -> Self {
        Self
    }

    /// Write `content` to `destination` unless it already holds exactly that.
    pub fn write(&self, destination: &Path, content: &[u8], mode: u32) -> Result<WriteOutcome> {
        if let Some(current) = self.read_current(destination)? {
            if current == content {
                set_mode(destination, mode)?;
                return Ok(WriteOutcome::Unchanged);
            }
        }
        self.stage(destination, content, mode)?.commit()?;
        Ok(WriteOutcome::Written)
    }

    /// Stage `content` for `destination` without making it visible.
    pub fn stage(&self, destination: &Path, content: &[u8], mode: u32) -> Result<StagedArtifact> {
        let parent = parent_dir(destination);
        fs::create_dir_all(parent).map_err(|e| {
            RotationError::render(destination, format!("cannot create directory {}: {}", parent.display(), e))
        })?;

        let mut file = NamedTempFile::new_in(parent)
            .map_err(|e| RotationError::render(destination, format!("cannot create temp file: {}", e)))?;
        set_mode(file.path(), mode)?;
        file.write_all(content)
            .and_then(|_| file.as_file().sync_all())
            .map_err(|e| RotationError::render(destination, format!("cannot write temp file: {}", e)))?;

        Ok(StagedArtifact { file, destination: destination.to_path_buf() })
    }

    /// Current content of `destination`, `None` when it does not exist.
    pub fn read_current(&self, destination: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(destination) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RotationError::io(e, format!("Failed to read {}", destination.display()))),
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| RotationError::render(path, format!("cannot set mode {:o}: {}", mode, e)))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

// Best effort: make the rename itself durable.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Ok(dir) = fs::File::open(parent_dir(path)) {
        let _ = dir.sync_all();
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> =
            fs::read_dir(dir).unwrap().map(|e| e.unwrap().file_name().to_string_lossy().into_owned()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_creates_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("grafana.env");
        let writer = AtomicWriter::new();

        assert_eq!(writer.write(&dest, b"A=1\n", 0o600).unwrap(), WriteOutcome::Written);
        assert_eq!(fs::read(&dest).unwrap(), b"A=1\n");

        assert_eq!(writer.write(&dest, b"A=2\n", 0o600).unwrap(), WriteOutcome::Written);
        assert_eq!(fs::read(&dest).unwrap(), b"A=2\n");
        assert_eq!(entries(dest.parent().unwrap()), vec!["grafana.env".to_string()]);
    }

    #[test]
    fn test_identical_content_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.env");
        let writer = AtomicWriter::new();

        writer.write(&dest, b"same", 0o600).unwrap();
        assert_eq!(writer.write(&dest, b"same", 0o600).unwrap(), WriteOutcome::Unchanged);
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_is_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cert.pem");
        AtomicWriter::new().write(&dest, b"pem", 0o640).unwrap();
        assert_eq!(fs::metadata(&dest).unwrap().permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn test_uncommitted_stage_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("traefik.yml");
        let writer = AtomicWriter::new();
        writer.write(&dest, b"old", 0o600).unwrap();

        let staged = writer.stage(&dest, b"new-but-interrupted", 0o600).unwrap();
        assert!(staged.temp_path().exists());
        assert_eq!(fs::read(&dest).unwrap(), b"old");
        drop(staged);

        assert_eq!(fs::read(&dest).unwrap(), b"old");
        assert_eq!(entries(dir.path()), vec!["traefik.yml".to_string()]);
    }

    #[test]
    fn test_read_current_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AtomicWriter::new().read_current(&dir.path().join("absent")).unwrap().is_none());
    }
}
