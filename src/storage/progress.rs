//! Persisted per-piece progress next to the destination file.

use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DispatchError;

/// Suffix appended to the destination path to name its snapshot.
pub const SNAPSHOT_SUFFIX: &str = ".segfetch";

/// Serialized progress of one download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Total length of the entity.
    pub total_length: u64,
    /// Piece length the download was split with.
    pub piece_length: u64,
    /// Bytes written per piece.
    pub written: Vec<u64>,
}

/// Handle to the snapshot file of one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    path: PathBuf,
}

impl ProgressSnapshot {
    /// Snapshot handle for the destination at `destination`.
    #[must_use]
    pub fn for_destination(destination: &Path) -> Self {
        let mut name = destination.as_os_str().to_owned();
        name.push(SNAPSHOT_SUFFIX);
        Self {
            path: PathBuf::from(name),
        }
    }

    /// Snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a snapshot from an earlier run is on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Reads the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the file cannot be read and
    /// [`DispatchError::Protocol`] if it is not a valid snapshot.
    pub fn load(&self) -> Result<ProgressRecord, DispatchError> {
        let data = fs::read(&self.path).map_err(|source| DispatchError::io(&self.path, source))?;
        serde_json::from_slice(&data).map_err(|err| {
            DispatchError::protocol(
                self.path.display().to_string(),
                format!("corrupt progress snapshot: {err}"),
            )
        })
    }

    /// Writes the snapshot, replacing any earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the file cannot be written.
    pub fn save(&self, record: &ProgressRecord) -> Result<(), DispatchError> {
        let file =
            fs::File::create(&self.path).map_err(|source| DispatchError::io(&self.path, source))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record)
            .map_err(std::io::Error::other)
            .and_then(|()| writer.flush())
            .map_err(|source| DispatchError::io(&self.path, source))?;
        debug!(path = %self.path.display(), "progress snapshot saved");
        Ok(())
    }

    /// Deletes the snapshot; a missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<(), DispatchError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "progress snapshot removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DispatchError::io(&self.path, source)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_snapshot_path_appends_suffix() {
        let snapshot = ProgressSnapshot::for_destination(Path::new("/tmp/file.iso"));
        assert_eq!(snapshot.path(), Path::new("/tmp/file.iso.segfetch"));
    }

    #[test]
    fn test_save_load_remove() {
        let dir = TempDir::new().unwrap();
        let snapshot = ProgressSnapshot::for_destination(&dir.path().join("f.bin"));
        assert!(!snapshot.exists());

        let record = ProgressRecord {
            total_length: 2048,
            piece_length: 1024,
            written: vec![1024, 10],
        };
        snapshot.save(&record).unwrap();
        assert!(snapshot.exists());
        assert_eq!(snapshot.load().unwrap(), record);

        snapshot.remove().unwrap();
        assert!(!snapshot.exists());
        snapshot.remove().unwrap();
    }

    #[test]
    fn test_corrupt_snapshot_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let snapshot = ProgressSnapshot::for_destination(&dir.path().join("f.bin"));
        fs::write(snapshot.path(), b"{not json").unwrap();
        assert!(matches!(
            snapshot.load(),
            Err(DispatchError::Protocol { .. })
        ));
    }
}
