//! File-backed storage with a piece completion bitmap.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::DispatchError;

/// The destination file of one download.
///
/// A total length of 0 means the length is unknown and the file is written
/// as a single stream without pieces.
#[derive(Debug)]
pub struct PieceStorage {
    total_length: u64,
    piece_length: u64,
    completed: Vec<bool>,
    stream_finished: bool,
    file: Option<File>,
    path: Option<PathBuf>,
}

impl PieceStorage {
    /// Creates storage for `total_length` bytes split into `piece_length` pieces.
    #[must_use]
    pub fn new(total_length: u64, piece_length: u64) -> Self {
        let piece_length = piece_length.max(1);
        let count = usize::try_from(total_length.div_ceil(piece_length)).unwrap_or(usize::MAX);
        Self {
            total_length,
            piece_length,
            completed: vec![false; count],
            stream_finished: false,
            file: None,
            path: None,
        }
    }

    /// Total length (0 = unknown).
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Piece length.
    #[must_use]
    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    /// Path of the open destination file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether a destination file is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Creates (or truncates) the destination file.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the file cannot be created.
    pub fn create(&mut self, path: &Path) -> Result<(), DispatchError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| DispatchError::io(path, source))?;
        debug!(path = %path.display(), "destination created");
        self.attach(path, file);
        Ok(())
    }

    /// Opens an existing destination file without truncating it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the file cannot be opened.
    pub fn open_existing(&mut self, path: &Path) -> Result<(), DispatchError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| DispatchError::io(path, source))?;
        debug!(path = %path.display(), "destination reopened");
        self.attach(path, file);
        Ok(())
    }

    fn attach(&mut self, path: &Path, file: File) {
        self.file = Some(file);
        self.path = Some(path.to_path_buf());
    }

    /// Writes `data` at absolute `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if no file is open or the write fails.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DispatchError> {
        let path = self.path.clone().unwrap_or_default();
        let file = self.file.as_mut().ok_or_else(|| {
            DispatchError::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::NotConnected, "destination not open"),
            )
        })?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|source| DispatchError::io(&path, source))
    }

    /// Flushes written data to disk.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the flush fails.
    pub fn flush(&mut self) -> Result<(), DispatchError> {
        if let (Some(file), Some(path)) = (self.file.as_mut(), self.path.as_ref()) {
            file.sync_data()
                .map_err(|source| DispatchError::io(path, source))?;
        }
        Ok(())
    }

    /// Marks piece `index` complete.
    pub fn mark_piece_complete(&mut self, index: usize) {
        if let Some(done) = self.completed.get_mut(index) {
            *done = true;
        }
    }

    /// Whether piece `index` is complete.
    #[must_use]
    pub fn is_piece_complete(&self, index: usize) -> bool {
        self.completed.get(index).copied().unwrap_or(false)
    }

    /// Marks every piece complete, or the stream finished for unknown lengths.
    pub fn mark_all_complete(&mut self) {
        self.completed.iter_mut().for_each(|done| *done = true);
        self.stream_finished = true;
    }

    /// Marks an unknown-length stream as fully received.
    pub fn mark_stream_finished(&mut self) {
        self.stream_finished = true;
    }

    /// Bytes covered by completed pieces.
    #[must_use]
    pub fn completed_length(&self) -> u64 {
        self.completed
            .iter()
            .enumerate()
            .filter(|&(_, &done)| done)
            .map(|(index, _)| {
                let offset = index as u64 * self.piece_length;
                self.piece_length.min(self.total_length - offset)
            })
            .sum()
    }

    /// Whether the download is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        if self.total_length == 0 {
            self.stream_finished
        } else {
            self.completed.iter().all(|&done| done)
        }
    }
}
