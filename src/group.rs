//! Per-download state shared by every command of one logical download.
//!
//! A [`RequestGroup`] outlives redirects and retries. It owns the
//! [`DownloadContext`], the lazily created [`PieceStorage`] and
//! [`SegmentManager`], the progress snapshot handle and the cookie jar.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Method;
use reqwest::cookie::Jar;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DownloadOptions;
use crate::error::{DispatchError, FailureType, classify_error};
use crate::http::filename::next_free_path;
use crate::http::{DownloadRequest, DownloadResponse};
use crate::storage::{
    MAX_PIECE_COUNT, PieceStorage, ProgressRecord, ProgressSnapshot, Segment, SegmentManager,
    piece_count,
};

/// Identity of one logical download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupStatus {
    /// Added but not started.
    Waiting,
    /// Commands are working on it.
    Active,
    /// Every byte is on disk (or a HEAD request was answered).
    Complete,
    /// An attempt failed; the outer retry policy decides what happens next.
    Failed {
        /// Retry classification of the error.
        failure: FailureType,
        /// Rendered error message.
        message: String,
    },
}

/// Target file metadata, finalized from the first non-redirect response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadContext {
    total_length: u64,
    filename: Option<String>,
    content_type: Option<String>,
    initialized: bool,
}

impl DownloadContext {
    /// Stores the finalized metadata.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ContextAlreadyInitialized`] on a second call.
    pub fn initialize(
        &mut self,
        group: GroupId,
        total_length: u64,
        filename: String,
        content_type: Option<String>,
    ) -> Result<(), DispatchError> {
        if self.initialized {
            return Err(DispatchError::ContextAlreadyInitialized { group });
        }
        *self = Self {
            total_length,
            filename: Some(filename),
            content_type,
            initialized: true,
        };
        Ok(())
    }

    /// Whether [`initialize`](Self::initialize) has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Total length in bytes (0 = unknown).
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Destination filename.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Media type of the entity.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

/// One logical download and everything its commands share.
#[derive(Debug)]
pub struct RequestGroup {
    id: GroupId,
    options: Arc<DownloadOptions>,
    method: Method,
    uris: VecDeque<Url>,
    context: DownloadContext,
    file_path: Option<PathBuf>,
    snapshot: Option<ProgressSnapshot>,
    piece_storage: Option<PieceStorage>,
    segments: Option<SegmentManager>,
    cookies: Arc<Jar>,
    status: GroupStatus,
}

impl RequestGroup {
    /// Creates a GET download over candidate `uris`, tried in order.
    #[must_use]
    pub fn new(id: GroupId, uris: Vec<Url>, options: Arc<DownloadOptions>) -> Self {
        Self {
            id,
            options,
            method: Method::GET,
            uris: uris.into(),
            context: DownloadContext::default(),
            file_path: None,
            snapshot: None,
            piece_storage: None,
            segments: None,
            cookies: Arc::new(Jar::default()),
            status: GroupStatus::Waiting,
        }
    }

    /// Uses `method` (e.g. HEAD) for every request of this download.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Shares `jar` instead of a private cookie jar.
    #[must_use]
    pub fn with_cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.cookies = jar;
        self
    }

    /// Group identity.
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Options of this download.
    #[must_use]
    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Target file metadata.
    #[must_use]
    pub fn context(&self) -> &DownloadContext {
        &self.context
    }

    /// Mutable target file metadata.
    pub fn context_mut(&mut self) -> &mut DownloadContext {
        &mut self.context
    }

    /// Cookie jar fed by `Set-Cookie` headers.
    #[must_use]
    pub fn cookies(&self) -> &Arc<Jar> {
        &self.cookies
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> &GroupStatus {
        &self.status
    }

    /// Resolved destination path.
    #[must_use]
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Progress snapshot handle for the destination.
    #[must_use]
    pub fn progress_snapshot(&self) -> Option<&ProgressSnapshot> {
        self.snapshot.as_ref()
    }

    /// Candidate URIs not tried yet.
    pub fn candidate_uris(&self) -> impl Iterator<Item = &Url> {
        self.uris.iter()
    }

    /// Builds the request for the next candidate URI.
    ///
    /// Returns `Ok(None)` when no candidate is left.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidUrl`] for a candidate without host.
    pub fn next_request(&mut self) -> Result<Option<DownloadRequest>, DispatchError> {
        let Some(url) = self.uris.pop_front() else {
            return Ok(None);
        };
        let request = DownloadRequest::from_url(url, self.method.clone())?
            .with_persistent_connection(self.options.persistent_connections)
            .with_pipelining(self.options.enable_pipelining);
        Ok(Some(request))
    }

    /// Marks the download active.
    pub fn mark_active(&mut self) {
        self.status = GroupStatus::Active;
    }

    /// Marks the download complete.
    pub fn mark_complete(&mut self) {
        info!(group = %self.id, path = ?self.file_path, "download complete");
        self.status = GroupStatus::Complete;
    }

    /// Records a fatal error for the outer retry policy.
    pub fn mark_failed(&mut self, error: &DispatchError) {
        self.status = GroupStatus::Failed {
            failure: classify_error(error),
            message: error.to_string(),
        };
    }

    /// Stores `Set-Cookie` headers of `response` in the jar.
    pub fn store_cookies(&self, response: &DownloadResponse) {
        for cookie in response.cookies() {
            self.cookies.add_cookie_str(cookie, response.url());
        }
    }

    /// Whether several connections to one host are permitted.
    #[must_use]
    pub fn is_single_host_multi_connection_enabled(&self) -> bool {
        self.options.single_host_multi_connection
    }

    /// Drops pending candidate URIs on `host`; returns how many were removed.
    pub fn remove_uris_for_hostname(&mut self, host: &str) -> usize {
        let before = self.uris.len();
        self.uris.retain(|uri| uri.host_str() != Some(host));
        let removed = before - self.uris.len();
        if removed > 0 {
            debug!(group = %self.id, host, removed, "dropped candidate URIs on same host");
        }
        removed
    }

    /// Resolves the destination path from the context filename.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the download directory cannot be created.
    pub fn pre_download_processing(&mut self) -> Result<(), DispatchError> {
        let filename = self.context.filename().unwrap_or("index.html");
        let dir = &self.options.dir;
        fs::create_dir_all(dir).map_err(|source| DispatchError::io(dir, source))?;
        let path = dir.join(filename);
        debug!(group = %self.id, path = %path.display(), "destination resolved");
        self.set_file_path(path);
        Ok(())
    }

    fn set_file_path(&mut self, path: PathBuf) {
        self.snapshot = Some(ProgressSnapshot::for_destination(&path));
        self.file_path = Some(path);
    }

    fn require_path(&self) -> Result<PathBuf, DispatchError> {
        self.file_path.clone().ok_or_else(|| {
            DispatchError::io(
                PathBuf::new(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "destination not resolved"),
            )
        })
    }

    /// Creates piece storage (and segments for known lengths) from the context.
    ///
    /// Existing storage is kept.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::TooManyPieces`] if the total length would need
    /// more than [`MAX_PIECE_COUNT`] pieces.
    pub fn init_piece_storage(&mut self) -> Result<(), DispatchError> {
        if self.piece_storage.is_some() {
            return Ok(());
        }
        let total = self.context.total_length();
        let piece_length = self.options.piece_length;
        if piece_count(total, piece_length) > MAX_PIECE_COUNT {
            return Err(DispatchError::TooManyPieces {
                total_length: total,
                piece_length,
                limit: MAX_PIECE_COUNT,
            });
        }
        self.piece_storage = Some(PieceStorage::new(total, piece_length));
        self.segments = (total > 0).then(|| SegmentManager::new(total, piece_length));
        debug!(group = %self.id, total, piece_length, "piece storage created");
        Ok(())
    }

    /// Forgets the context, destination and storage of an initialization
    /// that failed part way, so the next response finalizes afresh.
    ///
    /// Bytes already on disk and their snapshot are left in place.
    pub fn reset_initialization(&mut self) {
        debug!(group = %self.id, "initialization rolled back");
        self.context = DownloadContext::default();
        self.file_path = None;
        self.snapshot = None;
        self.piece_storage = None;
        self.segments = None;
    }

    /// Whether a segmented or streamed download has begun.
    #[must_use]
    pub fn has_piece_storage(&self) -> bool {
        self.piece_storage.is_some()
    }

    /// Piece storage, once created.
    #[must_use]
    pub fn piece_storage(&self) -> Option<&PieceStorage> {
        self.piece_storage.as_ref()
    }

    /// Segment manager of a known-length download.
    #[must_use]
    pub fn segment_manager(&self) -> Option<&SegmentManager> {
        self.segments.as_ref()
    }

    /// Mutable segment manager of a known-length download.
    pub fn segment_manager_mut(&mut self) -> Option<&mut SegmentManager> {
        self.segments.as_mut()
    }

    /// Applies the overwrite policy to an existing destination.
    ///
    /// Nothing happens when the destination is absent or overwriting is
    /// allowed. Otherwise the destination is renamed to the first free
    /// `name_N.ext` when auto renaming is on.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::FileExists`] when the download must not touch
    /// the existing file.
    pub fn should_cancel_download_for_safety(&mut self) -> Result<(), DispatchError> {
        let path = self.require_path()?;
        if !path.exists() || self.options.allow_overwrite {
            return Ok(());
        }
        if !self.options.auto_file_renaming {
            return Err(DispatchError::file_exists(path));
        }
        let renamed = next_free_path(&path).ok_or_else(|| DispatchError::file_exists(&path))?;
        info!(
            group = %self.id,
            from = %path.display(),
            to = %renamed.display(),
            "destination exists, renaming"
        );
        self.set_file_path(renamed);
        Ok(())
    }

    /// Whether a same-size file already sits at the destination.
    ///
    /// When it does, every piece is marked complete.
    pub fn download_already_satisfies_target_length(&mut self) -> bool {
        let total = self.context.total_length();
        if self.options.allow_overwrite || total == 0 {
            return false;
        }
        let satisfied = self
            .file_path
            .as_deref()
            .and_then(|path| fs::metadata(path).ok())
            .is_some_and(|meta| meta.is_file() && meta.len() == total);
        if satisfied {
            if let Some(storage) = self.piece_storage.as_mut() {
                storage.mark_all_complete();
            }
            if let Some(segments) = self.segments.as_mut() {
                segments.mark_all_complete();
            }
        }
        satisfied
    }

    /// Opens the destination, resuming from `snapshot` when it is usable.
    ///
    /// Without a usable snapshot the safety check runs and the file is
    /// created (or truncated).
    ///
    /// # Errors
    ///
    /// - [`DispatchError::LengthMismatch`] if the snapshot records another length.
    /// - [`DispatchError::FileExists`] from the safety check.
    /// - [`DispatchError::Io`] / [`DispatchError::Protocol`] for unreadable state.
    pub fn load_and_open_file(&mut self, snapshot: &ProgressSnapshot) -> Result<(), DispatchError> {
        let path = self.require_path()?;
        let total = self.context.total_length();

        if snapshot.exists() {
            let record = snapshot.load()?;
            if record.total_length != total {
                return Err(DispatchError::LengthMismatch {
                    expected: record.total_length,
                    actual: total,
                });
            }
            if record.piece_length == self.options.piece_length
                && path.is_file()
                && self.restore_progress(&record)
            {
                self.storage_mut()?.open_existing(&path)?;
                info!(
                    group = %self.id,
                    path = %path.display(),
                    completed = self.completed_length(),
                    total,
                    "resuming from progress snapshot"
                );
                return Ok(());
            }
            warn!(group = %self.id, path = %path.display(), "progress snapshot unusable, starting over");
        }

        self.should_cancel_download_for_safety()?;
        let path = self.require_path()?;
        self.storage_mut()?.create(&path)
    }

    /// Opens the destination of an unknown-length stream.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the file cannot be created.
    pub fn open_stream_file(&mut self) -> Result<(), DispatchError> {
        let path = self.require_path()?;
        self.storage_mut()?.create(&path)
    }

    fn restore_progress(&mut self, record: &ProgressRecord) -> bool {
        let Some(segments) = self.segments.as_mut() else {
            return false;
        };
        if !segments.restore(&record.written) {
            return false;
        }
        let finished: Vec<usize> = (0..segments.piece_count())
            .filter(|&index| {
                let offset = index as u64 * record.piece_length;
                let length = record.piece_length.min(record.total_length - offset);
                record.written[index] >= length
            })
            .collect();
        if let Some(storage) = self.piece_storage.as_mut() {
            finished
                .into_iter()
                .for_each(|index| storage.mark_piece_complete(index));
        }
        true
    }

    fn storage_mut(&mut self) -> Result<&mut PieceStorage, DispatchError> {
        let path = self.file_path.clone().unwrap_or_default();
        self.piece_storage.as_mut().ok_or_else(|| {
            DispatchError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "piece storage not created"),
            )
        })
    }

    /// Checks a continued response's length against the recorded total.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::LengthMismatch`] when they differ.
    pub fn validate_total_length(&self, length: u64) -> Result<(), DispatchError> {
        let expected = self
            .piece_storage
            .as_ref()
            .map_or(self.context.total_length(), PieceStorage::total_length);
        if expected != length {
            return Err(DispatchError::LengthMismatch {
                expected,
                actual: length,
            });
        }
        Ok(())
    }

    /// Writes body bytes of an unknown-length stream at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the write fails.
    pub fn write_stream(&mut self, offset: u64, data: &[u8]) -> Result<(), DispatchError> {
        self.storage_mut()?.write_at(offset, data)
    }

    /// Writes `data` at the segment's write cursor and advances it.
    ///
    /// `data` must not exceed the segment's remaining length.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the write fails.
    pub fn write_segment(&mut self, segment: &mut Segment, data: &[u8]) -> Result<(), DispatchError> {
        self.storage_mut()?
            .write_at(segment.position_to_write(), data)?;
        let written = data.len() as u64;
        segment.written += written;
        if let Some(segments) = self.segments.as_mut() {
            segments.record_written(segment.index, written);
        }
        if segment.is_complete()
            && let Some(storage) = self.piece_storage.as_mut()
        {
            storage.mark_piece_complete(segment.index);
        }
        Ok(())
    }

    /// Persists segment progress to the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if the snapshot cannot be written.
    pub fn save_progress(&self) -> Result<(), DispatchError> {
        let (Some(segments), Some(snapshot)) = (self.segments.as_ref(), self.snapshot.as_ref())
        else {
            return Ok(());
        };
        snapshot.save(&ProgressRecord {
            total_length: segments.total_length(),
            piece_length: self.options.piece_length,
            written: segments.written().to_vec(),
        })
    }

    /// Bytes on disk so far.
    #[must_use]
    pub fn completed_length(&self) -> u64 {
        self.segments
            .as_ref()
            .map_or(0, SegmentManager::completed_length)
    }

    /// Whether the destination holds the whole entity.
    #[must_use]
    pub fn is_download_complete(&self) -> bool {
        self.piece_storage
            .as_ref()
            .is_some_and(PieceStorage::is_complete)
    }

    /// Flushes the file, drops the snapshot and marks the group complete.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Io`] if flushing or snapshot removal fails.
    pub fn finish_download(&mut self) -> Result<(), DispatchError> {
        if let Some(storage) = self.piece_storage.as_mut() {
            storage.mark_stream_finished();
            storage.flush()?;
        }
        if let Some(snapshot) = self.snapshot.as_ref() {
            snapshot.remove()?;
        }
        self.mark_complete();
        Ok(())
    }
}
