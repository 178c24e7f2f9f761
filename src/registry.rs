//! Process-wide registry of destination files claimed by active downloads.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::DispatchError;
use crate::group::GroupId;

/// Maps destination paths to the download that owns them.
///
/// Shared through `Arc` by every engine of a run. [`claim`](Self::claim)
/// checks and registers in one `entry` call, so two downloads resolving to
/// the same path in the same tick cannot both succeed.
#[derive(Debug, Default)]
pub struct DownloadRegistry {
    claims: DashMap<PathBuf, GroupId>,
}

impl DownloadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `path` as the destination of `group`.
    ///
    /// Re-claiming a path the group already holds is a no-op; claiming a new
    /// path moves the group's claim.
    ///
    /// A move drops the old claim before taking the new one, so a group never
    /// holds two paths at once. A move rejected as a duplicate leaves the group
    /// holding nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DuplicateDownload`] if another group holds `path`.
    pub fn claim(&self, group: GroupId, path: &Path) -> Result<(), DispatchError> {
        // retain locks every shard; it must not run while an entry guard is held
        self.claims
            .retain(|claimed, owner| *owner != group || claimed == path);
        match self.claims.entry(path.to_path_buf()) {
            Entry::Occupied(entry) if *entry.get() != group => {
                Err(DispatchError::duplicate_download(path))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(group);
                debug!(%group, path = %path.display(), "destination claimed");
                Ok(())
            }
        }
    }

    /// Whether a group other than `group` is downloading to `path`.
    #[must_use]
    pub fn is_same_file_already_downloading(&self, group: GroupId, path: &Path) -> bool {
        self.claims
            .get(path)
            .is_some_and(|owner| *owner != group)
    }

    /// Drops every claim held by `group`.
    pub fn release(&self, group: GroupId) {
        self.claims.retain(|_, owner| *owner != group);
    }

    /// Number of claimed paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Whether nothing is claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
