//! Finalizing the download context from the first non-redirect response.

use tracing::debug;

use super::EncodingPath;
use crate::error::DispatchError;
use crate::group::RequestGroup;
use crate::http::DownloadResponse;

/// Entity length the download may trust.
///
/// A declared transfer-encoding makes the length unknown (0) whatever
/// `Content-Length` says.
#[must_use]
pub fn effective_total_length(response: &DownloadResponse) -> u64 {
    if response.is_transfer_encoding_specified() {
        0
    } else {
        response.entity_length()
    }
}

/// Picks the download path for a first response.
#[must_use]
pub fn encoding_path(response: &DownloadResponse) -> EncodingPath {
    if effective_total_length(response) == 0 {
        EncodingPath::Other
    } else {
        EncodingPath::Default
    }
}

/// Stores total length, filename and content type on the group's context.
///
/// The effective length is computed before the single store, so the total
/// is never written twice. Returns the stored total length.
///
/// # Errors
///
/// Returns [`DispatchError::ContextAlreadyInitialized`] if the context was
/// finalized by an earlier response.
pub fn finalize_context(
    group: &mut RequestGroup,
    response: &DownloadResponse,
) -> Result<u64, DispatchError> {
    let total = effective_total_length(response);
    let filename = response.determine_filename();
    let content_type = response.content_type().map(str::to_string);
    debug!(
        group = %group.id(),
        total,
        filename = %filename,
        content_type = ?content_type,
        "download context finalized"
    );
    let id = group.id();
    group
        .context_mut()
        .initialize(id, total, filename, content_type)?;
    Ok(total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DownloadOptions;
    use crate::group::GroupId;
    use crate::test_support::response;

    #[test]
    fn test_transfer_encoding_forces_unknown_length() {
        let chunked = response(200, &[("content-length", "500"), ("transfer-encoding", "chunked")]);
        assert_eq!(effective_total_length(&chunked), 0);
        assert_eq!(encoding_path(&chunked), EncodingPath::Other);
    }

    #[test]
    fn test_known_length_takes_default_path() {
        let plain = response(200, &[("content-length", "1024")]);
        assert_eq!(effective_total_length(&plain), 1024);
        assert_eq!(encoding_path(&plain), EncodingPath::Default);
    }

    #[test]
    fn test_missing_length_takes_other_path() {
        assert_eq!(encoding_path(&response(200, &[])), EncodingPath::Other);
    }

    #[test]
    fn test_finalize_context_stores_metadata_once() {
        let mut group = RequestGroup::new(GroupId(3), vec![], Arc::new(DownloadOptions::default()));
        let first = response(
            200,
            &[
                ("content-length", "2048"),
                ("content-type", "application/x-iso9660-image; q=1"),
                ("content-disposition", "attachment; filename=\"disk.iso\""),
            ],
        );
        assert_eq!(finalize_context(&mut group, &first).unwrap(), 2048);
        assert_eq!(group.context().filename(), Some("disk.iso"));
        assert_eq!(
            group.context().content_type(),
            Some("application/x-iso9660-image")
        );

        let second = response(200, &[("content-length", "1")]);
        assert!(finalize_context(&mut group, &second).is_err());
        assert_eq!(group.context().total_length(), 2048);
    }
}
