//! Pure classification of an arrived (or not yet arrived) response.

use url::Url;

use super::init::encoding_path;
use super::redirect::plan_redirect;
use crate::error::DispatchError;
use crate::http::{DownloadRequest, DownloadResponse};

/// How to follow a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectPlan {
    /// Discard the redirect body, then reuse the connection for `target`.
    DrainThenFollow {
        /// Resolved redirect target.
        target: Url,
    },
    /// Pool (if persistent) or drop the connection and restart for `target`.
    PoolAndRetry {
        /// Resolved redirect target.
        target: Url,
    },
}

/// Which download path a first response takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingPath {
    /// Known length, identity encoding: segmented and resumable.
    Default,
    /// Unknown length or transfer-encoded: one unseekable stream.
    Other,
}

/// Outcome of classifying one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPlan {
    /// No response yet; try again later.
    Pending,
    /// Follow a redirect.
    Redirect(RedirectPlan),
    /// First response of the download: finalize the context, then take a path.
    Initialize(EncodingPath),
    /// The download already has piece storage: continue it.
    ContinueExisting,
}

/// Classifies a response for `request`.
///
/// `has_piece_storage` tells whether the download already began.
///
/// # Errors
///
/// Returns the response's validation error (bad status, malformed headers,
/// ignored range request).
pub fn classify(
    request: &DownloadRequest,
    response: Option<&DownloadResponse>,
    has_piece_storage: bool,
) -> Result<DispatchPlan, DispatchError> {
    let Some(response) = response else {
        return Ok(DispatchPlan::Pending);
    };
    response.validate(request)?;

    if let Some(redirect) = plan_redirect(request, response) {
        return Ok(DispatchPlan::Redirect(redirect));
    }
    if has_piece_storage {
        return Ok(DispatchPlan::ContinueExisting);
    }
    Ok(DispatchPlan::Initialize(encoding_path(response)))
}
