//! Connection reuse when following a redirect.

use url::Url;

use super::RedirectPlan;
use crate::http::{DownloadRequest, DownloadResponse};

/// Chooses how to follow a redirect response.
///
/// A persistent connection whose redirect response carries a body (declared
/// length or transfer-encoding) must be drained before it can carry the next
/// request. Everything else is pooled (if persistent) or dropped, and the
/// attempt restarts. HEAD responses never carry a body.
///
/// Returns `None` when `response` is not a redirect.
#[must_use]
pub fn plan_redirect(request: &DownloadRequest, response: &DownloadResponse) -> Option<RedirectPlan> {
    if !response.is_redirect() {
        return None;
    }
    let target: Url = response.redirect_uri()?;
    let has_body = !request.is_head()
        && (response.entity_length() > 0 || response.is_transfer_encoding_specified());
    if request.supports_persistent_connection() && has_body {
        Some(RedirectPlan::DrainThenFollow { target })
    } else {
        Some(RedirectPlan::PoolAndRetry { target })
    }
}
