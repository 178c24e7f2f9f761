//! Shared fixtures for unit tests.

#![allow(clippy::unwrap_used)]

use url::Url;

use crate::http::DownloadResponse;

/// URL every fixture response is attributed to.
pub(crate) const FIXTURE_URL: &str = "http://a.example/file.bin";

pub(crate) fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

/// A response to [`FIXTURE_URL`] with the given status and headers.
pub(crate) fn response(status: u16, headers: &[(&str, &str)]) -> DownloadResponse {
    DownloadResponse::from_parts(status, headers.iter().copied(), url(FIXTURE_URL)).unwrap()
}
