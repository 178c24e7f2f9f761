//! Parsed response metadata and the facts the dispatcher derives from it.

use reqwest::StatusCode;
use reqwest::header::{
    CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, HeaderName,
    HeaderValue, LOCATION, SET_COOKIE, TRANSFER_ENCODING,
};
use url::Url;

use super::DownloadRequest;
use super::filename::determine_filename;
use crate::error::DispatchError;

/// Status line and headers of one response, constructed by the transport.
#[derive(Debug, Clone)]
pub struct DownloadResponse {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
}

/// Parsed `Content-Range: bytes first-last/total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    first: u64,
    total: Option<u64>,
}

impl DownloadResponse {
    /// Creates a response for a request to `url`.
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, url: Url) -> Self {
        Self {
            status,
            headers,
            url,
        }
    }

    /// Builds a response from raw status code and header pairs.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Protocol`] for an out-of-range status code or
    /// a header name/value that is not valid HTTP.
    pub fn from_parts<'a>(
        status: u16,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        url: Url,
    ) -> Result<Self, DispatchError> {
        let status = StatusCode::from_u16(status)
            .map_err(|_| DispatchError::protocol(url.as_str(), format!("bad status {status}")))?;
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                DispatchError::protocol(url.as_str(), format!("bad header name '{name}'"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                DispatchError::protocol(url.as_str(), format!("bad value for header '{name}'"))
            })?;
            map.append(name, value);
        }
        Ok(Self::new(status, map, url))
    }

    /// Adds a header, keeping earlier values with the same name.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// The status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// All response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// URL of the request this response answers.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Checks the status and the headers the dispatcher relies on.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::HttpStatus`] for 4xx/5xx statuses.
    /// - [`DispatchError::Protocol`] for a redirect without usable `Location`,
    ///   an unparsable `Content-Length`/`Content-Range`, or a response that
    ///   ignored the request's range.
    pub fn validate(&self, request: &DownloadRequest) -> Result<(), DispatchError> {
        let url = request.url().as_str();
        if self.status.is_client_error() || self.status.is_server_error() {
            return Err(DispatchError::http_status(url, self.status.as_u16()));
        }

        if self.header_str(CONTENT_LENGTH).is_some() && self.content_length().is_none() {
            return Err(DispatchError::protocol(url, "malformed Content-Length"));
        }
        let content_range = match self.header_str(CONTENT_RANGE) {
            Some(raw) => Some(
                parse_content_range(raw)
                    .ok_or_else(|| DispatchError::protocol(url, "malformed Content-Range"))?,
            ),
            None => None,
        };

        if is_redirect_status(self.status) && self.redirect_uri().is_none() {
            return Err(DispatchError::protocol(
                url,
                format!("redirect status {} without usable Location", self.status),
            ));
        }

        if let Some(start) = request.range_start()
            && !is_redirect_status(self.status)
        {
            let honored = self.status == StatusCode::PARTIAL_CONTENT
                && content_range.is_some_and(|range| range.first == start);
            if !honored {
                return Err(DispatchError::protocol(
                    url,
                    format!("server ignored range request starting at byte {start}"),
                ));
            }
        }
        Ok(())
    }

    /// Whether this is a redirect carrying a target.
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        is_redirect_status(self.status) && self.redirect_uri().is_some()
    }

    /// Redirect target resolved against the request URL.
    #[must_use]
    pub fn redirect_uri(&self) -> Option<Url> {
        let location = self.header_str(LOCATION)?.trim();
        if location.is_empty() {
            return None;
        }
        self.url.join(location).ok()
    }

    /// Full entity length, or 0 when unknown.
    ///
    /// For a partial response the total from `Content-Range` wins over the
    /// length of the partial body.
    #[must_use]
    pub fn entity_length(&self) -> u64 {
        if let Some(range) = self.header_str(CONTENT_RANGE).and_then(parse_content_range) {
            return range.total.unwrap_or(0);
        }
        self.content_length().unwrap_or(0)
    }

    /// Number of body bytes that follow this header block, when declared.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header_str(CONTENT_LENGTH)?.trim().parse().ok()
    }

    /// Declared transfer-encoding token list, if any.
    #[must_use]
    pub fn transfer_encoding(&self) -> Option<&str> {
        self.header_str(TRANSFER_ENCODING)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Whether any transfer-encoding is declared.
    #[must_use]
    pub fn is_transfer_encoding_specified(&self) -> bool {
        self.transfer_encoding().is_some()
    }

    /// Media type from `Content-Type`, without parameters.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header_str(CONTENT_TYPE)
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Raw `Set-Cookie` values.
    pub fn cookies(&self) -> impl Iterator<Item = &str> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
    }

    /// Destination filename suggested by this response.
    #[must_use]
    pub fn determine_filename(&self) -> String {
        determine_filename(
            self.header_str(CONTENT_DISPOSITION),
            &self.url,
            self.content_type(),
        )
    }

    fn header_str(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

fn is_redirect_status(status: StatusCode) -> bool {
    status.is_redirection() && status != StatusCode::NOT_MODIFIED
}

fn parse_content_range(raw: &str) -> Option<ContentRange> {
    let byte_range = raw.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = byte_range.split_once('/')?;
    let (first, last) = range.trim().split_once('-')?;
    let first: u64 = first.trim().parse().ok()?;
    let last: u64 = last.trim().parse().ok()?;
    if last < first {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        value => {
            let total: u64 = value.parse().ok()?;
            if last >= total {
                return None;
            }
            Some(total)
        }
    };
    Some(ContentRange { first, total })
}
