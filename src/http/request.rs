//! Immutable description of one download attempt's request.

use reqwest::Method;
use url::Url;

use crate::error::DispatchError;

/// One request of a download attempt.
///
/// Values are never mutated in place: following a redirect or resuming at an
/// offset produces a new request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    url: Url,
    method: Method,
    supports_persistent_connection: bool,
    pipelining_enabled: bool,
    redirect_count: u32,
    range_start: Option<u64>,
}

impl DownloadRequest {
    /// Creates a GET request for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidUrl`] if `url` does not parse or has no host.
    pub fn get(url: &str) -> Result<Self, DispatchError> {
        Self::new(url, Method::GET)
    }

    /// Creates a request with an explicit method.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidUrl`] if `url` does not parse or has no host.
    pub fn new(url: &str, method: Method) -> Result<Self, DispatchError> {
        let parsed = Url::parse(url).map_err(|_| DispatchError::invalid_url(url))?;
        Self::from_url(parsed, method)
    }

    /// Creates a request from an already parsed URL.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidUrl`] if the URL has no host or port.
    pub fn from_url(url: Url, method: Method) -> Result<Self, DispatchError> {
        if url.host_str().is_none() || url.port_or_known_default().is_none() {
            return Err(DispatchError::invalid_url(url.as_str()));
        }
        Ok(Self {
            url,
            method,
            supports_persistent_connection: true,
            pipelining_enabled: false,
            redirect_count: 0,
            range_start: None,
        })
    }

    /// Sets whether the connection may be kept alive after this request.
    #[must_use]
    pub fn with_persistent_connection(mut self, enabled: bool) -> Self {
        self.supports_persistent_connection = enabled;
        self
    }

    /// Sets whether requests are pipelined on the connection.
    #[must_use]
    pub fn with_pipelining(mut self, enabled: bool) -> Self {
        self.pipelining_enabled = enabled;
        self
    }

    /// Returns a copy that asks for the entity starting at `offset`.
    #[must_use]
    pub fn with_range_start(&self, offset: u64) -> Self {
        Self {
            range_start: Some(offset),
            ..self.clone()
        }
    }

    /// Returns a copy asking for the whole entity.
    #[must_use]
    pub fn without_range(&self) -> Self {
        Self {
            range_start: None,
            ..self.clone()
        }
    }

    /// Returns a copy for the segment whose write cursor is at `offset`.
    ///
    /// Pipelined requests always carry a range, since later responses on the
    /// connection must be told apart. Otherwise a segment starting at byte 0
    /// asks for the whole entity.
    #[must_use]
    pub fn for_segment(&self, offset: u64) -> Self {
        if offset > 0 || self.pipelining_enabled {
            self.with_range_start(offset)
        } else {
            self.without_range()
        }
    }

    /// Returns the request for a redirect target, counting the hop.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::TooManyRedirects`] once `max_redirects` hops
    /// have been followed, or [`DispatchError::InvalidUrl`] for a target
    /// without host.
    pub fn redirected(&self, target: &Url, max_redirects: u32) -> Result<Self, DispatchError> {
        if self.redirect_count >= max_redirects {
            return Err(DispatchError::TooManyRedirects {
                url: target.to_string(),
                limit: max_redirects,
            });
        }
        let mut next = Self::from_url(target.clone(), self.method.clone())?;
        next.supports_persistent_connection = self.supports_persistent_connection;
        next.pipelining_enabled = self.pipelining_enabled;
        next.redirect_count = self.redirect_count + 1;
        Ok(next)
    }

    /// The target URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Whether this is a HEAD request (no body will follow the response).
    #[must_use]
    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    /// Whether the connection may be reused after this request.
    #[must_use]
    pub fn supports_persistent_connection(&self) -> bool {
        self.supports_persistent_connection
    }

    /// Whether pipelining is enabled for this request.
    #[must_use]
    pub fn is_pipelining_enabled(&self) -> bool {
        self.pipelining_enabled
    }

    /// Number of redirects followed to reach this request.
    #[must_use]
    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    /// First requested byte, if this is a range request.
    #[must_use]
    pub fn range_start(&self) -> Option<u64> {
        self.range_start
    }

    /// Host name of the target.
    #[must_use]
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Port of the target, defaulted from the scheme.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_get_defaults() {
        let request = DownloadRequest::get("http://example.com/file.iso").unwrap();
        assert_eq!(request.method(), &Method::GET);
        assert!(request.supports_persistent_connection());
        assert!(!request.is_pipelining_enabled());
        assert_eq!(request.port(), 80);
        assert_eq!(request.range_start(), None);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(matches!(
            DownloadRequest::get("not a url"),
            Err(DispatchError::InvalidUrl { .. })
        ));
        assert!(matches!(
            DownloadRequest::get("file:///tmp/x"),
            Err(DispatchError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_redirected_keeps_flags_and_counts_hops() {
        let request = DownloadRequest::get("http://example.com/a")
            .unwrap()
            .with_pipelining(true);
        let target = Url::parse("https://mirror.example.org/a").unwrap();
        let next = request.redirected(&target, 20).unwrap();
        assert_eq!(next.url(), &target);
        assert_eq!(next.port(), 443);
        assert_eq!(next.redirect_count(), 1);
        assert!(next.is_pipelining_enabled());
        assert_eq!(request.redirect_count(), 0);
    }

    #[test]
    fn test_redirected_stops_at_limit() {
        let target = Url::parse("http://example.com/loop").unwrap();
        let mut request = DownloadRequest::get("http://example.com/loop").unwrap();
        for _ in 0..3 {
            request = request.redirected(&target, 3).unwrap();
        }
        assert!(matches!(
            request.redirected(&target, 3),
            Err(DispatchError::TooManyRedirects { limit: 3, .. })
        ));
    }

    #[test]
    fn test_range_start_zero_is_kept() {
        let request = DownloadRequest::get("http://example.com/a").unwrap();
        assert_eq!(request.with_range_start(512).range_start(), Some(512));
        assert_eq!(request.with_range_start(0).range_start(), Some(0));
        assert_eq!(request.with_range_start(0).without_range().range_start(), None);
    }

    #[test]
    fn test_segment_at_zero_is_explicit_only_when_pipelining() {
        let plain = DownloadRequest::get("http://example.com/a").unwrap();
        assert_eq!(plain.for_segment(0).range_start(), None);
        assert_eq!(plain.for_segment(1024).range_start(), Some(1024));

        let pipelined = plain.with_pipelining(true);
        assert_eq!(pipelined.for_segment(0).range_start(), Some(0));
        assert_eq!(pipelined.for_segment(1024).range_start(), Some(1024));
    }
}
