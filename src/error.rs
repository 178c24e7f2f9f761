//! Error types for response dispatch and body transfer.
//!
//! Every fatal condition raised while handling a response is a
//! [`DispatchError`]. The outer retry/backoff policy is not part of this
//! crate; [`classify_error`] gives it the information it needs to decide.

use std::path::PathBuf;

use thiserror::Error;

use crate::group::GroupId;

/// Errors that abort the current download attempt.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The response is malformed or inconsistent with the request.
    #[error("protocol error for {url}: {reason}")]
    Protocol {
        /// The request URL.
        url: String,
        /// What was wrong with the response.
        reason: String,
    },

    /// Server answered with an error status (4xx, 5xx).
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// The request URL.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// A transfer-encoding was declared that no decoder recognizes.
    #[error("transfer encoding '{encoding}' is not supported (from {url})")]
    UnsupportedEncoding {
        /// The request URL.
        url: String,
        /// The declared transfer-encoding token.
        encoding: String,
    },

    /// Another active download already targets the same destination file.
    #[error("file {path} is already being downloaded by another download")]
    DuplicateDownload {
        /// The contested destination path.
        path: PathBuf,
    },

    /// A continued response reports a different size than previously recorded.
    #[error("entity length mismatch: expected {expected} bytes, server reports {actual}")]
    LengthMismatch {
        /// Total length recorded for the download.
        expected: u64,
        /// Entity length reported by the latest response.
        actual: u64,
    },

    /// The entity would need more pieces than a download may track.
    #[error("entity of {total_length} bytes needs more than {limit} pieces of {piece_length} bytes")]
    TooManyPieces {
        /// Entity length reported by the server.
        total_length: u64,
        /// Configured piece length.
        piece_length: u64,
        /// Maximum number of pieces per download.
        limit: u64,
    },

    /// Destination exists and overwriting is not permitted.
    #[error("file {path} already exists and overwriting is disabled")]
    FileExists {
        /// The existing destination path.
        path: PathBuf,
    },

    /// Redirect chain exceeded the configured limit.
    #[error("too many redirects ({limit}) following {url}")]
    TooManyRedirects {
        /// The last redirect target.
        url: String,
        /// The configured redirect limit.
        limit: u32,
    },

    /// Transfer speed fell below the configured lowest speed limit.
    #[error("transfer from {url} too slow: {bytes_per_sec} B/s below limit {limit} B/s")]
    TooSlow {
        /// The request URL.
        url: String,
        /// Observed average speed.
        bytes_per_sec: u64,
        /// The configured lowest speed limit.
        limit: u64,
    },

    /// File system error on the destination or its progress snapshot.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Socket-level failure while talking to a peer.
    #[error("connection error with {host}:{port}: {source}")]
    Connection {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The URL is malformed or has no host.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The download context was initialized twice.
    #[error("download context of group {group} is already initialized")]
    ContextAlreadyInitialized {
        /// The offending group.
        group: GroupId,
    },

    /// A command referenced a request group the engine does not know.
    #[error("unknown request group {0}")]
    UnknownGroup(GroupId),
}

impl DispatchError {
    /// Creates a protocol error.
    pub fn protocol(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an unsupported transfer-encoding error.
    pub fn unsupported_encoding(url: impl Into<String>, encoding: impl Into<String>) -> Self {
        Self::UnsupportedEncoding {
            url: url.into(),
            encoding: encoding.into(),
        }
    }

    /// Creates a duplicate-download error.
    pub fn duplicate_download(path: impl Into<PathBuf>) -> Self {
        Self::DuplicateDownload { path: path.into() }
    }

    /// Creates a file-exists error.
    pub fn file_exists(path: impl Into<PathBuf>) -> Self {
        Self::FileExists { path: path.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a connection error.
    pub fn connection(host: impl Into<String>, port: u16, source: std::io::Error) -> Self {
        Self::Connection {
            host: host.into(),
            port,
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}

// No From<std::io::Error>: every variant needs the path or peer for context.

/// Classification of dispatch failures for the outer retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on a later attempt (network trouble, 5xx, slow peer).
    Transient,

    /// Retrying cannot change the outcome (4xx, bad protocol, unsupported encoding).
    Permanent,

    /// Local configuration conflict (duplicate download, existing file).
    Conflict,

    /// Server content changed underneath a partial download.
    Integrity,
}

/// Classifies an error into a [`FailureType`].
#[must_use]
pub fn classify_error(error: &DispatchError) -> FailureType {
    match error {
        DispatchError::HttpStatus { status, .. } if *status >= 500 => FailureType::Transient,
        DispatchError::Connection { .. } | DispatchError::TooSlow { .. } => {
            FailureType::Transient
        }
        DispatchError::DuplicateDownload { .. } | DispatchError::FileExists { .. } => {
            FailureType::Conflict
        }
        DispatchError::LengthMismatch { .. } => FailureType::Integrity,
        DispatchError::HttpStatus { .. }
        | DispatchError::Protocol { .. }
        | DispatchError::UnsupportedEncoding { .. }
        | DispatchError::TooManyRedirects { .. }
        | DispatchError::TooManyPieces { .. }
        | DispatchError::Io { .. }
        | DispatchError::InvalidUrl { .. }
        | DispatchError::ContextAlreadyInitialized { .. }
        | DispatchError::UnknownGroup(_) => FailureType::Permanent,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_encoding_display() {
        let error = DispatchError::unsupported_encoding("http://example.com/a", "unknown-xyz");
        let msg = error.to_string();
        assert!(msg.contains("unknown-xyz"), "Expected token in: {msg}");
        assert!(msg.contains("http://example.com/a"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_duplicate_download_display_names_path() {
        let error = DispatchError::duplicate_download("/tmp/file.iso");
        assert!(error.to_string().contains("/tmp/file.iso"));
    }

    #[test]
    fn test_length_mismatch_display() {
        let error = DispatchError::LengthMismatch {
            expected: 1024,
            actual: 2048,
        };
        let msg = error.to_string();
        assert!(msg.contains("1024") && msg.contains("2048"), "{msg}");
    }

    #[test]
    fn test_classify_server_errors_transient() {
        let error = DispatchError::http_status("http://example.com", 503);
        assert_eq!(classify_error(&error), FailureType::Transient);
    }

    #[test]
    fn test_classify_client_errors_permanent() {
        let error = DispatchError::http_status("http://example.com", 404);
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_classify_conflicts_and_integrity() {
        assert_eq!(
            classify_error(&DispatchError::duplicate_download("/tmp/x")),
            FailureType::Conflict
        );
        assert_eq!(
            classify_error(&DispatchError::LengthMismatch {
                expected: 1,
                actual: 2
            }),
            FailureType::Integrity
        );
    }

    #[test]
    fn test_classify_unsupported_encoding_not_retryable() {
        let error = DispatchError::unsupported_encoding("http://example.com", "br");
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }
}
