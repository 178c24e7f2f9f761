//! Download options shared by every command of an engine run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default redirect limit per download attempt chain.
pub const DEFAULT_MAX_REDIRECTS: u32 = 20;

/// Default piece (and segment) length: 1 MiB.
pub const DEFAULT_PIECE_LENGTH: u64 = 1024 * 1024;

/// Smallest accepted piece length.
const MIN_PIECE_LENGTH: u64 = 1024;

/// Default grace period before the lowest speed limit applies.
pub const DEFAULT_STARTUP_IDLE_TIME: Duration = Duration::from_secs(10);

/// Invalid option values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Piece length below the minimum.
    #[error("invalid piece length {value}: must be at least {MIN_PIECE_LENGTH} bytes")]
    InvalidPieceLength {
        /// The rejected value.
        value: u64,
    },

    /// Redirect limit of zero would reject every redirect.
    #[error("invalid max redirects {value}: must be between 1 and 100")]
    InvalidMaxRedirects {
        /// The rejected value.
        value: u32,
    },

    /// Lowest speed limit above the download cap can never be satisfied.
    #[error("lowest speed limit {lowest} B/s exceeds max download limit {max} B/s")]
    ConflictingSpeedLimits {
        /// Configured lowest speed limit.
        lowest: u64,
        /// Configured max download limit.
        max: u64,
    },
}

/// Options consulted while dispatching responses and transferring bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Directory receiving downloaded files.
    pub dir: PathBuf,
    /// Overwrite an existing destination instead of failing.
    pub allow_overwrite: bool,
    /// Pick a free `name_N.ext` when the destination exists.
    pub auto_file_renaming: bool,
    /// Permit several connections to the same host for one download.
    pub single_host_multi_connection: bool,
    /// Send requests pipelined on a persistent connection.
    pub enable_pipelining: bool,
    /// Ask for persistent (keep-alive) connections.
    pub persistent_connections: bool,
    /// Redirect limit for one download.
    pub max_redirects: u32,
    /// Piece and segment length in bytes.
    pub piece_length: u64,
    /// Download cap in bytes per second (0 = unlimited).
    pub max_download_limit: u64,
    /// Abort a transfer slower than this many bytes per second (0 = off).
    pub lowest_speed_limit: u64,
    /// Grace period before `lowest_speed_limit` is checked.
    pub startup_idle_time: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            allow_overwrite: false,
            auto_file_renaming: true,
            single_host_multi_connection: false,
            enable_pipelining: false,
            persistent_connections: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            piece_length: DEFAULT_PIECE_LENGTH,
            max_download_limit: 0,
            lowest_speed_limit: 0,
            startup_idle_time: DEFAULT_STARTUP_IDLE_TIME,
        }
    }
}

impl DownloadOptions {
    /// Creates default options writing into `dir`.
    #[must_use]
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Checks option values against each other and their valid ranges.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.piece_length < MIN_PIECE_LENGTH {
            return Err(ConfigError::InvalidPieceLength {
                value: self.piece_length,
            });
        }
        if !(1..=100).contains(&self.max_redirects) {
            return Err(ConfigError::InvalidMaxRedirects {
                value: self.max_redirects,
            });
        }
        if self.max_download_limit > 0 && self.lowest_speed_limit > self.max_download_limit {
            return Err(ConfigError::ConflictingSpeedLimits {
                lowest: self.lowest_speed_limit,
                max: self.max_download_limit,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        assert_eq!(DownloadOptions::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_tiny_piece_length() {
        let options = DownloadOptions {
            piece_length: 10,
            ..DownloadOptions::default()
        };
        assert_eq!(
            options.validate(),
            Err(ConfigError::InvalidPieceLength { value: 10 })
        );
    }

    #[test]
    fn test_rejects_zero_redirects() {
        let options = DownloadOptions {
            max_redirects: 0,
            ..DownloadOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidMaxRedirects { value: 0 })
        ));
    }

    #[test]
    fn test_rejects_unsatisfiable_speed_limits() {
        let options = DownloadOptions {
            max_download_limit: 100,
            lowest_speed_limit: 200,
            ..DownloadOptions::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("200"));
    }

    #[test]
    fn test_lowest_limit_allowed_when_uncapped() {
        let options = DownloadOptions {
            lowest_speed_limit: 200,
            ..DownloadOptions::default()
        };
        assert_eq!(options.validate(), Ok(()));
    }
}
