//! Error types for media cache operations
//!
//! Most cache paths never surface these to callers: the gateway and the
//! service convert expected failures (offline, bad URL, missing file) into
//! `bool`/`Option` results after logging them. `CacheError` is what those
//! layers see internally, and what constructors, configuration validation and
//! catalog loading return directly.

use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while caching or verifying media
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("HTTP status: {0}")]
    HttpStatus(StatusCode),

    /// URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL scheme other than http/https
    #[error("Unsupported URL scheme '{scheme}' in {url}")]
    UnsupportedScheme {
        /// Offending scheme
        scheme: String,
        /// Full URL
        url: String,
    },

    /// Connectivity collaborator reports no network
    #[error("Network unavailable")]
    Offline,

    /// Body exceeded the per-download byte ceiling
    #[error("Download exceeds {limit} byte limit")]
    DownloadTooLarge {
        /// Configured ceiling in bytes
        limit: u64,
    },

    /// File was written but is too small to be a valid asset
    #[error("Downloaded file is {size} bytes, below the {minimum} byte minimum")]
    Undersized {
        /// Observed size
        size: u64,
        /// Required size
        minimum: u64,
    },

    /// Catalog could not be read
    #[error("Failed to load catalog from {path}: {source}")]
    CatalogLoad {
        /// Catalog file path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Catalog row failed validation
    #[error("Invalid catalog row {id}: {reason}")]
    InvalidCatalogRow {
        /// Row identifier
        id: String,
        /// Reason for rejection
        reason: String,
    },

    /// Catalog collaborator failure
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid cache configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),
}

impl CacheError {
    /// Check whether retrying the same request might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Undersized { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            Self::HttpStatus(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CacheError::HttpStatus(StatusCode::BAD_GATEWAY).is_transient());
        assert!(CacheError::HttpStatus(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!CacheError::HttpStatus(StatusCode::NOT_FOUND).is_transient());
        assert!(
            CacheError::Undersized {
                size: 10,
                minimum: 1024
            }
            .is_transient()
        );
        assert!(!CacheError::Offline.is_transient());
        assert!(!CacheError::DownloadTooLarge { limit: 1 }.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = CacheError::UnsupportedScheme {
            scheme: "ftp".to_string(),
            url: "ftp://example.com/a.mp3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported URL scheme 'ftp' in ftp://example.com/a.mp3"
        );

        let err = CacheError::DownloadTooLarge { limit: 200 };
        assert_eq!(err.to_string(), "Download exceeds 200 byte limit");
    }
}
