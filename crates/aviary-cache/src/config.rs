//! Media cache configuration
//!
//! Defaults match the limits the mobile client ships with: a 500 MiB shared
//! budget for images and audio, a 200 MiB per-download ceiling, and two
//! download attempts 300 ms apart. Every value can be overridden from the
//! environment with an `AVIARY_` variable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::retry::RetryPolicy;
use crate::transport::HttpConfig;

const MIB: u64 = 1024 * 1024;

/// Configuration for [`AssetCacheService`](crate::service::AssetCacheService)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaCacheConfig {
    /// Root directory holding `images/`, `audio/` and `logs/`
    pub cache_root: PathBuf,

    /// Aggregate ceiling enforced by eviction
    pub max_cache_bytes: u64,

    /// Hard ceiling for a single download
    pub max_download_bytes: u64,

    /// Audio files must be strictly larger than this to count as cached
    pub min_audio_bytes: u64,

    /// Image files must be strictly larger than this to count as cached
    pub min_image_bytes: u64,

    /// Minimum audio size accepted by the integrity verifier
    pub verify_min_bytes: u64,

    /// Expected sizes at or above this are recovered through the streaming path
    pub streaming_threshold_bytes: u64,

    /// Download retry policy
    pub retry: RetryPolicy,

    /// HTTP client settings
    pub http: HttpConfig,
}

impl Default for MediaCacheConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            max_cache_bytes: 500 * MIB,
            max_download_bytes: 200 * MIB,
            min_audio_bytes: 1024,
            min_image_bytes: 0,
            verify_min_bytes: 30 * 1024,
            streaming_threshold_bytes: MIB,
            retry: RetryPolicy::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Platform cache directory joined with `aviary`, or `./aviary-cache`
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir().map_or_else(|| PathBuf::from("aviary-cache"), |dir| dir.join("aviary"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl MediaCacheConfig {
    /// Create a configuration rooted at `cache_root` with default limits
    pub fn new(cache_root: impl AsRef<Path>) -> Self {
        Self {
            cache_root: cache_root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables keep their default value.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: env_parse("AVIARY_MAX_ATTEMPTS").unwrap_or(defaults.retry.max_attempts),
            initial_backoff: env_parse("AVIARY_RETRY_BACKOFF_MS")
                .map_or(defaults.retry.initial_backoff, Duration::from_millis),
            ..defaults.retry.clone()
        };

        let config = Self {
            cache_root: std::env::var("AVIARY_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_root),
            max_cache_bytes: env_parse("AVIARY_MAX_CACHE_BYTES")
                .unwrap_or(defaults.max_cache_bytes),
            max_download_bytes: env_parse("AVIARY_MAX_DOWNLOAD_BYTES")
                .unwrap_or(defaults.max_download_bytes),
            min_audio_bytes: env_parse("AVIARY_MIN_AUDIO_BYTES")
                .unwrap_or(defaults.min_audio_bytes),
            min_image_bytes: env_parse("AVIARY_MIN_IMAGE_BYTES")
                .unwrap_or(defaults.min_image_bytes),
            verify_min_bytes: env_parse("AVIARY_VERIFY_MIN_BYTES")
                .unwrap_or(defaults.verify_min_bytes),
            streaming_threshold_bytes: env_parse("AVIARY_STREAMING_THRESHOLD")
                .unwrap_or(defaults.streaming_threshold_bytes),
            retry,
            http: defaults.http,
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the cache root
    pub fn with_cache_root(mut self, cache_root: impl AsRef<Path>) -> Self {
        self.cache_root = cache_root.as_ref().to_path_buf();
        self
    }

    /// Set the aggregate cache ceiling
    pub fn with_max_cache_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    /// Set the per-download ceiling
    pub fn with_max_download_bytes(mut self, bytes: u64) -> Self {
        self.max_download_bytes = bytes;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the verifier's minimum audio size
    pub fn with_verify_min_bytes(mut self, bytes: u64) -> Self {
        self.verify_min_bytes = bytes;
        self
    }

    /// Set the streaming recovery threshold
    pub fn with_streaming_threshold(mut self, bytes: u64) -> Self {
        self.streaming_threshold_bytes = bytes;
        self
    }

    /// Directory holding the append-only repair log
    pub fn logs_dir(&self) -> PathBuf {
        self.cache_root.join("logs")
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_bytes == 0 {
            return Err(CacheError::InvalidConfiguration(
                "max_cache_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_download_bytes == 0 {
            return Err(CacheError::InvalidConfiguration(
                "max_download_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_download_bytes > self.max_cache_bytes {
            return Err(CacheError::InvalidConfiguration(format!(
                "max_download_bytes ({}) exceeds max_cache_bytes ({})",
                self.max_download_bytes, self.max_cache_bytes
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(CacheError::InvalidConfiguration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.cache_root.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "cache_root must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
