//! Shared fixtures for integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use aviary_cache::prelude::*;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Audio body with an ID3 tag, padded to `len` bytes.
pub fn audio_body(len: usize) -> Vec<u8> {
    let mut body = b"ID3\x04\x00\x00".to_vec();
    body.resize(len, 0);
    body
}

/// PNG body padded to `len` bytes.
pub fn png_body(len: usize) -> Vec<u8> {
    let mut body = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    body.resize(len, 0);
    body
}

/// Hex SHA-256 of `input`, computed independently of the crate.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Where `url` lands under `root`.
pub fn audio_path(root: &Path, url: &str) -> PathBuf {
    let normalized = url.split(['?', '#']).next().unwrap_or(url);
    root.join("audio").join(format!("{}.mp3", sha256_hex(normalized)))
}

/// Test configuration: fast retries, defaults otherwise.
pub fn config(root: &Path) -> MediaCacheConfig {
    let retry = RetryPolicy::default().with_backoff(Duration::from_millis(10));
    MediaCacheConfig::new(root).with_retry(retry)
}

/// Service over local storage rooted at `root`.
pub fn service(config: MediaCacheConfig, monitor: &ConnectivityMonitor) -> AssetCacheService {
    AssetCacheService::builder(config)
        .with_connectivity(Arc::new(monitor.clone()))
        .build()
        .expect("Failed to build cache service")
}

/// Write `data` to `path`, creating parents, with an explicit mtime.
pub fn seed_file(path: &Path, data: &[u8], modified: SystemTime) {
    std::fs::create_dir_all(path.parent().expect("Seed path has no parent"))
        .expect("Failed to create seed directory");
    std::fs::write(path, data).expect("Failed to write seed file");
    std::fs::File::options()
        .write(true)
        .open(path)
        .expect("Failed to reopen seed file")
        .set_modified(modified)
        .expect("Failed to set seed mtime");
}

/// Timestamp `secs` seconds after the epoch.
pub fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}
