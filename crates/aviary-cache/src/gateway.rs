//! Filesystem and network gateway
//!
//! Every component touches storage and the network through this type. No
//! operation here fails past its own boundary for expected conditions: a
//! missing file is `None`, an empty directory listing is `vec![]`, and a
//! failed download is `false`. Errors are logged with the path or URL that
//! caused them.

use futures::StreamExt as _;
use reqwest::{Client, Response};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use url::Url;

use crate::connectivity::Connectivity;
use crate::error::{CacheError, Result};
use crate::storage::{DirEntry, FileStat, Storage, StreamSink};

/// How a download is written to storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadMode {
    /// Stream when the backend supports it, otherwise buffer
    #[default]
    Auto,
    /// Stream chunks straight to storage (falls back to buffering if unsupported)
    Streaming,
    /// Collect the full body, then write it in one call
    Buffered,
}

/// Storage and download primitives shared by the cache components
pub struct FilesystemGateway {
    storage: Arc<dyn Storage>,
    connectivity: Arc<dyn Connectivity>,
    client: Client,
    max_download_bytes: u64,
}

impl std::fmt::Debug for FilesystemGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemGateway")
            .field("max_download_bytes", &self.max_download_bytes)
            .field("online", &self.connectivity.is_connected())
            .finish_non_exhaustive()
    }
}

impl FilesystemGateway {
    /// Create a gateway over `storage`
    pub fn new(
        storage: Arc<dyn Storage>,
        connectivity: Arc<dyn Connectivity>,
        client: Client,
        max_download_bytes: u64,
    ) -> Self {
        Self {
            storage,
            connectivity,
            client,
            max_download_bytes,
        }
    }

    /// Whether the network is currently reported as available
    pub fn is_online(&self) -> bool {
        self.connectivity.is_connected()
    }

    /// Connectivity source
    pub fn connectivity(&self) -> &Arc<dyn Connectivity> {
        &self.connectivity
    }

    /// Stat `path`; `None` when absent or unreadable
    pub async fn exists(&self, path: &Path) -> Option<FileStat> {
        match self.storage.stat(path).await {
            Ok(stat) => stat,
            Err(e) => {
                tracing::warn!("Failed to stat {:?}: {}", path, e);
                None
            }
        }
    }

    /// Create `path` and its parents
    pub async fn ensure_dir(&self, path: &Path) -> bool {
        match self.storage.create_dir_all(path).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to create directory {:?}: {}", path, e);
                false
            }
        }
    }

    /// Write `data` to `path`, creating the parent directory first
    ///
    /// Callers verify the post-write size themselves.
    pub async fn write(&self, path: &Path, data: &[u8]) -> bool {
        if let Some(parent) = path.parent()
            && !self.ensure_dir(parent).await
        {
            return false;
        }
        match self.storage.write(path, data).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to write {:?}: {}", path, e);
                false
            }
        }
    }

    /// Append `data` to `path`, creating the parent directory first
    pub async fn append(&self, path: &Path, data: &[u8]) -> bool {
        if let Some(parent) = path.parent()
            && !self.ensure_dir(parent).await
        {
            return false;
        }
        match self.storage.append(path, data).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to append to {:?}: {}", path, e);
                false
            }
        }
    }

    /// Read a whole file
    pub async fn read(&self, path: &Path) -> Option<Vec<u8>> {
        match self.storage.read(path).await {
            Ok(data) => Some(data),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Failed to read {:?}: {}", path, e);
                None
            }
        }
    }

    /// Read up to `len` leading bytes of `path`
    pub async fn read_prefix(&self, path: &Path, len: usize) -> Option<Vec<u8>> {
        match self.storage.read_prefix(path, len).await {
            Ok(data) => Some(data),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Failed to read header of {:?}: {}", path, e);
                None
            }
        }
    }

    /// Delete `path`; returns whether a file was removed
    pub async fn delete(&self, path: &Path) -> bool {
        match self.storage.remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!("Failed to delete {:?}: {}", path, e);
                false
            }
        }
    }

    /// Delete a directory tree; returns whether it was removed
    pub async fn remove_dir(&self, path: &Path) -> bool {
        match self.storage.remove_dir_all(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!("Failed to remove directory {:?}: {}", path, e);
                false
            }
        }
    }

    /// List the immediate children of `path`; empty when absent
    pub async fn list_dir(&self, path: &Path) -> Vec<DirEntry> {
        match self.storage.read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to list {:?}: {}", path, e);
                Vec::new()
            }
        }
    }

    /// Platform-playable URI for `path`
    pub fn resolve_uri(&self, path: &Path) -> String {
        self.storage.playable_uri(path)
    }

    /// Size reported by a HEAD request, if the server provides one
    pub async fn content_length(&self, url: &str) -> Option<u64> {
        if !self.is_online() {
            return None;
        }
        let parsed = validate_url(url).ok()?;
        let response = match self.client.head(parsed).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("HEAD {} failed: {}", url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        // content_length() reports the (empty) body for HEAD, so read the header
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
    }

    /// Download `url` to `dest`, choosing the write path automatically
    pub async fn download(&self, url: &str, dest: &Path) -> bool {
        self.download_with(url, dest, DownloadMode::Auto).await
    }

    /// Download `url` to `dest` using `mode`
    pub async fn download_with(&self, url: &str, dest: &Path, mode: DownloadMode) -> bool {
        match self.try_download(url, dest, mode).await {
            Ok(bytes) => {
                tracing::info!("Downloaded {} ({} bytes) to {:?}", url, bytes, dest);
                true
            }
            Err(CacheError::Offline) => {
                tracing::debug!("Skipping download of {}: offline", url);
                false
            }
            Err(e) => {
                tracing::warn!("Download of {} to {:?} failed: {}", url, dest, e);
                false
            }
        }
    }

    async fn try_download(&self, url: &str, dest: &Path, mode: DownloadMode) -> Result<u64> {
        if !self.is_online() {
            return Err(CacheError::Offline);
        }
        let parsed = validate_url(url)?;

        let response = self.client.get(parsed).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::HttpStatus(status));
        }
        if let Some(len) = response.content_length()
            && len > self.max_download_bytes
        {
            return Err(CacheError::DownloadTooLarge {
                limit: self.max_download_bytes,
            });
        }

        if let Some(parent) = dest.parent() {
            self.storage.create_dir_all(parent).await?;
        }

        let sink = match mode {
            DownloadMode::Buffered => None,
            DownloadMode::Auto | DownloadMode::Streaming => self.storage.open_sink(dest).await?,
        };

        match sink {
            Some(sink) => self.stream_into(sink, response).await,
            None => self.buffer_into(dest, response).await,
        }
    }

    async fn stream_into(&self, mut sink: Box<dyn StreamSink>, response: Response) -> Result<u64> {
        let mut stream = response.bytes_stream();
        let mut received = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    sink.abort().await;
                    return Err(e.into());
                }
            };
            received += chunk.len() as u64;
            if received > self.max_download_bytes {
                sink.abort().await;
                return Err(CacheError::DownloadTooLarge {
                    limit: self.max_download_bytes,
                });
            }
            if let Err(e) = sink.write_chunk(&chunk).await {
                sink.abort().await;
                return Err(e.into());
            }
        }

        Ok(sink.commit().await?)
    }

    async fn buffer_into(&self, dest: &Path, response: Response) -> Result<u64> {
        let mut stream = response.bytes_stream();
        let mut body = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if (body.len() + chunk.len()) as u64 > self.max_download_bytes {
                return Err(CacheError::DownloadTooLarge {
                    limit: self.max_download_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        self.storage.write(dest, &body).await?;
        Ok(body.len() as u64)
    }
}

/// Parse `url` and require an http(s) scheme
pub fn validate_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim()).map_err(|e| CacheError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(CacheError::UnsupportedScheme {
            scheme: scheme.to_string(),
            url: url.to_string(),
        }),
    }
}
