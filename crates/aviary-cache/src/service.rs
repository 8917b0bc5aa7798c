//! Asset cache service
//!
//! Entry point for the host application. [`AssetCacheService::ensure_cached`]
//! maps a remote URL to a local playable reference, downloading on a miss and
//! reusing the stored file on a hit. Work for one asset is collapsed through a
//! [`SingleFlight`] registry owned by the service, so concurrent requests for
//! the same URL share one download sequence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::address::{AssetKind, CacheKey, ContentAddresser, HashStrategy};
use crate::budget::{EvictionReport, StorageBudgetEnforcer};
use crate::catalog::Catalog;
use crate::config::MediaCacheConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::error::{CacheError, Result};
use crate::gateway::FilesystemGateway;
use crate::repair_log::RepairLog;
use crate::retry::Attempt;
use crate::single_flight::SingleFlight;
use crate::stats::{CacheMetrics, CacheStats};
use crate::storage::{LocalStorage, Storage};
use crate::transport::build_client;
use crate::verify::{IntegrityVerifier, VerifyScope};

/// Whether the host can persist media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageCapability {
    /// Files survive restarts; cache normally
    #[default]
    Durable,
    /// Nothing durable to write to; hand back the remote URL unchanged
    PassThrough,
}

/// Reference handed back to the host for playback or display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    /// Served from the local cache
    Cached {
        /// Platform-playable URI
        uri: String,
        /// Location on storage
        path: PathBuf,
    },
    /// Original URL, returned in pass-through mode
    Remote(String),
}

impl MediaRef {
    /// URI to load
    pub fn uri(&self) -> &str {
        match self {
            Self::Cached { uri, .. } => uri,
            Self::Remote(url) => url,
        }
    }

    /// Whether the reference points at a cached file
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached { .. })
    }
}

/// Result shared by every caller joined on one flight
pub(crate) type FlightOutcome = Option<MediaRef>;

pub(crate) struct ServiceInner {
    pub(crate) config: MediaCacheConfig,
    pub(crate) addresser: ContentAddresser,
    pub(crate) gateway: Arc<FilesystemGateway>,
    pub(crate) budget: Arc<StorageBudgetEnforcer>,
    pub(crate) flights: Arc<SingleFlight<FlightOutcome>>,
    pub(crate) metrics: Arc<CacheMetrics>,
    pub(crate) repair_log: RepairLog,
    pub(crate) capability: StorageCapability,
}

impl ServiceInner {
    pub(crate) fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.config.cache_root.join(key.relative_path())
    }

    /// Files must be strictly larger than this to count as cached
    pub(crate) fn min_bytes(&self, kind: AssetKind) -> u64 {
        match kind {
            AssetKind::Audio => self.config.min_audio_bytes,
            AssetKind::Image => self.config.min_image_bytes,
        }
    }

    pub(crate) fn cached_ref(&self, path: PathBuf) -> MediaRef {
        MediaRef::Cached {
            uri: self.gateway.resolve_uri(&path),
            path,
        }
    }

    async fn fetch(&self, url: &str, key: &CacheKey) -> FlightOutcome {
        let path = self.path_for(key);
        let minimum = self.min_bytes(key.kind);

        if let Some(stat) = self.gateway.exists(&path).await
            && stat.size_bytes > minimum
        {
            tracing::debug!("Cache hit for {} at {:?}", url, path);
            self.metrics.record_hit();
            return Some(self.cached_ref(path));
        }

        self.metrics.record_miss();
        if !self.gateway.is_online() {
            tracing::debug!("Cache miss for {} while offline", url);
            return None;
        }

        let label = format!("download {url}");
        let stored = self
            .config
            .retry
            .run(&label, |attempt| {
                let path = &path;
                async move {
                    if attempt > 1 {
                        self.metrics.record_retry();
                    }
                    self.download_once(url, path, minimum, attempt).await
                }
            })
            .await?;

        self.metrics.record_download(stored);
        self.budget.enforce().await;
        Some(self.cached_ref(path))
    }

    /// One download attempt followed by the size check
    async fn download_once(
        &self,
        url: &str,
        path: &Path,
        minimum: u64,
        attempt: u32,
    ) -> Attempt<u64> {
        if !self.gateway.download(url, path).await {
            self.metrics.record_download_failure();
            if !self.gateway.is_online() {
                return Attempt::Abort;
            }
            return Attempt::Retry;
        }

        match self.gateway.exists(path).await {
            Some(stat) if stat.size_bytes > minimum => Attempt::Done(stat.size_bytes),
            stat => {
                let size = stat.map_or(0, |s| s.size_bytes);
                tracing::warn!(
                    "Attempt {} for {} wrote {} bytes to {:?}: {}",
                    attempt,
                    url,
                    size,
                    path,
                    CacheError::Undersized { size, minimum }
                );
                self.metrics.record_download_failure();
                self.gateway.delete(path).await;
                Attempt::RetryNow
            }
        }
    }
}

/// Offline-first media cache
#[derive(Clone)]
pub struct AssetCacheService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for AssetCacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCacheService")
            .field("cache_root", &self.inner.config.cache_root)
            .field("capability", &self.inner.capability)
            .field("in_flight", &self.inner.flights.in_flight())
            .finish_non_exhaustive()
    }
}

impl AssetCacheService {
    /// Service over the local filesystem, assuming the network is available
    pub fn new(config: MediaCacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a service with custom collaborators
    pub fn builder(config: MediaCacheConfig) -> AssetCacheServiceBuilder {
        AssetCacheServiceBuilder::new(config)
    }

    /// Return a local reference for `url`, downloading it on a miss
    ///
    /// Returns `None` when `url` is absent or empty, or when no valid file
    /// could be produced (offline miss, exhausted retries). Never fails.
    pub async fn ensure_cached(&self, url: Option<&str>, kind: AssetKind) -> Option<MediaRef> {
        let url = url.map(str::trim).filter(|u| !u.is_empty())?;

        if self.inner.capability == StorageCapability::PassThrough {
            self.inner.metrics.record_passthrough();
            return Some(MediaRef::Remote(url.to_string()));
        }

        let key = self.inner.addresser.key(url, kind);
        let flight_key = key.flight_key();
        let inner = Arc::clone(&self.inner);
        let url = url.to_string();

        self.inner
            .flights
            .run(&flight_key, move || async move { inner.fetch(&url, &key).await })
            .await
    }

    /// Location `url` would be cached at, if a valid file is already there
    ///
    /// Never touches the network.
    pub async fn cached_path(&self, url: &str, kind: AssetKind) -> Option<PathBuf> {
        let key = self.inner.addresser.key(url, kind);
        let path = self.inner.path_for(&key);
        let stat = self.inner.gateway.exists(&path).await?;
        (stat.size_bytes > self.inner.min_bytes(kind)).then_some(path)
    }

    /// Aggregate size of everything under the cache root
    pub async fn cache_size(&self) -> u64 {
        self.inner.budget.total_size().await
    }

    /// Run budget enforcement now
    pub async fn enforce_budget(&self) -> EvictionReport {
        self.inner.budget.enforce().await
    }

    /// Remove every cached image and recording; the repair log is kept
    ///
    /// Returns the number of bytes freed.
    pub async fn clear_cache(&self) -> Result<u64> {
        let before = self.cache_size().await;

        for kind in AssetKind::all() {
            let dir = self.inner.config.cache_root.join(kind.dir_name());
            if !self.inner.gateway.remove_dir(&dir).await
                && !self.inner.gateway.list_dir(&dir).await.is_empty()
            {
                return Err(CacheError::Io(std::io::Error::other(format!(
                    "could not remove {}",
                    dir.display()
                ))));
            }
        }

        let freed = before.saturating_sub(self.cache_size().await);
        tracing::info!("Cleared media cache, freed {} bytes", freed);
        Ok(freed)
    }

    /// Verifier over `catalog` sharing this service's storage and flights
    pub fn verifier(&self, catalog: Arc<dyn Catalog>, scope: VerifyScope) -> IntegrityVerifier {
        IntegrityVerifier::new(Arc::clone(&self.inner), catalog, scope)
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.snapshot()
    }

    /// Repair log under the cache root
    pub fn repair_log(&self) -> &RepairLog {
        &self.inner.repair_log
    }

    /// Active configuration
    pub fn config(&self) -> &MediaCacheConfig {
        &self.inner.config
    }

    /// Storage capability resolved at construction
    pub fn capability(&self) -> StorageCapability {
        self.inner.capability
    }

    /// Connectivity source
    pub fn connectivity(&self) -> Arc<dyn Connectivity> {
        Arc::clone(self.inner.gateway.connectivity())
    }

    /// Number of assets currently being fetched
    pub fn in_flight(&self) -> usize {
        self.inner.flights.in_flight()
    }
}

/// Builder for [`AssetCacheService`]
pub struct AssetCacheServiceBuilder {
    config: MediaCacheConfig,
    storage: Option<Arc<dyn Storage>>,
    connectivity: Option<Arc<dyn Connectivity>>,
    capability: StorageCapability,
    hash_strategy: Option<HashStrategy>,
    client: Option<reqwest::Client>,
}

impl AssetCacheServiceBuilder {
    /// Builder with local storage, an online monitor and detected hashing
    pub fn new(config: MediaCacheConfig) -> Self {
        Self {
            config,
            storage: None,
            connectivity: None,
            capability: StorageCapability::Durable,
            hash_strategy: None,
            client: None,
        }
    }

    /// Use a specific storage backend
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use a specific connectivity source
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Set the storage capability
    #[must_use]
    pub fn with_capability(mut self, capability: StorageCapability) -> Self {
        self.capability = capability;
        self
    }

    /// Force a hashing strategy instead of detecting one
    #[must_use]
    pub fn with_hash_strategy(mut self, strategy: HashStrategy) -> Self {
        self.hash_strategy = Some(strategy);
        self
    }

    /// Use a preconfigured HTTP client
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Validate the configuration and assemble the service
    pub fn build(self) -> Result<AssetCacheService> {
        self.config.validate()?;

        let client = match self.client {
            Some(client) => client,
            None => build_client(&self.config.http)?,
        };
        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(LocalStorage::new()),
        };
        let connectivity: Arc<dyn Connectivity> = match self.connectivity {
            Some(connectivity) => connectivity,
            None => Arc::new(ConnectivityMonitor::online()),
        };
        let addresser = self
            .hash_strategy
            .map_or_else(ContentAddresser::detect, ContentAddresser::new);

        let gateway = Arc::new(FilesystemGateway::new(
            storage,
            connectivity,
            client,
            self.config.max_download_bytes,
        ));
        let metrics = Arc::new(CacheMetrics::new());
        let budget = Arc::new(StorageBudgetEnforcer::new(
            Arc::clone(&gateway),
            &self.config.cache_root,
            self.config.max_cache_bytes,
            Arc::clone(&metrics),
        ));
        let repair_log = RepairLog::new(Arc::clone(&gateway), &self.config.cache_root);

        tracing::debug!(
            "Media cache at {:?} ({:?}, {:?} hashing, {} byte budget)",
            self.config.cache_root,
            self.capability,
            addresser.strategy(),
            self.config.max_cache_bytes
        );

        Ok(AssetCacheService {
            inner: Arc::new(ServiceInner {
                config: self.config,
                addresser,
                gateway,
                budget,
                flights: Arc::new(SingleFlight::new()),
                metrics,
                repair_log,
                capability: self.capability,
            }),
        })
    }
}
