//! Cache integrity verification and repair
//!
//! One pass walks every non-deleted catalog row in scope, sequentially:
//!
//! 1. Stat the expected file. A file of plausible size with a recognised
//!    header counts as completed.
//! 2. Anything else counts as missing. Offline, the entry stays missing.
//!    Online, the entry is checked again under its flight key; a bad file
//!    still there is deleted and logged, then the asset is re-downloaded
//!    with the service's retry policy. Expected sizes at or above the
//!    streaming threshold (or unknown) take the streaming path.
//! 3. Budget enforcement runs after every recovery attempt.
//!
//! Recovery goes through the service's single-flight registry, so a repair
//! and a concurrent `ensure_cached` for the same asset share one download.
//! Overlapping passes are not prevented here; see
//! [`RepairScheduler`](crate::scheduler::RepairScheduler).

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::address::{AssetKind, CacheKey};
use crate::catalog::Catalog;
use crate::error::Result;
use crate::gateway::DownloadMode;
use crate::repair_log::RepairAction;
use crate::retry::Attempt;
use crate::service::{FlightOutcome, ServiceInner};

/// Bytes read from the start of a file for header sniffing
pub const HEADER_PREFIX_LEN: usize = 64;

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Which catalog URLs a pass checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyScope {
    /// Recordings only
    #[default]
    Audio,
    /// Recordings and images
    All,
}

impl VerifyScope {
    /// Asset kinds covered
    pub const fn kinds(self) -> &'static [AssetKind] {
        match self {
            Self::Audio => &[AssetKind::Audio],
            Self::All => &[AssetKind::Audio, AssetKind::Image],
        }
    }
}

/// Stage of a verification pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPhase {
    /// Not started
    #[default]
    Idle,
    /// Reading the catalog
    Scanning,
    /// Checking local files
    Checking,
    /// Re-downloading a missing or corrupt entry
    Downloading,
    /// Pass finished
    Summarized,
}

/// Live counters reported while a pass runs
///
/// Every counter only grows during a pass. `missing` counts entries found
/// missing or corrupt, including ones later recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationProgress {
    /// Entries in scope
    pub total: usize,
    /// Entries whose local file has been inspected
    pub checked: usize,
    /// Entries found missing or corrupt
    pub missing: usize,
    /// Entries for which recovery was started
    pub downloading: usize,
    /// Entries with a valid local file
    pub completed: usize,
    /// Current stage
    pub phase: VerificationPhase,
}

/// Final counters of a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationSummary {
    /// Entries in scope
    pub total: usize,
    /// Entries left without a valid file; `completed + missing == total`
    pub missing: usize,
    /// Entries with a valid local file
    pub completed: usize,
    /// Entries restored by this pass
    pub repaired: usize,
    /// Whether the pass started without connectivity
    pub offline: bool,
}

#[derive(Debug)]
struct Entry {
    id: String,
    url: String,
    key: CacheKey,
    path: PathBuf,
}

/// Local state of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Valid,
    Absent,
    Undersized(u64),
    BadHeader,
}

impl Health {
    fn detail(self) -> String {
        match self {
            Self::Valid => "valid".to_string(),
            Self::Absent => "absent".to_string(),
            Self::Undersized(size) => format!("undersized ({size} bytes)"),
            Self::BadHeader => "unrecognized header".to_string(),
        }
    }
}

/// Whether `prefix` starts like a file of `kind`
pub fn sniff_header(kind: AssetKind, prefix: &[u8]) -> bool {
    match kind {
        AssetKind::Audio => {
            let frame_sync = prefix.len() >= 2 && prefix[0] == 0xFF && prefix[1] & 0xE0 == 0xE0;
            prefix.starts_with(b"ID3") || frame_sync
        }
        AssetKind::Image => {
            if prefix.starts_with(&[0xFF, 0xD8, 0xFF])
                || prefix.starts_with(PNG_SIGNATURE)
                || prefix.starts_with(b"GIF8")
                || (prefix.starts_with(b"RIFF") && prefix.get(8..12) == Some(b"WEBP".as_slice()))
            {
                return true;
            }
            let text = prefix.strip_prefix(UTF8_BOM).unwrap_or(prefix);
            let start = text.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(text.len());
            let text = &text[start..];
            text.starts_with(b"<svg") || text.starts_with(b"<?xml")
        }
    }
}

/// Checks the local cache against a catalog and repairs what it can
pub struct IntegrityVerifier {
    inner: Arc<ServiceInner>,
    catalog: Arc<dyn Catalog>,
    scope: VerifyScope,
}

impl std::fmt::Debug for IntegrityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityVerifier")
            .field("cache_root", &self.inner.config.cache_root)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl IntegrityVerifier {
    pub(crate) fn new(
        inner: Arc<ServiceInner>,
        catalog: Arc<dyn Catalog>,
        scope: VerifyScope,
    ) -> Self {
        Self {
            inner,
            catalog,
            scope,
        }
    }

    /// Scope of this verifier
    pub fn scope(&self) -> VerifyScope {
        self.scope
    }

    /// Run one pass, reporting counters through `on_progress`
    ///
    /// Only fails when the catalog cannot be read; per-entry failures end up
    /// in the `missing` count.
    pub async fn verify<F>(&self, mut on_progress: F) -> Result<VerificationSummary>
    where
        F: FnMut(&VerificationProgress) + Send,
    {
        let offline = !self.inner.gateway.is_online();
        let mut progress = VerificationProgress {
            phase: VerificationPhase::Scanning,
            ..VerificationProgress::default()
        };
        on_progress(&progress);

        let entries = self.entries().await?;
        progress.total = entries.len();
        progress.phase = VerificationPhase::Checking;
        on_progress(&progress);

        tracing::info!(
            "Verifying {} cached {:?} entries{}",
            entries.len(),
            self.scope,
            if offline { " (offline)" } else { "" }
        );

        let mut repaired = 0usize;

        for entry in &entries {
            let health = self.health(&entry.key, &entry.path).await;
            progress.checked += 1;

            if health == Health::Valid {
                tracing::debug!("{} {} is valid at {:?}", entry.key.kind, entry.id, entry.path);
                progress.completed += 1;
                on_progress(&progress);
                continue;
            }

            progress.missing += 1;
            on_progress(&progress);

            if !self.inner.gateway.is_online() {
                tracing::debug!("{} {} is {}, offline", entry.key.kind, entry.id, health.detail());
                continue;
            }

            progress.downloading += 1;
            progress.phase = VerificationPhase::Downloading;
            on_progress(&progress);

            if self.recover(entry).await {
                repaired += 1;
                progress.completed += 1;
            }
            progress.phase = VerificationPhase::Checking;
            on_progress(&progress);
        }

        progress.phase = VerificationPhase::Summarized;
        on_progress(&progress);

        let summary = VerificationSummary {
            total: progress.total,
            missing: progress.total - progress.completed,
            completed: progress.completed,
            repaired,
            offline,
        };
        tracing::info!(
            "Verification finished: {} of {} present, {} repaired, {} missing",
            summary.completed,
            summary.total,
            summary.repaired,
            summary.missing
        );

        Ok(summary)
    }

    async fn entries(&self) -> Result<Vec<Entry>> {
        let rows = self.catalog.expected_assets().await?;
        let mut entries = Vec::new();

        for row in rows.iter().filter(|row| !row.is_deleted()) {
            for &kind in self.scope.kinds() {
                let Some(url) = row.url_for(kind) else {
                    continue;
                };
                let key = self.inner.addresser.key(url, kind);
                entries.push(Entry {
                    id: row.id.clone(),
                    url: url.to_string(),
                    path: self.inner.path_for(&key),
                    key,
                });
            }
        }

        Ok(entries)
    }

    async fn health(&self, key: &CacheKey, path: &Path) -> Health {
        check_health(&self.inner, key.kind, path).await
    }

    async fn recover(&self, entry: &Entry) -> bool {
        let threshold = self.inner.config.streaming_threshold_bytes;
        let mode = match self.inner.gateway.content_length(&entry.url).await {
            Some(len) if len < threshold => DownloadMode::Buffered,
            _ => DownloadMode::Streaming,
        };

        let inner = Arc::clone(&self.inner);
        let url = entry.url.clone();
        let key = entry.key.clone();
        let outcome = self
            .inner
            .flights
            .run(&entry.key.flight_key(), move || async move {
                repair(&inner, &url, &key, mode).await
            })
            .await;

        // A joined flight may have validated against the service's looser minimum
        outcome.is_some() && self.health(&entry.key, &entry.path).await == Health::Valid
    }
}

async fn check_health(inner: &ServiceInner, kind: AssetKind, path: &Path) -> Health {
    let Some(stat) = inner.gateway.exists(path).await else {
        return Health::Absent;
    };
    let plausible = match kind {
        AssetKind::Audio => stat.size_bytes >= inner.config.verify_min_bytes,
        AssetKind::Image => stat.size_bytes > inner.config.min_image_bytes,
    };
    if !plausible {
        return Health::Undersized(stat.size_bytes);
    }
    match inner.gateway.read_prefix(path, HEADER_PREFIX_LEN).await {
        Some(prefix) if sniff_header(kind, &prefix) => Health::Valid,
        _ => Health::BadHeader,
    }
}

async fn discard(inner: &ServiceInner, url: &str, path: &Path, health: Health) {
    let detail = health.detail();
    tracing::info!("Removing {:?} for {}: {}", path, url, detail);
    inner.gateway.delete(path).await;
    inner
        .repair_log
        .record(RepairAction::Removed, url, path, &detail)
        .await;
}

/// Re-download one entry with retries, enforcing the budget after each attempt
///
/// Runs under the entry's flight key. The file is checked again first, since
/// another flight may have replaced it after the caller looked.
async fn repair(
    inner: &ServiceInner,
    url: &str,
    key: &CacheKey,
    mode: DownloadMode,
) -> FlightOutcome {
    let path = inner.path_for(key);
    match check_health(inner, key.kind, &path).await {
        Health::Valid => return Some(inner.cached_ref(path)),
        Health::Absent => {}
        health => discard(inner, url, &path, health).await,
    }

    let label = format!("repair {url}");

    let stored = inner
        .config
        .retry
        .run(&label, |attempt| {
            let path = &path;
            async move {
                if attempt > 1 {
                    inner.metrics.record_retry();
                }
                let outcome = repair_attempt(inner, url, key.kind, path, mode).await;
                inner.budget.enforce().await;
                outcome
            }
        })
        .await;

    match stored {
        Some(size) => {
            inner.metrics.record_download(size);
            inner.metrics.record_repair();
            inner
                .repair_log
                .record(RepairAction::Repaired, url, &path, &format!("{size} bytes"))
                .await;
            Some(inner.cached_ref(path))
        }
        None => {
            inner
                .repair_log
                .record(
                    RepairAction::Failed,
                    url,
                    &path,
                    &format!("gave up after {} attempts", inner.config.retry.max_attempts),
                )
                .await;
            None
        }
    }
}

async fn repair_attempt(
    inner: &ServiceInner,
    url: &str,
    kind: AssetKind,
    path: &Path,
    mode: DownloadMode,
) -> Attempt<u64> {
    if !inner.gateway.download_with(url, path, mode).await {
        inner.metrics.record_download_failure();
        if !inner.gateway.is_online() {
            return Attempt::Abort;
        }
        return Attempt::Retry;
    }

    match check_health(inner, kind, path).await {
        Health::Valid => inner
            .gateway
            .exists(path)
            .await
            .map_or(Attempt::RetryNow, |stat| Attempt::Done(stat.size_bytes)),
        health => {
            tracing::warn!("Re-downloaded {} is {}, discarding", url, health.detail());
            inner.metrics.record_download_failure();
            inner.gateway.delete(path).await;
            Attempt::RetryNow
        }
    }
}
