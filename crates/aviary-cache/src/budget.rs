//! Storage budget enforcement
//!
//! Images and audio share one pool under the cache root. When the aggregate
//! size exceeds the ceiling, files are deleted oldest-modification-first until
//! the remainder fits. The repair log and in-progress `.part` files count
//! towards the aggregate. The log is never evicted; a `.part` file becomes
//! a candidate once it has not been written for [`STALE_PARTIAL_AGE`].
//!
//! The aggregate and the candidates come from the same walk, so a file
//! committed concurrently is either in both or in neither.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::gateway::FilesystemGateway;
use crate::stats::CacheMetrics;
use crate::storage::is_partial;

/// Directory under the cache root that eviction never touches
pub const LOGS_DIR: &str = "logs";

/// Partial files untouched for this long are treated as abandoned
pub const STALE_PARTIAL_AGE: Duration = Duration::from_secs(60 * 60);

/// Outcome of one enforcement pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Aggregate size before eviction
    pub before_bytes: u64,
    /// Bytes removed
    pub freed_bytes: u64,
    /// Files removed
    pub evicted_files: usize,
    /// Aggregate size after eviction
    pub after_bytes: u64,
}

impl EvictionReport {
    /// Whether anything was deleted
    pub fn evicted(&self) -> bool {
        self.evicted_files > 0
    }
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// One walk of the cache root
#[derive(Debug, Default)]
struct Census {
    total: u64,
    candidates: Vec<Candidate>,
}

fn is_stale(now: SystemTime, modified: SystemTime) -> bool {
    now.duration_since(modified)
        .is_ok_and(|age| age >= STALE_PARTIAL_AGE)
}

/// Keeps the cache root under a byte ceiling
#[derive(Debug)]
pub struct StorageBudgetEnforcer {
    gateway: Arc<FilesystemGateway>,
    root: PathBuf,
    ceiling: u64,
    metrics: Arc<CacheMetrics>,
}

impl StorageBudgetEnforcer {
    /// Create an enforcer for `root`
    pub fn new(
        gateway: Arc<FilesystemGateway>,
        root: impl AsRef<Path>,
        ceiling: u64,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            gateway,
            root: root.as_ref().to_path_buf(),
            ceiling,
            metrics,
        }
    }

    /// Configured ceiling in bytes
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Sum of every file size under the root; unreadable paths count as zero
    pub async fn total_size(&self) -> u64 {
        self.census().await.total
    }

    /// Evict oldest files until the aggregate fits the ceiling
    ///
    /// Safe to call after every write; a pass under budget only walks the tree.
    pub async fn enforce(&self) -> EvictionReport {
        let Census {
            total: before,
            mut candidates,
        } = self.census().await;
        if before <= self.ceiling {
            return EvictionReport {
                before_bytes: before,
                after_bytes: before,
                ..EvictionReport::default()
            };
        }

        // Oldest first; path breaks ties so equal mtimes evict deterministically
        candidates.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut freed = 0u64;
        let mut evicted = 0usize;

        for candidate in candidates {
            if before.saturating_sub(freed) <= self.ceiling {
                break;
            }
            if self.gateway.delete(&candidate.path).await {
                tracing::debug!("Evicted {:?} ({} bytes)", candidate.path, candidate.size);
                freed += candidate.size;
                evicted += 1;
                self.metrics.record_eviction(candidate.size);
            } else {
                tracing::warn!("Could not evict {:?}, skipping", candidate.path);
            }
        }

        let report = EvictionReport {
            before_bytes: before,
            freed_bytes: freed,
            evicted_files: evicted,
            after_bytes: before.saturating_sub(freed),
        };

        if report.after_bytes > self.ceiling {
            tracing::warn!(
                "Cache still over budget after eviction: {} > {} bytes",
                report.after_bytes,
                self.ceiling
            );
        } else {
            tracing::info!(
                "Evicted {} files ({} bytes), cache now {} of {} bytes",
                evicted,
                freed,
                report.after_bytes,
                self.ceiling
            );
        }

        report
    }

    async fn census(&self) -> Census {
        let logs = self.root.join(LOGS_DIR);
        let now = SystemTime::now();
        let mut census = Census::default();
        // (directory, whether files below it may be evicted)
        let mut pending = vec![(self.root.clone(), true)];

        while let Some((dir, evictable)) = pending.pop() {
            for entry in self.gateway.list_dir(&dir).await {
                if entry.is_dir {
                    let evictable = evictable && entry.path != logs;
                    pending.push((entry.path, evictable));
                    continue;
                }
                let Some(stat) = self.gateway.exists(&entry.path).await else {
                    continue;
                };
                census.total += stat.size_bytes;
                if evictable && (!is_partial(&entry.path) || is_stale(now, stat.modified)) {
                    census.candidates.push(Candidate {
                        path: entry.path,
                        size: stat.size_bytes,
                        modified: stat.modified,
                    });
                }
            }
        }

        census
    }
}
