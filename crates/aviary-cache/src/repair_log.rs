//! Append-only repair log
//!
//! One line per action, space separated:
//! `<rfc3339 timestamp> <action> <url> <path> <detail>`. URLs are written
//! normalized, without query string or fragment, so signed tokens never reach
//! disk. The log lives under `<cache-root>/logs/` and survives `clear_cache`.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::address::normalize_url;
use crate::budget::LOGS_DIR;
use crate::gateway::FilesystemGateway;

/// File name of the repair log inside the logs directory
pub const REPAIR_LOG_FILE: &str = "repair.log";

/// Kind of action recorded in the repair log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// An existing file failed validation and was deleted
    Removed,
    /// A missing or removed entry was downloaded again
    Repaired,
    /// Recovery gave up after exhausting its attempts
    Failed,
}

impl RepairAction {
    /// Token written to the log
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Removed => "removed",
            Self::Repaired => "repaired",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writer and reader for `<root>/logs/repair.log`
#[derive(Debug, Clone)]
pub struct RepairLog {
    gateway: Arc<FilesystemGateway>,
    path: PathBuf,
}

impl RepairLog {
    /// Log stored under `cache_root`
    pub fn new(gateway: Arc<FilesystemGateway>, cache_root: &Path) -> Self {
        Self {
            gateway,
            path: cache_root.join(LOGS_DIR).join(REPAIR_LOG_FILE),
        }
    }

    /// Location of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry; failures are logged and otherwise ignored
    pub async fn record(&self, action: RepairAction, url: &str, path: &Path, detail: &str) {
        self.record_at(Utc::now(), action, url, path, detail).await;
    }

    async fn record_at(
        &self,
        at: DateTime<Utc>,
        action: RepairAction,
        url: &str,
        path: &Path,
        detail: &str,
    ) {
        let url = normalize_url(url);
        let line = format!(
            "{} {} {} {} {}\n",
            at.to_rfc3339_opts(SecondsFormat::Millis, true),
            action,
            url,
            path.display(),
            detail
        );
        if !self.gateway.append(&self.path, line.as_bytes()).await {
            tracing::warn!("Could not record {} of {} in repair log", action, url);
        }
    }

    /// All recorded lines, oldest first
    pub async fn entries(&self) -> Vec<String> {
        self.gateway
            .read(&self.path)
            .await
            .map(|data| {
                String::from_utf8_lossy(&data)
                    .lines()
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
