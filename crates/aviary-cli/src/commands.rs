//! Subcommand handlers

use anyhow::{Context as _, bail};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aviary_cache::{
    AssetCacheService, AssetKind, ConnectivityMonitor, JsonCatalog, MediaCacheConfig, MediaRef,
    RepairScheduler, VerificationProgress, VerificationSummary, VerifyScope,
};

use crate::OutputFormat;

/// Shared state for one CLI invocation
pub struct Context {
    service: AssetCacheService,
    monitor: ConnectivityMonitor,
    format: OutputFormat,
}

impl Context {
    pub fn new(
        config: MediaCacheConfig,
        offline: bool,
        format: OutputFormat,
    ) -> anyhow::Result<Self> {
        let monitor = ConnectivityMonitor::new(!offline);
        let service = AssetCacheService::builder(config)
            .with_connectivity(Arc::new(monitor.clone()))
            .build()
            .context("Failed to open media cache")?;
        Ok(Self {
            service,
            monitor,
            format,
        })
    }

    fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

fn scope(all_kinds: bool) -> VerifyScope {
    if all_kinds {
        VerifyScope::All
    } else {
        VerifyScope::Audio
    }
}

#[allow(clippy::cast_precision_loss)] // Display only
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn report_progress(progress: &VerificationProgress) {
    tracing::debug!(
        "{}/{} checked, {} missing, {} downloading, {} completed",
        progress.checked,
        progress.total,
        progress.missing,
        progress.downloading,
        progress.completed
    );
}

fn print_summary(ctx: &Context, summary: &VerificationSummary) -> anyhow::Result<()> {
    match ctx.format {
        OutputFormat::Json => Context::print_json(&serde_json::to_value(summary)?),
        OutputFormat::Text => {
            println!(
                "{}/{} verified, {} repaired, {} missing{}",
                summary.completed,
                summary.total,
                summary.repaired,
                summary.missing,
                if summary.offline { " (offline)" } else { "" }
            );
            Ok(())
        }
    }
}

pub async fn fetch(ctx: &Context, url: &str, kind: AssetKind) -> anyhow::Result<()> {
    let Some(media) = ctx.service.ensure_cached(Some(url), kind).await else {
        bail!("{url} is not available offline and could not be downloaded");
    };

    match ctx.format {
        OutputFormat::Json => {
            let path = match &media {
                MediaRef::Cached { path, .. } => Some(path.display().to_string()),
                MediaRef::Remote(_) => None,
            };
            Context::print_json(&json!({
                "uri": media.uri(),
                "path": path,
                "cached": media.is_cached(),
                "stats": ctx.service.stats(),
            }))
        }
        OutputFormat::Text => {
            println!("{}", media.uri());
            Ok(())
        }
    }
}

pub async fn verify(ctx: &Context, catalog: PathBuf, all_kinds: bool) -> anyhow::Result<()> {
    let verifier = ctx
        .service
        .verifier(Arc::new(JsonCatalog::new(catalog)), scope(all_kinds));
    let summary = verifier
        .verify(report_progress)
        .await
        .context("Verification failed")?;
    print_summary(ctx, &summary)
}

pub async fn watch(
    ctx: &Context,
    catalog: PathBuf,
    probe: &str,
    interval: u64,
    all_kinds: bool,
) -> anyhow::Result<()> {
    let verifier = ctx
        .service
        .verifier(Arc::new(JsonCatalog::new(catalog)), scope(all_kinds));
    let scheduler = Arc::new(RepairScheduler::new(verifier));

    // Probe before subscribing so a reachable network starts with one pass
    let online = probe_reachable(probe).await;
    ctx.monitor.set_connected(online);
    if online && let Some(result) = scheduler.try_run(report_progress).await {
        print_summary(ctx, &result.context("Verification failed")?)?;
    }

    let watcher = Arc::clone(&scheduler).watch_connectivity(ctx.service.connectivity());
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));

    tracing::info!("Watching connectivity via {} every {}s", probe, interval.max(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ctx.monitor.set_connected(probe_reachable(probe).await);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping watcher");
                break;
            }
        }
    }

    watcher.abort();
    if let Some(summary) = scheduler.last_summary() {
        print_summary(ctx, &summary)?;
    }
    Ok(())
}

async fn probe_reachable(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(5), tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

pub async fn size(ctx: &Context) -> anyhow::Result<()> {
    let bytes = ctx.service.cache_size().await;
    let ceiling = ctx.service.config().max_cache_bytes;
    match ctx.format {
        OutputFormat::Json => Context::print_json(&json!({
            "cache_root": ctx.service.config().cache_root,
            "bytes": bytes,
            "max_bytes": ceiling,
        })),
        OutputFormat::Text => {
            println!(
                "{} of {} used in {}",
                format_bytes(bytes),
                format_bytes(ceiling),
                ctx.service.config().cache_root.display()
            );
            Ok(())
        }
    }
}

pub async fn clear(ctx: &Context) -> anyhow::Result<()> {
    let freed = ctx.service.clear_cache().await.context("Failed to clear cache")?;
    match ctx.format {
        OutputFormat::Json => Context::print_json(&json!({ "freed_bytes": freed })),
        OutputFormat::Text => {
            println!("Freed {}", format_bytes(freed));
            Ok(())
        }
    }
}

pub async fn log(ctx: &Context) -> anyhow::Result<()> {
    let entries = ctx.service.repair_log().entries().await;
    match ctx.format {
        OutputFormat::Json => Context::print_json(&json!(entries)),
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No repairs recorded in {}", ctx.service.repair_log().path().display());
            }
            for entry in entries {
                println!("{entry}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(500 * 1024 * 1024), "500.0 MiB");
    }

    #[test]
    fn test_scope_flag() {
        assert_eq!(scope(false), VerifyScope::Audio);
        assert_eq!(scope(true), VerifyScope::All);
    }
}
