//! Offline-first media cache for field-guide catalogs
//!
//! This crate persists remote images and bird-call recordings to local storage
//! so they stay available without a network. It deduplicates concurrent
//! requests for the same asset, keeps the cache under a storage budget, and
//! verifies and repairs the local copy against a catalog of expected assets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │      AssetCacheService       │   │    IntegrityVerifier     │
//! │  ensure_cached(url, kind)    │   │  verify(on_progress)     │
//! └──────────────────────────────┘   └──────────────────────────┘
//!        │            │                   │              │
//!        │   ┌─────────────────┐          │      ┌──────────────┐
//!        ├──▶│  SingleFlight   │◀─────────┤      │   Catalog    │
//!        │   └─────────────────┘          │      └──────────────┘
//!        │   ┌─────────────────┐          │
//!        ├──▶│ ContentAddresser│◀─────────┤
//!        │   └─────────────────┘          │
//!        │   ┌─────────────────────────┐  │
//!        ├──▶│ StorageBudgetEnforcer   │◀─┤
//!        │   └─────────────────────────┘  │
//!        ▼                                ▼
//! ┌─────────────────────────────────────────────────┐
//! │               FilesystemGateway                 │
//! │   Storage (local fs / memory) + reqwest client  │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Layout on disk
//!
//! ```text
//! <cache-root>/images/<digest>.<jpg|jpeg|png|webp|svg>
//! <cache-root>/audio/<digest>.mp3
//! <cache-root>/logs/repair.log
//! ```
//!
//! The digest is the SHA-256 of the URL with query string and fragment
//! removed, so signed URLs for the same object share one file.
//!
//! # Usage
//!
//! ```rust,no_run
//! use aviary_cache::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<()> {
//! let service = AssetCacheService::new(MediaCacheConfig::from_env()?)?;
//!
//! if let Some(media) = service
//!     .ensure_cached(Some("https://cdn.example/calls/robin.mp3?token=abc"), AssetKind::Audio)
//!     .await
//! {
//!     println!("play {}", media.uri());
//! }
//!
//! let catalog = Arc::new(JsonCatalog::new("catalog.json"));
//! let summary = service
//!     .verifier(catalog, VerifyScope::Audio)
//!     .verify(|p| println!("{}/{} checked", p.checked, p.total))
//!     .await?;
//! println!("{} of {} present", summary.completed, summary.total);
//! # Ok(())
//! # }
//! ```
//!
//! # Failure handling
//!
//! Expected failures never escape the per-asset API: offline misses,
//! HTTP errors, oversized bodies and exhausted retries all end in `None`.
//! Only construction, catalog loading and cache clearing return errors.

#![warn(missing_docs)]
#![allow(clippy::return_self_not_must_use)] // Builder patterns

pub mod address;
pub mod budget;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod gateway;
pub mod repair_log;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod single_flight;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod verify;

// Re-export main types
pub use address::{AssetKind, CacheKey, ContentAddresser, HashStrategy};
pub use budget::{EvictionReport, StorageBudgetEnforcer};
pub use catalog::{Catalog, ExpectedAsset, InMemoryCatalog, JsonCatalog};
pub use config::MediaCacheConfig;
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use error::{CacheError, Result};
pub use gateway::{DownloadMode, FilesystemGateway};
pub use repair_log::{RepairAction, RepairLog};
pub use retry::RetryPolicy;
pub use scheduler::RepairScheduler;
pub use service::{AssetCacheService, AssetCacheServiceBuilder, MediaRef, StorageCapability};
pub use single_flight::SingleFlight;
pub use stats::CacheStats;
pub use storage::{LocalStorage, MemoryStorage, Storage};
pub use transport::HttpConfig;
pub use verify::{
    IntegrityVerifier, VerificationPhase, VerificationProgress, VerificationSummary, VerifyScope,
};

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits

    pub use crate::{
        address::{AssetKind, HashStrategy},
        catalog::{Catalog, ExpectedAsset, InMemoryCatalog, JsonCatalog},
        config::MediaCacheConfig,
        connectivity::{Connectivity, ConnectivityMonitor},
        error::{CacheError, Result},
        retry::RetryPolicy,
        scheduler::RepairScheduler,
        service::{AssetCacheService, MediaRef, StorageCapability},
        stats::CacheStats,
        storage::{LocalStorage, MemoryStorage, Storage},
        verify::{VerificationPhase, VerificationProgress, VerificationSummary, VerifyScope},
    };
}
