//! Expected-asset catalog
//!
//! The catalog is owned by the host application's database; the cache only
//! reads it. Rows carry soft-delete tombstones, and the verifier skips any row
//! with `deleted_at` set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::address::AssetKind;
use crate::error::{CacheError, Result};

/// One catalog row referencing remote media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedAsset {
    /// Row identifier
    pub id: String,

    /// Remote recording URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,

    /// Remote image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    /// Last modification of the row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Soft-delete marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ExpectedAsset {
    /// Row with an audio URL and no image
    pub fn audio(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            audio_url: Some(url.into()),
            image_url: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    /// Set the image URL
    #[must_use]
    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Mark the row deleted at `at`
    #[must_use]
    pub fn deleted(mut self, at: DateTime<Utc>) -> Self {
        self.deleted_at = Some(at);
        self
    }

    /// Whether the row carries a tombstone
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Non-empty URL for `kind`, if any
    pub fn url_for(&self, kind: AssetKind) -> Option<&str> {
        let url = match kind {
            AssetKind::Audio => self.audio_url.as_deref(),
            AssetKind::Image => self.image_url.as_deref(),
        };
        url.map(str::trim).filter(|u| !u.is_empty())
    }

    /// Check that the row is usable
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CacheError::InvalidCatalogRow {
                id: self.id.clone(),
                reason: "id cannot be empty".to_string(),
            });
        }
        for (field, url) in [("audio_url", &self.audio_url), ("image_url", &self.image_url)] {
            if let Some(url) = url
                && url.trim().contains(char::is_whitespace)
            {
                return Err(CacheError::InvalidCatalogRow {
                    id: self.id.clone(),
                    reason: format!("{field} contains whitespace"),
                });
            }
        }
        Ok(())
    }
}

/// Read-only source of expected assets
#[async_trait]
pub trait Catalog: Send + Sync {
    /// All rows, including tombstoned ones
    async fn expected_assets(&self) -> Result<Vec<ExpectedAsset>>;
}

/// Catalog held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    rows: Vec<ExpectedAsset>,
}

impl InMemoryCatalog {
    /// Catalog over `rows`
    pub fn new(rows: Vec<ExpectedAsset>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn expected_assets(&self) -> Result<Vec<ExpectedAsset>> {
        Ok(self.rows.clone())
    }
}

/// Catalog exported as a JSON array of rows
///
/// Re-read on every call so a running verifier sees the latest export.
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    /// Catalog backed by the file at `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Catalog for JsonCatalog {
    async fn expected_assets(&self) -> Result<Vec<ExpectedAsset>> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|source| CacheError::CatalogLoad {
                path: self.path.clone(),
                source,
            })?;

        let rows: Vec<ExpectedAsset> = serde_json::from_slice(&data)?;
        for row in &rows {
            row.validate()?;
        }

        tracing::debug!("Loaded {} catalog rows from {:?}", rows.len(), self.path);
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_url_for_ignores_blank_urls() {
        let row = ExpectedAsset::audio("1", "  ").with_image("https://cdn.example/a.jpg");
        assert_eq!(row.url_for(AssetKind::Audio), None);
        assert_eq!(row.url_for(AssetKind::Image), Some("https://cdn.example/a.jpg"));
    }

    #[tokio::test]
    async fn test_json_catalog_loads_rows() {
        let dir = TempDir::new().expect("Operation should succeed");
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "1", "audio_url": "https://cdn.example/1.mp3",
                 "updated_at": "2026-01-02T03:04:05Z"},
                {"id": "2", "image_url": "https://cdn.example/2.png"},
                {"id": "3", "audio_url": "https://cdn.example/3.mp3",
                 "deleted_at": "2026-02-01T00:00:00Z"}
            ]"#,
        )
        .expect("Operation should succeed");

        let rows = JsonCatalog::new(&path)
            .expected_assets()
            .await
            .expect("Operation should succeed");

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].url_for(AssetKind::Audio), Some("https://cdn.example/1.mp3"));
        assert!(rows[0].updated_at.is_some());
        assert_eq!(rows[1].audio_url, None);
        assert!(rows[2].is_deleted());
    }

    #[tokio::test]
    async fn test_json_catalog_errors() {
        let dir = TempDir::new().expect("Operation should succeed");

        let missing = JsonCatalog::new(dir.path().join("missing.json"));
        assert!(matches!(
            missing.expected_assets().await,
            Err(CacheError::CatalogLoad { .. })
        ));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"[{"id": ""}]"#).expect("Operation should succeed");
        assert!(matches!(
            JsonCatalog::new(&path).expected_assets().await,
            Err(CacheError::InvalidCatalogRow { .. })
        ));

        std::fs::write(&path, r#"[{"id": "9", "audio_url": "https://cdn.example/a b.mp3"}]"#)
            .expect("Operation should succeed");
        assert!(matches!(
            JsonCatalog::new(&path).expected_assets().await,
            Err(CacheError::InvalidCatalogRow { .. })
        ));

        std::fs::write(&path, "not json").expect("Operation should succeed");
        assert!(matches!(
            JsonCatalog::new(&path).expected_assets().await,
            Err(CacheError::Json(_))
        ));
    }
}
