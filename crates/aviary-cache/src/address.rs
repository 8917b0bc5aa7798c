//! Content addressing for remote media URLs
//!
//! A cache key is a pure function of the normalized URL: query string and
//! fragment are dropped, then the remainder is hashed. Two URLs that differ
//! only in a signed token therefore land on the same file.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::path::PathBuf;
use url::Url;

/// Longest digest produced by [`HashStrategy::Encoded`]
pub const ENCODED_DIGEST_LEN: usize = 64;

/// Media classification; selects subdirectory and extension policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Photos and illustrations
    Image,
    /// Recordings
    Audio,
}

impl AssetKind {
    /// Subdirectory under the cache root
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Audio => "audio",
        }
    }

    /// Extension used when the URL does not carry an allowed one
    pub const fn default_extension(self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Audio => "mp3",
        }
    }

    /// Extensions kept verbatim from the source URL
    pub const fn allowed_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Image => &["jpg", "jpeg", "png", "webp", "svg"],
            Self::Audio => &["mp3"],
        }
    }

    /// Both kinds, in directory order
    pub const fn all() -> [Self; 2] {
        [Self::Image, Self::Audio]
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

impl std::str::FromStr for AssetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" | "images" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            other => Err(format!("unknown asset kind '{other}'")),
        }
    }
}

/// How URLs are turned into digests
///
/// Both strategies are deterministic per normalized URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashStrategy {
    /// Lowercase hex SHA-256
    #[default]
    Sha256,
    /// URL-safe base64 of the normalized URL, keeping the last
    /// [`ENCODED_DIGEST_LEN`] characters
    Encoded,
}

impl HashStrategy {
    /// Pick the strongest strategy available on this build
    pub fn detect() -> Self {
        Self::Sha256
    }

    fn digest(self, normalized: &str) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(normalized.as_bytes())),
            Self::Encoded => {
                let encoded = URL_SAFE_NO_PAD.encode(normalized.as_bytes());
                let start = encoded.len().saturating_sub(ENCODED_DIGEST_LEN);
                encoded[start..].to_string()
            }
        }
    }
}

/// Location of one cached asset relative to the cache root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Content address of the normalized URL
    pub digest: String,
    /// Asset kind
    pub kind: AssetKind,
    /// File extension without the dot
    pub extension: &'static str,
}

impl CacheKey {
    /// `<digest>.<ext>`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.digest, self.extension)
    }

    /// `<kind-dir>/<digest>.<ext>`
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.kind.dir_name()).join(self.file_name())
    }

    /// Key used for single-flight registration
    pub fn flight_key(&self) -> String {
        format!("{}/{}", self.kind.dir_name(), self.digest)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.dir_name(), self.file_name())
    }
}

/// Derives cache keys from remote URLs
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentAddresser {
    strategy: HashStrategy,
}

impl ContentAddresser {
    /// Create an addresser using `strategy`
    pub fn new(strategy: HashStrategy) -> Self {
        Self { strategy }
    }

    /// Create an addresser with the detected strategy
    pub fn detect() -> Self {
        Self::new(HashStrategy::detect())
    }

    /// Strategy in use
    pub fn strategy(&self) -> HashStrategy {
        self.strategy
    }

    /// Digest of the normalized `url`
    pub fn digest(&self, url: &str) -> String {
        self.strategy.digest(&normalize_url(url))
    }

    /// Full cache key for `url` as an asset of `kind`
    pub fn key(&self, url: &str, kind: AssetKind) -> CacheKey {
        CacheKey {
            digest: self.digest(url),
            kind,
            extension: extension_for(url, kind),
        }
    }
}

/// Strip query string and fragment from `url`
///
/// Unparsable input falls back to cutting at the first `?` or `#`.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    match Url::parse(trimmed) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.into()
        }
        Err(_) => trimmed
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

/// Extension for `url` from the kind's allow-list, or the kind's default
pub fn extension_for(url: &str, kind: AssetKind) -> &'static str {
    let path = Url::parse(url.trim()).map_or_else(
        |_| normalize_url(url),
        |parsed| parsed.path().to_string(),
    );

    let file_name = path.rsplit('/').next().unwrap_or_default();
    let Some((_, ext)) = file_name.rsplit_once('.') else {
        return kind.default_extension();
    };

    let ext = ext.to_ascii_lowercase();
    kind.allowed_extensions()
        .iter()
        .find(|allowed| **allowed == ext)
        .copied()
        .unwrap_or_else(|| kind.default_extension())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_strips_query_and_fragment() {
        assert_eq!(
            normalize_url("https://cdn.example/a.mp3?token=123#t=10"),
            "https://cdn.example/a.mp3"
        );
        assert_eq!(normalize_url("not a url?x=1"), "not a url");
        assert_eq!(normalize_url("relative/path.png#frag"), "relative/path.png");
    }

    #[test]
    fn test_sha256_digest_matches_normalized_url() {
        let addresser = ContentAddresser::new(HashStrategy::Sha256);
        let expected = hex::encode(Sha256::digest(b"https://cdn.example/a.mp3"));
        assert_eq!(addresser.digest("https://cdn.example/a.mp3?token=123"), expected);
        assert_eq!(expected.len(), 64);
        assert!(expected.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_encoded_digest_is_bounded_and_deterministic() {
        let addresser = ContentAddresser::new(HashStrategy::Encoded);
        let long = format!("https://cdn.example/{}.mp3?sig=abc", "x".repeat(300));
        let a = addresser.digest(&long);
        let b = addresser.digest(&long.replace("sig=abc", "sig=def"));
        assert_eq!(a, b);
        assert_eq!(a.len(), ENCODED_DIGEST_LEN);
        assert!(!a.contains('/'));
    }

    #[test]
    fn test_extension_policy() {
        assert_eq!(extension_for("https://x/a.PNG?w=10", AssetKind::Image), "png");
        assert_eq!(extension_for("https://x/a.webp", AssetKind::Image), "webp");
        assert_eq!(extension_for("https://x/a.gif", AssetKind::Image), "jpg");
        assert_eq!(extension_for("https://x/photo", AssetKind::Image), "jpg");
        assert_eq!(extension_for("https://x/a.wav", AssetKind::Audio), "mp3");
        assert_eq!(extension_for("::garbage::", AssetKind::Audio), "mp3");
        assert_eq!(extension_for("https://x.y/dir.d/file", AssetKind::Audio), "mp3");
    }

    #[test]
    fn test_cache_key_layout() {
        let key = ContentAddresser::default()
            .key("https://cdn.example/a.mp3?token=1", AssetKind::Audio);
        assert_eq!(
            key.relative_path(),
            PathBuf::from("audio").join(format!("{}.mp3", key.digest))
        );
        assert_eq!(key.flight_key(), format!("audio/{}", key.digest));
    }

    #[test]
    fn test_asset_kind_parse() {
        assert_eq!("Audio".parse::<AssetKind>(), Ok(AssetKind::Audio));
        assert_eq!("images".parse::<AssetKind>(), Ok(AssetKind::Image));
        assert!("video".parse::<AssetKind>().is_err());
    }

    proptest! {
        #[test]
        fn prop_digest_ignores_query_and_fragment(
            segment in "[a-z0-9]{1,16}",
            query_a in "[a-z0-9=&]{0,24}",
            query_b in "[a-z0-9=&]{0,24}",
            fragment in "[a-z0-9]{0,8}",
        ) {
            let base = format!("https://media.example.org/{segment}.mp3");
            for strategy in [HashStrategy::Sha256, HashStrategy::Encoded] {
                let addresser = ContentAddresser::new(strategy);
                let a = addresser.key(&format!("{base}?{query_a}"), AssetKind::Audio);
                let b = addresser.key(&format!("{base}?{query_b}#{fragment}"), AssetKind::Audio);
                prop_assert_eq!(&a, &b);
                prop_assert_eq!(a.relative_path(), b.relative_path());
            }
        }
    }
}
