//! HTTP transport construction
//!
//! Media downloads have no request timeout by default: the per-download byte
//! ceiling is the only bound, and recordings can take minutes on slow links.

use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// HTTP client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout
    pub connect_timeout: Duration,

    /// Whole-request timeout; `None` leaves it to the platform
    pub request_timeout: Option<Duration>,

    /// Connection pool idle timeout
    pub pool_idle_timeout: Duration,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            pool_idle_timeout: Duration::from_secs(30),
            user_agent: concat!("aviary-cache/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Build a reqwest client from `config`
pub fn build_client(config: &HttpConfig) -> Result<Client> {
    // reqwest is built without a bundled crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut builder = ClientBuilder::new()
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.pool_idle_timeout)
        .redirect(reqwest::redirect::Policy::limited(5))
        .user_agent(config.user_agent.clone());

    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.request_timeout.is_none());
        assert!(config.user_agent.starts_with("aviary-cache/"));
    }

    #[test]
    fn test_build_client_with_timeout() {
        let config = HttpConfig {
            request_timeout: Some(Duration::from_secs(5)),
            ..HttpConfig::default()
        };
        assert!(build_client(&config).is_ok());
    }
}
