//! Link resolution.
//!
//! [`Resolver::resolve`] picks the first [`Adapter`] whose scheme matches
//! the link, fetches the payload and returns it as compact JSON. The
//! resolver never retries; callers classify errors with
//! [`MetadataIndexerError::is_retryable`].

pub mod cache;
pub mod http;
pub mod ipfs;
pub mod sha256;
pub mod tezos_storage;

use crate::config::Settings;
use crate::core::context::SharedContext;
use crate::utils::error::{MetadataIndexerError, Result};
use std::time::Duration;

pub use self::cache::TtlCache;
pub use self::http::{validate_url, HttpAdapter};
pub use self::ipfs::IpfsAdapter;
pub use self::sha256::Sha256Adapter;
pub use self::tezos_storage::TezosStorageAdapter;

/// Links shorter than this cannot carry a scheme and a target.
pub const MIN_LINK_LENGTH: usize = 7;

const MIB: u64 = 1024 * 1024;

/// Protocol adapters, tried in order.
pub enum Adapter {
    Ipfs(IpfsAdapter),
    TezosStorage(TezosStorageAdapter),
    Sha256(Sha256Adapter),
    Http(HttpAdapter),
}

impl Adapter {
    #[must_use]
    pub fn matches(&self, link: &str) -> bool {
        match self {
            Adapter::Ipfs(_) => IpfsAdapter::matches(link),
            Adapter::TezosStorage(_) => TezosStorageAdapter::matches(link),
            Adapter::Sha256(_) => Sha256Adapter::matches(link),
            Adapter::Http(_) => HttpAdapter::matches(link),
        }
    }

    /// # Errors
    ///
    /// Whatever the underlying adapter reports.
    pub async fn resolve(&self, network: &str, address: &str, link: &str) -> Result<Vec<u8>> {
        match self {
            Adapter::Ipfs(a) => a.resolve(link).await,
            Adapter::TezosStorage(a) => a.resolve(network, address, link).await,
            Adapter::Sha256(a) => a.resolve(link).await,
            Adapter::Http(a) => a.resolve(link).await,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Adapter::Ipfs(_) => "ipfs",
            Adapter::TezosStorage(_) => "tezos-storage",
            Adapter::Sha256(_) => "sha256",
            Adapter::Http(_) => "http",
        }
    }
}

/// Ordered adapter list.
pub struct Resolver {
    adapters: Vec<Adapter>,
}

impl Resolver {
    /// Builds the standard adapter chain from `settings`.
    ///
    /// # Errors
    ///
    /// `EmptyIpfsGatewayList` without gateways, `ConfigError` when an HTTP
    /// client cannot be built.
    pub fn new(settings: &Settings, context: SharedContext) -> Result<Self> {
        let max_size = settings.http_max_file_size_mb.saturating_mul(MIB);
        let http = HttpAdapter::new(
            Duration::from_secs(settings.http_timeout),
            max_size,
            settings.allow_private_networks,
        )?;
        let ipfs_http = HttpAdapter::new(
            Duration::from_secs(settings.ipfs_timeout),
            max_size,
            settings.allow_private_networks,
        )?;

        Ok(Self::with_adapters(vec![
            Adapter::Ipfs(IpfsAdapter::new(
                settings.ipfs_gateways.clone(),
                settings.ipfs_pinning.clone(),
                ipfs_http,
                TtlCache::default(),
            )?),
            Adapter::TezosStorage(TezosStorageAdapter::new(context)),
            Adapter::Sha256(Sha256Adapter::new(
                http.clone(),
                settings.sha256_expected_hash.clone(),
            )),
            Adapter::Http(http),
        ]))
    }

    #[must_use]
    pub fn with_adapters(adapters: Vec<Adapter>) -> Self {
        Self { adapters }
    }

    /// Fetches `link` and returns the payload as compact JSON.
    ///
    /// # Errors
    ///
    /// `UnknownStorageType` for short links or unknown schemes,
    /// `InvalidJson` for non-JSON payloads, adapter errors otherwise.
    pub async fn resolve(&self, network: &str, address: &str, link: &str) -> Result<Vec<u8>> {
        if link.len() < MIN_LINK_LENGTH {
            return Err(MetadataIndexerError::UnknownStorageType(link.to_string()));
        }

        let adapter = self
            .adapters
            .iter()
            .find(|a| a.matches(link))
            .ok_or_else(|| MetadataIndexerError::UnknownStorageType(link.to_string()))?;

        let body = adapter.resolve(network, address, link).await?;
        compact(&body)
    }
}

/// Validates `data` as UTF-8 JSON and re-encodes it without whitespace.
///
/// # Errors
///
/// `InvalidJson` when `data` is not UTF-8 or not JSON.
pub fn compact(data: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(data)
        .map_err(|e| MetadataIndexerError::InvalidJson(format!("not UTF-8: {e}")))?;
    let value: serde_json::Value = serde_json::from_str(text.trim_start_matches('\u{feff}'))?;
    Ok(serde_json::to_vec(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver(gateway: &str) -> Resolver {
        let mut settings = Settings::new(vec![gateway.to_string()]);
        settings.allow_private_networks = true;
        Resolver::new(&settings, Context::new().shared()).unwrap()
    }

    #[test]
    fn test_compact() {
        assert_eq!(
            compact(b"{ \"name\" : \"X\",\n  \"tags\": [1, 2] }").unwrap(),
            br#"{"name":"X","tags":[1,2]}"#.to_vec()
        );
        assert!(matches!(compact(b"<html>"), Err(MetadataIndexerError::InvalidJson(_))));
        assert!(matches!(compact(&[0xff, 0xfe]), Err(MetadataIndexerError::InvalidJson(_))));
    }

    #[tokio::test]
    async fn test_short_and_unknown_links() {
        let r = resolver("http://127.0.0.1:1");
        assert!(matches!(
            r.resolve("mainnet", "KT1", "ipfs:/").await,
            Err(MetadataIndexerError::UnknownStorageType(_))
        ));
        assert!(matches!(
            r.resolve("mainnet", "KT1", "ftp://example.com/x.json").await,
            Err(MetadataIndexerError::UnknownStorageType(_))
        ));
    }

    #[tokio::test]
    async fn test_http_payload_is_compacted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\n  \"name\": \"X\"\n}"))
            .mount(&server)
            .await;

        let body = resolver(&server.uri())
            .resolve("mainnet", "KT1", &format!("{}/meta.json", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, br#"{"name":"X"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_non_json_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = resolver(&server.uri())
            .resolve("mainnet", "KT1", &format!("{}/x", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataIndexerError::InvalidJson(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_adapter_order() {
        let r = resolver("http://127.0.0.1:1");
        let names: Vec<&str> = r.adapters.iter().map(Adapter::name).collect();
        assert_eq!(names, vec!["ipfs", "tezos-storage", "sha256", "http"]);
        assert!(r.adapters[0].matches("ipfs://x"));
        assert!(r.adapters[3].matches("https://tezos.com"));
    }
}
