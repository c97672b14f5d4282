//! HTTP(S) fetching with a size cap and an address guard.

use crate::uri;
use crate::utils::error::{MetadataIndexerError, Result};
use reqwest::redirect::{Attempt, Policy};
use reqwest::StatusCode;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use url::Host;

const MAX_REDIRECTS: usize = 5;

/// Whether `ip` is loopback, private, link-local or otherwise reserved.
#[must_use]
pub fn is_restricted(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_restricted_v4(v4),
        IpAddr::V6(v6) => is_restricted_v6(v6),
    }
}

fn is_restricted_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || ip.is_multicast()
        || a == 0
        || a >= 240
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
        // 192.0.0.0/24 protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
}

fn is_restricted_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_restricted_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

fn forbidden(ip: IpAddr, link: &str) -> MetadataIndexerError {
    MetadataIndexerError::HttpRequest(format!("forbidden address {ip}: {link}"))
}

/// Rejects URLs whose host is, or resolves to, a restricted address.
///
/// # Errors
///
/// `InvalidPrefix`/`InvalidUri` for malformed links, `HttpRequest` for
/// restricted or unresolvable hosts.
pub async fn validate_url(link: &str) -> Result<()> {
    let url = uri::http::parse(link)?;
    let port = url.port_or_known_default().unwrap_or(80);

    match url.host() {
        Some(Host::Ipv4(ip)) if is_restricted_v4(ip) => Err(forbidden(IpAddr::V4(ip), link)),
        Some(Host::Ipv6(ip)) if is_restricted_v6(ip) => Err(forbidden(IpAddr::V6(ip), link)),
        Some(Host::Ipv4(_) | Host::Ipv6(_)) => Ok(()),
        Some(Host::Domain(domain)) => {
            let addrs = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| MetadataIndexerError::HttpRequest(format!("{link}: {e}")))?;
            for addr in addrs {
                if is_restricted(addr.ip()) {
                    return Err(forbidden(addr.ip(), link));
                }
            }
            Ok(())
        }
        None => Err(MetadataIndexerError::InvalidUri(link.to_string())),
    }
}

fn redirect_policy(allow_private_networks: bool) -> Policy {
    Policy::custom(move |attempt: Attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        if !allow_private_networks {
            let literal = attempt
                .url()
                .host_str()
                .and_then(|h| h.trim_matches(['[', ']']).parse::<IpAddr>().ok());
            if literal.is_some_and(is_restricted) {
                return attempt.error("redirect to a forbidden address");
            }
        }
        attempt.follow()
    })
}

/// Plain HTTP(S) adapter.
#[derive(Clone)]
pub struct HttpAdapter {
    client: reqwest::Client,
    max_size: u64,
    allow_private_networks: bool,
}

impl HttpAdapter {
    /// # Errors
    ///
    /// `ConfigError` when the HTTP client cannot be built.
    pub fn new(timeout: Duration, max_size: u64, allow_private_networks: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect_policy(allow_private_networks))
            .user_agent(concat!("metadata-indexer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MetadataIndexerError::ConfigError(format!("http client: {e}")))?;

        Ok(Self {
            client,
            max_size,
            allow_private_networks,
        })
    }

    #[must_use]
    pub fn matches(link: &str) -> bool {
        uri::http::is_http(link)
    }

    /// Validates the target address and fetches `link`.
    ///
    /// # Errors
    ///
    /// See [`validate_url`] and [`HttpAdapter::fetch`].
    pub async fn resolve(&self, link: &str) -> Result<Vec<u8>> {
        if !self.allow_private_networks {
            validate_url(link).await?;
        }
        self.fetch(link).await
    }

    /// `GET url`, rejecting non-200 answers and bodies over the size cap.
    ///
    /// # Errors
    ///
    /// `HttpRequest` for transport failures, bad statuses and oversized bodies.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MetadataIndexerError::HttpRequest(format!("{url}: {e}")))?;

        if response.status() != StatusCode::OK {
            return Err(MetadataIndexerError::HttpRequest(format!(
                "{}: {url}",
                response.status()
            )));
        }

        if response.content_length().is_some_and(|len| len > self.max_size) {
            return Err(self.too_large(url));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| MetadataIndexerError::HttpRequest(format!("{url}: {e}")))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_size {
                return Err(self.too_large(url));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn too_large(&self, url: &str) -> MetadataIndexerError {
        MetadataIndexerError::HttpRequest(format!(
            "response exceeds {} bytes: {url}",
            self.max_size
        ))
    }

    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_validate_url_rejects_restricted_addresses() {
        for link in [
            "http://127.0.0.1:8080/meta.json",
            "http://10.0.0.1:80/",
            "http://192.0.2.1:8000/",
            "http://172.16.5.4/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]:8080/",
            "http://[::ffff:127.0.0.1]/",
            "http://100.64.0.1/",
        ] {
            assert!(validate_url(link).await.is_err(), "{link} must be rejected");
        }
    }

    #[tokio::test]
    async fn test_validate_url_accepts_public_addresses() {
        assert!(validate_url("https://8.8.8.8/").await.is_ok());
        assert!(validate_url("http://[2606:4700:4700::1111]/").await.is_ok());
    }

    #[tokio::test]
    #[ignore = "Requires DNS resolution"]
    async fn test_validate_url_accepts_public_hostnames() {
        assert!(validate_url("https://tezos.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_url_rejects_other_schemes() {
        assert!(matches!(
            validate_url("ftp://8.8.8.8/").await,
            Err(MetadataIndexerError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_is_restricted_edges() {
        assert!(!is_restricted("100.128.0.1".parse().unwrap()));
        assert!(is_restricted("100.127.255.255".parse().unwrap()));
        assert!(is_restricted("fd00::1".parse().unwrap()));
        assert!(is_restricted("fe80::1".parse().unwrap()));
        assert!(!is_restricted("1.1.1.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meta.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"name":"X"}"#))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new(Duration::from_secs(5), 1024, true).unwrap();
        let body = adapter
            .resolve(&format!("{}/meta.json", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, br#"{"name":"X"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_fetch_non_200_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new(Duration::from_secs(5), 1024, true).unwrap();
        let err = adapter.resolve(&server.uri()).await.unwrap_err();
        assert!(matches!(err, MetadataIndexerError::HttpRequest(ref m) if m.contains("404")));
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(2048)))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new(Duration::from_secs(5), 1024, true).unwrap();
        assert!(adapter.resolve(&server.uri()).await.is_err());
    }

    #[tokio::test]
    async fn test_private_networks_rejected_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(0)
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new(Duration::from_secs(5), 1024, false).unwrap();
        assert!(adapter.resolve(&server.uri()).await.is_err());
    }
}
