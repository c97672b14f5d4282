//! IPFS adapter: gateway fan-out, result cache and optional pinning.

use super::cache::TtlCache;
use super::http::HttpAdapter;
use crate::uri::ipfs;
use crate::utils::error::{MetadataIndexerError, Result};
use futures_util::future::join_all;
use rand::seq::SliceRandom;

/// Fetches `ipfs://` links through a shuffled list of gateways.
pub struct IpfsAdapter {
    gateways: Vec<String>,
    pinning: Vec<String>,
    http: HttpAdapter,
    cache: TtlCache,
}

impl IpfsAdapter {
    /// # Errors
    ///
    /// `EmptyIpfsGatewayList` when `gateways` is empty.
    pub fn new(
        gateways: Vec<String>,
        pinning: Vec<String>,
        http: HttpAdapter,
        cache: TtlCache,
    ) -> Result<Self> {
        if gateways.is_empty() {
            return Err(MetadataIndexerError::EmptyIpfsGatewayList);
        }
        let trim = |list: Vec<String>| -> Vec<String> {
            list.into_iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect()
        };
        Ok(Self {
            gateways: trim(gateways),
            pinning: trim(pinning),
            http,
            cache,
        })
    }

    #[must_use]
    pub fn matches(link: &str) -> bool {
        link.starts_with(ipfs::PREFIX)
    }

    /// Returns the document behind `link` from the first gateway that
    /// answers.
    ///
    /// # Errors
    ///
    /// `InvalidPrefix`/`InvalidCid` for malformed links, `NoIpfsResponse`
    /// when every gateway failed.
    pub async fn resolve(&self, link: &str) -> Result<Vec<u8>> {
        let parsed = ipfs::parse(link)?;
        let target = parsed.target();

        if let Some(body) = self.cache.get(&target) {
            tracing::debug!(cid = %parsed.cid, "IPFS cache hit");
            return Ok(body);
        }

        let mut order: Vec<&String> = self.gateways.iter().collect();
        order.shuffle(&mut rand::thread_rng());

        for gateway in order {
            let url = format!("{gateway}/ipfs/{target}");
            match self.http.fetch(&url).await {
                Ok(body) => {
                    self.cache.insert(target, body.clone());
                    self.pin(&parsed.cid, &body).await;
                    return Ok(body);
                }
                Err(e) => {
                    tracing::debug!(gateway = %gateway, cid = %parsed.cid, error = %e, "IPFS gateway failed");
                }
            }
        }

        Err(MetadataIndexerError::NoIpfsResponse(link.to_string()))
    }

    /// Pins `cid` and every CIDv0 mentioned in `body` on all pinning nodes.
    async fn pin(&self, cid: &str, body: &[u8]) {
        if self.pinning.is_empty() {
            return;
        }

        let mut cids = vec![cid.to_string()];
        for found in ipfs::find_cids(body) {
            if !cids.contains(&found) {
                cids.push(found);
            }
        }

        let requests = self.pinning.iter().flat_map(|node| {
            cids.iter().map(move |cid| async move {
                let url = format!("{node}/api/v0/pin/add?arg={cid}");
                match self.http.client().post(&url).send().await {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!(node = %node, cid = %cid, "Pinned");
                    }
                    Ok(response) => {
                        tracing::warn!(node = %node, cid = %cid, status = %response.status(), "IPFS pin failed");
                    }
                    Err(e) => {
                        tracing::warn!(node = %node, cid = %cid, error = %e, "IPFS pin failed");
                    }
                }
            })
        });
        join_all(requests).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CID: &str = "QmbKA3HwmbJ1zrPWB2Xn4RSh8qTo7YYbPWufUHi7ovx8Gq";
    const INNER_CID: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

    fn adapter(gateways: Vec<String>, pinning: Vec<String>) -> IpfsAdapter {
        let http = HttpAdapter::new(Duration::from_secs(5), 1 << 20, true).unwrap();
        IpfsAdapter::new(gateways, pinning, http, TtlCache::default()).unwrap()
    }

    #[test]
    fn test_empty_gateway_list() {
        let http = HttpAdapter::new(Duration::from_secs(5), 1024, true).unwrap();
        assert!(matches!(
            IpfsAdapter::new(vec![], vec![], http, TtlCache::default()),
            Err(MetadataIndexerError::EmptyIpfsGatewayList)
        ));
    }

    #[tokio::test]
    async fn test_falls_through_failing_gateways() {
        let bad = MockServer::start().await;
        let good = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&bad)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/ipfs/{CID}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"name":"X"}"#))
            .mount(&good)
            .await;

        let ipfs = adapter(vec![bad.uri(), format!("{}/", good.uri())], vec![]);
        let body = ipfs.resolve(&format!("ipfs://{CID}")).await.unwrap();
        assert_eq!(body, br#"{"name":"X"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_no_response_when_all_gateways_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let ipfs = adapter(vec![server.uri(), server.uri()], vec![]);
        let err = ipfs.resolve(&format!("ipfs://{CID}")).await.unwrap_err();
        assert!(matches!(err, MetadataIndexerError::NoIpfsResponse(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_results_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let ipfs = adapter(vec![server.uri()], vec![]);
        let link = format!("ipfs://{CID}");
        ipfs.resolve(&link).await.unwrap();
        ipfs.resolve(&link).await.unwrap();
    }

    #[tokio::test]
    async fn test_pins_document_and_referenced_cids() {
        let gateway = MockServer::start().await;
        let node = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!(r#"{{"artifactUri":"ipfs://{INNER_CID}"}}"#)),
            )
            .mount(&gateway)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/add"))
            .and(query_param("arg", CID))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&node)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/add"))
            .and(query_param("arg", INNER_CID))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&node)
            .await;

        let ipfs = adapter(vec![gateway.uri()], vec![node.uri()]);
        // A failing pin never fails the resolution.
        assert!(ipfs.resolve(&format!("ipfs://{CID}")).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_cid() {
        let ipfs = adapter(vec!["http://127.0.0.1:1".into()], vec![]);
        assert!(matches!(
            ipfs.resolve("ipfs://invalid").await,
            Err(MetadataIndexerError::InvalidCid(_))
        ));
    }
}
