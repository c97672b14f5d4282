//! Chain observer (TzKT) HTTP API client.

use crate::types::tzkt::{BigMapUpdate, Head};
use crate::utils::error::{MetadataIndexerError, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Default and maximum page size of the big-map updates endpoint.
pub const PAGE_SIZE: usize = 1000;

/// Query of `GET /v1/bigmaps/updates`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BigMapFilter {
    pub tags: Vec<String>,
    pub contracts: Vec<String>,
    /// Exclusive lower level bound, used for the first page.
    pub level_gt: Option<u64>,
    /// Inclusive upper level bound.
    pub level_le: u64,
    /// Id cursor, used once the first page has been read.
    pub offset_cr: Option<u64>,
    pub limit: usize,
}

impl BigMapFilter {
    fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("tags.any", self.tags.join(",")),
            ("action.in", "add_key,update_key".to_string()),
            ("limit", self.limit.to_string()),
            ("level.le", self.level_le.to_string()),
            ("sort.asc", "id".to_string()),
        ];
        match (self.offset_cr, self.level_gt) {
            (Some(cursor), _) => query.push(("offset.cr", cursor.to_string())),
            (None, Some(level)) => query.push(("level.gt", level.to_string())),
            (None, None) => {}
        }
        if !self.contracts.is_empty() {
            query.push(("contract.in", self.contracts.join(",")));
        }
        query
    }
}

/// Read-only TzKT API client.
#[derive(Clone)]
pub struct TzktClient {
    client: reqwest::Client,
    base_url: Url,
}

impl TzktClient {
    /// # Errors
    ///
    /// `ConfigError` when `base_url` is not an absolute URL.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| MetadataIndexerError::ConfigError(format!("tzkt url {base_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetadataIndexerError::ConfigError(format!("tzkt client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.endpoint(path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| MetadataIndexerError::ConnectionError(format!("{path}: {e}")))?;

        if !response.status().is_success() {
            return Err(MetadataIndexerError::ConnectionError(format!(
                "{path}: {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| MetadataIndexerError::DecodingError(format!("{path}: {e}")))
    }

    /// `GET /v1/head`
    ///
    /// # Errors
    ///
    /// `ConnectionError` or `DecodingError`.
    pub async fn head(&self) -> Result<Head> {
        self.get("v1/head", &[]).await
    }

    /// One page of `GET /v1/bigmaps/updates`.
    ///
    /// # Errors
    ///
    /// `ConnectionError` or `DecodingError`.
    pub async fn big_map_updates(&self, filter: &BigMapFilter) -> Result<Vec<BigMapUpdate>> {
        self.get("v1/bigmaps/updates", &filter.to_query()).await
    }

    /// WebSocket URL of the event hub (`/v1/events`).
    #[must_use]
    pub fn events_url(&self) -> String {
        let mut url = self.base_url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is always an accepted scheme change.
        let _ = url.set_scheme(scheme);
        format!("{}/v1/events", url.as_str().trim_end_matches('/'))
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_filter_query_first_page() {
        let filter = BigMapFilter {
            tags: vec!["token_metadata".into(), "metadata".into()],
            contracts: vec!["KT1A".into(), "KT1B".into()],
            level_gt: Some(10),
            level_le: 20,
            offset_cr: None,
            limit: PAGE_SIZE,
        };
        let query = filter.to_query();
        assert!(query.contains(&("tags.any", "token_metadata,metadata".to_string())));
        assert!(query.contains(&("level.gt", "10".to_string())));
        assert!(query.contains(&("contract.in", "KT1A,KT1B".to_string())));
        assert!(query.contains(&("sort.asc", "id".to_string())));
        assert!(!query.iter().any(|(k, _)| *k == "offset.cr"));
    }

    #[test]
    fn test_filter_query_uses_cursor_after_first_page() {
        let filter = BigMapFilter {
            level_gt: Some(10),
            offset_cr: Some(555),
            level_le: 20,
            limit: 2,
            ..BigMapFilter::default()
        };
        let query = filter.to_query();
        assert!(query.contains(&("offset.cr", "555".to_string())));
        assert!(!query.iter().any(|(k, _)| *k == "level.gt" || *k == "contract.in"));
    }

    #[test]
    fn test_events_url() {
        let client = TzktClient::new("https://api.tzkt.io/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.events_url(), "wss://api.tzkt.io/v1/events");
        let client = TzktClient::new("http://127.0.0.1:5000", Duration::from_secs(1)).unwrap();
        assert_eq!(client.events_url(), "ws://127.0.0.1:5000/v1/events");
    }

    #[tokio::test]
    async fn test_head_and_updates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/head"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"level": 42, "hash": "BL"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/bigmaps/updates"))
            .and(query_param("level.le", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": 1, "level": 40, "bigmap": 5,
                "contract": {"address": "KT1A"},
                "path": "metadata", "action": "add_key",
                "content": {"hash": "expr", "key": "", "value": "697066733a2f2f"}
            }])))
            .mount(&server)
            .await;

        let client = TzktClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(client.head().await.unwrap().level, 42);
        let updates = client
            .big_map_updates(&BigMapFilter {
                level_le: 42,
                limit: PAGE_SIZE,
                ..BigMapFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].contract.address, "KT1A");
    }

    #[tokio::test]
    async fn test_server_error_is_connection_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = TzktClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            client.head().await,
            Err(MetadataIndexerError::ConnectionError(_))
        ));
    }
}
