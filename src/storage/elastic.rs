//! Document-search backend speaking the Elasticsearch REST API.
//!
//! One index per table. Documents get deterministic ids derived from their
//! primary key so repeated writes overwrite instead of duplicating. Writes
//! go through `_bulk` in batches of [`BULK_SIZE`] actions.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ContextAction, StorageBackend};
use crate::types::models::{
    ContextItem, ContractMetadata, IndexState, LevelChanges, Status, TokenMetadata,
};
use crate::utils::error::{MetadataIndexerError, Result};

/// Maximum number of actions per `_bulk` request.
pub const BULK_SIZE: usize = 1000;

const CONTRACT_INDEX: &str = "contract_metadata";
const TOKEN_INDEX: &str = "token_metadata";
const CONTEXT_INDEX: &str = "dipdup_metadata_context";
const STATE_INDEX: &str = "dipdup_state";

const INDICES: [&str; 4] = [CONTRACT_INDEX, TOKEN_INDEX, CONTEXT_INDEX, STATE_INDEX];

#[derive(Debug, Deserialize)]
struct SearchResponse<T> {
    hits: Hits<T>,
}

#[derive(Debug, Deserialize)]
struct Hits<T> {
    hits: Vec<Hit<T>>,
}

#[derive(Debug, Deserialize)]
struct Hit<T> {
    #[serde(rename = "_source")]
    source: T,
    #[serde(default)]
    sort: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct GetResponse<T> {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<T>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

/// One `_bulk` line pair.
enum BulkAction {
    /// Whole-document upsert that keeps `created_at` of an existing doc.
    Upsert { index: &'static str, id: String, doc: Value },
    /// Partial update of an existing document.
    Update { index: &'static str, id: String, doc: Value },
}

impl BulkAction {
    fn write_to(&self, out: &mut String) {
        let (header, body) = match self {
            BulkAction::Upsert { index, id, doc } => {
                let mut partial = doc.clone();
                if let Some(map) = partial.as_object_mut() {
                    map.remove("created_at");
                }
                (
                    json!({"update": {"_index": index, "_id": id}}),
                    json!({"doc": partial, "upsert": doc}),
                )
            }
            BulkAction::Update { index, id, doc } => (
                json!({"update": {"_index": index, "_id": id}}),
                json!({"doc": doc}),
            ),
        };
        out.push_str(&header.to_string());
        out.push('\n');
        out.push_str(&body.to_string());
        out.push('\n');
    }
}

fn contract_id(record: &ContractMetadata) -> String {
    format!("{}:{}", record.network, record.contract)
}

fn token_id(record: &TokenMetadata) -> String {
    format!("{}:{}:{}", record.network, record.contract, record.token_id)
}

/// Fields touched by a resolution update.
macro_rules! resolution_fields {
    ($r:expr) => {
        json!({
            "status": i16::from($r.status),
            "metadata": $r.metadata,
            "retry_count": $r.retry_count,
            "update_id": $r.update_id,
            "updated_at": $r.updated_at,
        })
    };
}

fn default_mapping(index: &str) -> Value {
    let properties = match index {
        CONTRACT_INDEX => json!({
            "network": {"type": "keyword"},
            "contract": {"type": "keyword"},
            "link": {"type": "keyword"},
            "status": {"type": "short"},
            "retry_count": {"type": "short"},
            "metadata": {"type": "object", "enabled": false},
            "update_id": {"type": "long"},
            "created_at": {"type": "date"},
            "updated_at": {"type": "date"}
        }),
        TOKEN_INDEX => json!({
            "network": {"type": "keyword"},
            "contract": {"type": "keyword"},
            "token_id": {"type": "unsigned_long"},
            "link": {"type": "keyword"},
            "status": {"type": "short"},
            "retry_count": {"type": "short"},
            "metadata": {"type": "object", "enabled": false},
            "image_processed": {"type": "boolean"},
            "update_id": {"type": "long"},
            "created_at": {"type": "date"},
            "updated_at": {"type": "date"}
        }),
        CONTEXT_INDEX => json!({
            "network": {"type": "keyword"},
            "contract": {"type": "keyword"},
            "key": {"type": "keyword"},
            "value": {"type": "keyword", "index": false, "doc_values": false}
        }),
        _ => json!({
            "index_name": {"type": "keyword"},
            "index_type": {"type": "keyword"},
            "level": {"type": "long"},
            "updated_at": {"type": "date"}
        }),
    };
    json!({"mappings": {"properties": properties}})
}

/// Elasticsearch storage backend.
pub struct ElasticStorage {
    client: reqwest::Client,
    hosts: Vec<String>,
    next_host: AtomicUsize,
    mappings_dir: PathBuf,
}

impl ElasticStorage {
    /// Creates a client for `hosts`, used round-robin.
    ///
    /// # Errors
    ///
    /// `ConfigError` when `hosts` is empty or the HTTP client cannot be built.
    pub fn new(
        hosts: Vec<String>,
        timeout_secs: u64,
        mappings_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        if hosts.is_empty() {
            return Err(MetadataIndexerError::ConfigError(
                "elastic backend requires at least one host".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| MetadataIndexerError::ConfigError(format!("elastic client: {e}")))?;

        Ok(Self {
            client,
            hosts: hosts
                .into_iter()
                .map(|h| h.trim_end_matches('/').to_string())
                .collect(),
            next_host: AtomicUsize::new(0),
            mappings_dir: mappings_dir.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        let idx = self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        format!("{}/{}", self.hosts[idx], path.trim_start_matches('/'))
    }

    fn mapping_for(&self, index: &str) -> Result<Value> {
        let path = self.mappings_dir.join(format!("{index}.json"));
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default_mapping(index)),
            Err(e) => Err(e.into()),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| MetadataIndexerError::BackendError(e.to_string()))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(MetadataIndexerError::BackendError(format!("{status}: {body}")))
    }

    async fn search<T: DeserializeOwned>(&self, index: &str, body: Value) -> Result<Vec<Hit<T>>> {
        let response = self
            .send(self.client.post(self.url(&format!("{index}/_search"))).json(&body))
            .await?;
        let response = Self::check(response).await?;
        let parsed: SearchResponse<T> = response
            .json()
            .await
            .map_err(|e| MetadataIndexerError::BackendError(format!("search response: {e}")))?;
        Ok(parsed.hits.hits)
    }

    async fn bulk(&self, actions: &[BulkAction]) -> Result<()> {
        for chunk in actions.chunks(BULK_SIZE) {
            let mut body = String::new();
            for action in chunk {
                action.write_to(&mut body);
            }

            let response = self
                .send(
                    self.client
                        .post(self.url("_bulk?refresh=wait_for"))
                        .header("Content-Type", "application/x-ndjson")
                        .body(body),
                )
                .await?;
            let response = Self::check(response).await?;
            let parsed: BulkResponse = response
                .json()
                .await
                .map_err(|e| MetadataIndexerError::BackendError(format!("bulk response: {e}")))?;

            if parsed.errors {
                let reason = parsed
                    .items
                    .iter()
                    .filter_map(|item| item.as_object()?.values().next()?.get("error").cloned())
                    .next()
                    .map_or_else(|| "unknown bulk error".to_string(), |e| e.to_string());
                return Err(MetadataIndexerError::BackendError(reason));
            }
        }
        Ok(())
    }

    async fn put_doc(&self, index: &str, id: &str, doc: Value) -> Result<()> {
        let url = self.url(&format!(
            "{index}/_doc/{}?refresh=wait_for",
            urlencoding::encode(id)
        ));
        let response = self.send(self.client.put(url).json(&doc)).await?;
        Self::check(response).await?;
        Ok(())
    }

    fn new_records_query(network: &str, status: Status, limit: usize, offset: usize) -> Value {
        json!({
            "query": {"bool": {"filter": [
                {"term": {"network": network}},
                {"term": {"status": i16::from(status)}}
            ]}},
            "sort": [{"retry_count": "asc"}, {"update_id": "asc"}],
            "size": limit,
            "from": offset
        })
    }

    async fn max_update_id(&self, index: &str, network: &str) -> Result<i64> {
        let body = json!({
            "size": 0,
            "query": {"term": {"network": network}},
            "aggs": {"max_update_id": {"max": {"field": "update_id"}}}
        });
        let response = self
            .send(self.client.post(self.url(&format!("{index}/_search"))).json(&body))
            .await?;
        let response = Self::check(response).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| MetadataIndexerError::BackendError(format!("aggregation response: {e}")))?;

        #[allow(clippy::cast_possible_truncation)]
        let max = parsed["aggregations"]["max_update_id"]["value"]
            .as_f64()
            .map_or(0, |v| v as i64);
        Ok(max)
    }
}

#[async_trait]
impl StorageBackend for ElasticStorage {
    async fn initialize(&self) -> Result<()> {
        for index in INDICES {
            let response = self.send(self.client.head(self.url(index))).await?;
            if response.status().is_success() {
                continue;
            }
            if response.status() != reqwest::StatusCode::NOT_FOUND {
                return Err(MetadataIndexerError::BackendError(format!(
                    "index {index}: {}",
                    response.status()
                )));
            }

            let mapping = self.mapping_for(index)?;
            let response = self
                .send(self.client.put(self.url(index)).json(&mapping))
                .await?;
            Self::check(response).await?;
            tracing::info!(index = index, "Created index");
        }
        Ok(())
    }

    async fn get_contract_metadata(
        &self,
        network: &str,
        status: Status,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ContractMetadata>> {
        let hits = self
            .search(CONTRACT_INDEX, Self::new_records_query(network, status, limit, offset))
            .await?;
        Ok(hits.into_iter().map(|h| h.source).collect())
    }

    async fn update_contract_metadata(&self, records: &[ContractMetadata]) -> Result<()> {
        let actions: Vec<BulkAction> = records
            .iter()
            .map(|r| BulkAction::Update {
                index: CONTRACT_INDEX,
                id: contract_id(r),
                doc: resolution_fields!(r),
            })
            .collect();
        self.bulk(&actions).await
    }

    async fn save_contract_metadata(&self, records: &[ContractMetadata]) -> Result<()> {
        let actions = records
            .iter()
            .map(|r| {
                Ok(BulkAction::Upsert {
                    index: CONTRACT_INDEX,
                    id: contract_id(r),
                    doc: serde_json::to_value(r)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.bulk(&actions).await
    }

    async fn get_token_metadata(
        &self,
        network: &str,
        status: Status,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TokenMetadata>> {
        let hits = self
            .search(TOKEN_INDEX, Self::new_records_query(network, status, limit, offset))
            .await?;
        Ok(hits.into_iter().map(|h| h.source).collect())
    }

    async fn update_token_metadata(&self, records: &[TokenMetadata]) -> Result<()> {
        let actions: Vec<BulkAction> = records
            .iter()
            .map(|r| BulkAction::Update {
                index: TOKEN_INDEX,
                id: token_id(r),
                doc: resolution_fields!(r),
            })
            .collect();
        self.bulk(&actions).await
    }

    async fn save_token_metadata(&self, records: &[TokenMetadata]) -> Result<()> {
        let actions = records
            .iter()
            .map(|r| {
                Ok(BulkAction::Upsert {
                    index: TOKEN_INDEX,
                    id: token_id(r),
                    doc: serde_json::to_value(r)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.bulk(&actions).await
    }

    async fn current_context(&self) -> Result<Vec<ContextItem>> {
        let mut items = Vec::new();
        let mut search_after: Option<Vec<Value>> = None;

        loop {
            let mut body = json!({
                "size": BULK_SIZE,
                "query": {"match_all": {}},
                "sort": [{"network": "asc"}, {"contract": "asc"}, {"key": "asc"}]
            });
            if let Some(after) = &search_after {
                body["search_after"] = json!(after);
            }

            let hits: Vec<Hit<ContextItem>> = self.search(CONTEXT_INDEX, body).await?;
            let done = hits.len() < BULK_SIZE;
            search_after = hits.last().and_then(|h| h.sort.clone());
            items.extend(hits.into_iter().map(|h| h.source));

            if done || search_after.is_none() {
                break;
            }
        }

        Ok(items)
    }

    async fn dump_context(&self, action: ContextAction, item: &ContextItem) -> Result<()> {
        let id = item.cache_key();
        match action {
            ContextAction::Create | ContextAction::Update => {
                self.put_doc(CONTEXT_INDEX, &id, serde_json::to_value(item)?)
                    .await
            }
            ContextAction::Delete => {
                let url = self.url(&format!(
                    "{CONTEXT_INDEX}/_doc/{}?refresh=wait_for",
                    urlencoding::encode(&id)
                ));
                let response = self.send(self.client.delete(url)).await?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(());
                }
                Self::check(response).await?;
                Ok(())
            }
        }
    }

    async fn get_state(&self, index_name: &str) -> Result<Option<IndexState>> {
        let url = self.url(&format!(
            "{STATE_INDEX}/_doc/{}",
            urlencoding::encode(index_name)
        ));
        let response = self.send(self.client.get(url)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        let parsed: GetResponse<IndexState> = response
            .json()
            .await
            .map_err(|e| MetadataIndexerError::BackendError(format!("state response: {e}")))?;
        Ok(if parsed.found { parsed.source } else { None })
    }

    async fn update_state(&self, state: &IndexState) -> Result<()> {
        self.put_doc(STATE_INDEX, &state.index_name, serde_json::to_value(state)?)
            .await
    }

    // Bulk requests are not transactional; the cursor goes last so a
    // partially applied batch is replayed after a restart.
    async fn save_level(&self, changes: &LevelChanges) -> Result<()> {
        let mut actions = Vec::with_capacity(changes.contracts.len() + changes.tokens.len());
        for r in &changes.contracts {
            actions.push(BulkAction::Upsert {
                index: CONTRACT_INDEX,
                id: contract_id(r),
                doc: serde_json::to_value(r)?,
            });
        }
        for r in &changes.tokens {
            actions.push(BulkAction::Upsert {
                index: TOKEN_INDEX,
                id: token_id(r),
                doc: serde_json::to_value(r)?,
            });
        }
        self.bulk(&actions).await?;
        self.update_state(&changes.state).await
    }

    async fn set_image_processed(&self, token: &TokenMetadata) -> Result<()> {
        let url = self.url(&format!(
            "{TOKEN_INDEX}/_update/{}?refresh=wait_for",
            urlencoding::encode(&token_id(token))
        ));
        let response = self
            .send(self.client.post(url).json(&json!({"doc": {"image_processed": true}})))
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn get_unprocessed_images(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TokenMetadata>> {
        let body = json!({
            "query": {"bool": {"filter": [
                {"term": {"status": i16::from(Status::Applied)}},
                {"term": {"image_processed": false}}
            ]}},
            "sort": [{"update_id": "asc"}],
            "size": limit,
            "from": offset
        });
        let hits = self.search(TOKEN_INDEX, body).await?;
        Ok(hits.into_iter().map(|h| h.source).collect())
    }

    async fn last_update_ids(&self, network: &str) -> Result<(i64, i64)> {
        let contracts = self.max_update_id(CONTRACT_INDEX, network).await?;
        let tokens = self.max_update_id(TOKEN_INDEX, network).await?;
        Ok((contracts, tokens))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "elastic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage(server: &MockServer) -> ElasticStorage {
        ElasticStorage::new(vec![server.uri()], 5, "./does-not-exist").unwrap()
    }

    #[test]
    fn test_requires_host() {
        assert!(ElasticStorage::new(vec![], 5, "mappings").is_err());
    }

    #[test]
    fn test_upsert_action_keeps_created_at_out_of_doc() {
        let record = ContractMetadata::new("mainnet", "KT1A", "ipfs://a", 1);
        let action = BulkAction::Upsert {
            index: CONTRACT_INDEX,
            id: contract_id(&record),
            doc: serde_json::to_value(&record).unwrap(),
        };
        let mut body = String::new();
        action.write_to(&mut body);

        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["update"]["_id"], "mainnet:KT1A");
        assert!(lines[1]["doc"].get("created_at").is_none());
        assert!(lines[1]["upsert"].get("created_at").is_some());
    }

    #[tokio::test]
    async fn test_initialize_creates_missing_indices() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/dipdup_state"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(3)
            .mount(&server)
            .await;

        storage(&server).initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_mapping_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("dipdup_state.json"),
            r#"{"settings":{"number_of_shards":1}}"#,
        )
        .unwrap();

        let es = ElasticStorage::new(vec!["http://localhost:9200".into()], 5, dir.path()).unwrap();
        assert_eq!(
            es.mapping_for(STATE_INDEX).unwrap(),
            json!({"settings": {"number_of_shards": 1}})
        );
        assert!(es.mapping_for(CONTRACT_INDEX).unwrap()["mappings"]["properties"]
            .get("retry_count")
            .is_some());
    }

    #[tokio::test]
    async fn test_get_new_contracts_sorted_by_retry_count() {
        let server = MockServer::start().await;
        let record = ContractMetadata::new("mainnet", "KT1A", "ipfs://a", 1);
        Mock::given(method("POST"))
            .and(path("/contract_metadata/_search"))
            .and(body_string_contains(r#""retry_count":"asc""#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [{"_source": record}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let rows = storage(&server)
            .get_contract_metadata("mainnet", Status::New, 15, 0)
            .await
            .unwrap();
        assert_eq!(rows, vec![record]);
    }

    #[tokio::test]
    async fn test_bulk_errors_are_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": true,
                "items": [{"update": {"status": 400, "error": {"type": "mapper_parsing_exception"}}}]
            })))
            .mount(&server)
            .await;

        let err = storage(&server)
            .save_contract_metadata(&[ContractMetadata::new("mainnet", "KT1A", "x", 1)])
            .await
            .unwrap_err();
        assert!(err.is_backend());
        assert!(err.to_string().contains("mapper_parsing_exception"));
    }

    #[tokio::test]
    async fn test_missing_state_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dipdup_state/_doc/metadata_mainnet"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"found": false})))
            .mount(&server)
            .await;

        assert!(storage(&server)
            .get_state("metadata_mainnet")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_last_update_ids_from_aggregation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contract_metadata/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": []},
                "aggregations": {"max_update_id": {"value": 42.0}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token_metadata/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": []},
                "aggregations": {"max_update_id": {"value": null}}
            })))
            .mount(&server)
            .await;

        assert_eq!(
            storage(&server).last_update_ids("mainnet").await.unwrap(),
            (42, 0)
        );
    }
}
