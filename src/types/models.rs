//! Persisted entities: metadata records, context items and the index cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resolution status of a metadata record.
///
/// `New` is the only non-terminal state. Allowed transitions are
/// `New -> New` (retry), `New -> Applied` and `New -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "i16", try_from = "i16")]
pub enum Status {
    #[default]
    New = 1,
    Failed = 2,
    Applied = 3,
}

impl Status {
    /// Whether no further resolution will be attempted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::New)
    }

    /// Whether `self -> next` is an allowed lifecycle transition.
    #[must_use]
    pub fn can_transition_to(self, next: Status) -> bool {
        match self {
            Status::New => true,
            Status::Failed | Status::Applied => self == next,
        }
    }
}

impl From<Status> for i16 {
    fn from(status: Status) -> Self {
        status as i16
    }
}

impl TryFrom<i16> for Status {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Status::New),
            2 => Ok(Status::Failed),
            3 => Ok(Status::Applied),
            other => Err(format!("unknown status {other}")),
        }
    }
}

/// The two metadata streams the indexer follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    /// TZIP-16 contract metadata, big-map path `metadata`.
    Contract,
    /// TZIP-12 token metadata, big-map path `token_metadata`.
    Token,
}

impl MetadataKind {
    /// Big-map tag and table name of the stream.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MetadataKind::Contract => "metadata",
            MetadataKind::Token => "token_metadata",
        }
    }

    /// Parses a configured index name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "metadata" => Some(MetadataKind::Contract),
            "token_metadata" => Some(MetadataKind::Token),
            _ => None,
        }
    }
}

/// Contract-level metadata, keyed by `(network, contract)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractMetadata {
    pub network: String,
    pub contract: String,
    pub link: String,
    pub status: Status,
    pub retry_count: u16,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub update_id: i64,
}

impl ContractMetadata {
    /// Creates a fresh `New` record for `link`.
    #[must_use]
    pub fn new(network: &str, contract: &str, link: &str, update_id: i64) -> Self {
        let now = Utc::now();
        Self {
            network: network.to_string(),
            contract: contract.to_string(),
            link: link.to_string(),
            status: Status::New,
            retry_count: 0,
            metadata: None,
            created_at: now,
            updated_at: now,
            update_id,
        }
    }

    /// Primary key rendered as a single string.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.network, self.contract)
    }
}

/// Token-level metadata, keyed by `(network, contract, token_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub network: String,
    pub contract: String,
    pub token_id: u64,
    pub link: String,
    pub status: Status,
    pub retry_count: u16,
    pub metadata: Option<Value>,
    pub image_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub update_id: i64,
}

impl TokenMetadata {
    /// Creates a fresh `New` record.
    #[must_use]
    pub fn new(network: &str, contract: &str, token_id: u64, link: &str, update_id: i64) -> Self {
        let now = Utc::now();
        Self {
            network: network.to_string(),
            contract: contract.to_string(),
            token_id,
            link: link.to_string(),
            status: Status::New,
            retry_count: 0,
            metadata: None,
            image_processed: false,
            created_at: now,
            updated_at: now,
            update_id,
        }
    }

    /// Primary key rendered as a single string.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.network, self.contract, self.token_id)
    }
}

/// On-chain key/value pair referenced by `tezos-storage:` links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextItem {
    pub network: String,
    pub contract: String,
    pub key: String,
    #[serde(with = "hex_value")]
    pub value: Vec<u8>,
}

impl ContextItem {
    /// Cache key `<network>:<address>:<key>`.
    #[must_use]
    pub fn cache_key(&self) -> String {
        context_key(&self.network, &self.contract, &self.key)
    }
}

/// Builds the context cache key for a `(network, address, key)` triple.
#[must_use]
pub fn context_key(network: &str, address: &str, key: &str) -> String {
    format!("{network}:{address}:{key}")
}

/// Per-network index cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub index_name: String,
    pub index_type: String,
    pub level: u64,
    pub updated_at: DateTime<Utc>,
}

/// Index type recorded in [`IndexState::index_type`].
pub const INDEX_TYPE_METADATA: &str = "metadata";

impl IndexState {
    /// Fresh cursor for `network` at level 0.
    #[must_use]
    pub fn new(network: &str) -> Self {
        Self {
            index_name: index_name(network),
            index_type: INDEX_TYPE_METADATA.to_string(),
            level: 0,
            updated_at: Utc::now(),
        }
    }
}

/// `metadata_<network>`
#[must_use]
pub fn index_name(network: &str) -> String {
    format!("metadata_{network}")
}

/// Everything one scanner message writes, committed atomically.
///
/// Records sharing a primary key are coalesced; the last one pushed wins.
#[derive(Debug, Clone)]
pub struct LevelChanges {
    pub contracts: Vec<ContractMetadata>,
    pub tokens: Vec<TokenMetadata>,
    pub state: IndexState,
}

impl LevelChanges {
    #[must_use]
    pub fn new(state: IndexState) -> Self {
        Self {
            contracts: Vec::new(),
            tokens: Vec::new(),
            state,
        }
    }

    pub fn push_contract(&mut self, record: ContractMetadata) {
        match self
            .contracts
            .iter_mut()
            .find(|c| c.network == record.network && c.contract == record.contract)
        {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = record;
                existing.created_at = created_at;
            }
            None => self.contracts.push(record),
        }
    }

    pub fn push_token(&mut self, record: TokenMetadata) {
        match self.tokens.iter_mut().find(|t| {
            t.network == record.network
                && t.contract == record.contract
                && t.token_id == record.token_id
        }) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = record;
                existing.created_at = created_at;
            }
            None => self.tokens.push(record),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty() && self.tokens.is_empty()
    }
}

mod hex_value {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_wire_values() {
        assert_eq!(serde_json::to_value(Status::New).unwrap(), json!(1));
        assert_eq!(serde_json::to_value(Status::Failed).unwrap(), json!(2));
        assert_eq!(serde_json::to_value(Status::Applied).unwrap(), json!(3));
        assert_eq!(serde_json::from_value::<Status>(json!(3)).unwrap(), Status::Applied);
        assert!(serde_json::from_value::<Status>(json!(7)).is_err());
    }

    #[test]
    fn test_status_transitions() {
        assert!(Status::New.can_transition_to(Status::New));
        assert!(Status::New.can_transition_to(Status::Applied));
        assert!(Status::New.can_transition_to(Status::Failed));
        assert!(!Status::Applied.can_transition_to(Status::New));
        assert!(!Status::Failed.can_transition_to(Status::Applied));
        assert!(Status::Failed.is_terminal());
        assert!(!Status::New.is_terminal());
    }

    #[test]
    fn test_context_item_hex_serde() {
        let item = ContextItem {
            network: "mainnet".into(),
            contract: "KT1QDFEu8JijYbsJqzoXq7mKvfaQQamHD1kX".into(),
            key: "contents".into(),
            value: b"{}".to_vec(),
        };
        let encoded = serde_json::to_value(&item).unwrap();
        assert_eq!(encoded["value"], json!("7b7d"));
        let decoded: ContextItem = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, item);
        assert_eq!(
            item.cache_key(),
            "mainnet:KT1QDFEu8JijYbsJqzoXq7mKvfaQQamHD1kX:contents"
        );
    }

    #[test]
    fn test_level_changes_coalesce_last_wins() {
        let mut changes = LevelChanges::new(IndexState::new("mainnet"));
        changes.push_contract(ContractMetadata::new("mainnet", "KT1A", "ipfs://first", 1));
        changes.push_contract(ContractMetadata::new("mainnet", "KT1A", "ipfs://second", 2));
        changes.push_contract(ContractMetadata::new("mainnet", "KT1B", "ipfs://other", 3));

        assert_eq!(changes.contracts.len(), 2);
        assert_eq!(changes.contracts[0].link, "ipfs://second");
        assert_eq!(changes.contracts[0].update_id, 2);

        changes.push_token(TokenMetadata::new("mainnet", "KT1A", 0, "a", 4));
        changes.push_token(TokenMetadata::new("mainnet", "KT1A", 1, "b", 5));
        changes.push_token(TokenMetadata::new("mainnet", "KT1A", 0, "c", 6));
        assert_eq!(changes.tokens.len(), 2);
        assert_eq!(changes.tokens[0].link, "c");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(MetadataKind::Contract.as_str(), "metadata");
        assert_eq!(MetadataKind::from_name("token_metadata"), Some(MetadataKind::Token));
        assert_eq!(MetadataKind::from_name("other"), None);
        assert_eq!(index_name("ghostnet"), "metadata_ghostnet");
    }
}
