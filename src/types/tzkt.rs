//! Wire types of the chain observer (TzKT) HTTP API and event hub.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `GET /v1/head`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Head {
    pub level: u64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Block as pushed on the `blocks` channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Block {
    pub level: u64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Account reference with optional alias.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Alias {
    #[serde(default)]
    pub alias: Option<String>,
    pub address: String,
}

/// Big-map action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BigMapAction {
    Allocate,
    AddKey,
    UpdateKey,
    RemoveKey,
    Remove,
    #[serde(other)]
    Unknown,
}

impl BigMapAction {
    /// Query-string spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BigMapAction::Allocate => "allocate",
            BigMapAction::AddKey => "add_key",
            BigMapAction::UpdateKey => "update_key",
            BigMapAction::RemoveKey => "remove_key",
            BigMapAction::Remove => "remove",
            BigMapAction::Unknown => "unknown",
        }
    }
}

/// Key/value content of a big-map update.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BigMapContent {
    /// Script expression hash of the key.
    pub hash: String,
    pub key: Value,
    pub value: Value,
}

impl BigMapContent {
    /// The key rendered as the string used for the context table.
    #[must_use]
    pub fn key_string(&self) -> String {
        match &self.key {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One big-map diff.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BigMapUpdate {
    pub id: u64,
    pub level: u64,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub bigmap: i64,
    pub contract: Alias,
    pub path: String,
    pub action: BigMapAction,
    #[serde(default)]
    pub content: Option<BigMapContent>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl BigMapUpdate {
    /// Last segment of the storage path (`a.b.metadata` -> `metadata`).
    #[must_use]
    pub fn terminal_path(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}

/// Michelson pair stored under `token_metadata`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TokenInfoValue {
    pub token_id: String,
    #[serde(default)]
    pub token_info: BTreeMap<String, String>,
}

/// Level-grouped batch of big-map updates emitted by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub level: u64,
    pub body: Vec<BigMapUpdate>,
}
