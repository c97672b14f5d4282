//! Per-network cache of on-chain storage values with a write journal.
//!
//! `tezos-storage:` links resolve against this cache. Writes land in the
//! cache immediately and in the journal until [`Context::dump`] replays
//! them against persistence.

use crate::storage::{ContextAction, StorageBackend};
use crate::types::models::{context_key, ContextItem};
use crate::types::tzkt::{BigMapAction, BigMapUpdate};
use crate::utils::error::{MetadataIndexerError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Context handle shared between the listener and the resolution ticks.
pub type SharedContext = Arc<RwLock<Context>>;

/// Pending write of one context item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub action: ContextAction,
    pub item: ContextItem,
}

/// Cache and journal state of one key before a savepoint touched it.
type Saved = (Option<ContextItem>, Option<JournalEntry>);

/// In-memory context store.
#[derive(Debug, Default)]
pub struct Context {
    cache: HashMap<String, ContextItem>,
    journal: BTreeMap<String, JournalEntry>,
    savepoint: Option<HashMap<String, Saved>>,
}

/// Whether the JSON-encoded big-map value is a hex string of a JSON object.
fn is_json_blob(raw: &str) -> bool {
    raw.starts_with("\"7b") && raw.ends_with("7d\"")
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared(self) -> SharedContext {
        Arc::new(RwLock::new(self))
    }

    /// Stores the value of a `metadata` big-map update.
    ///
    /// Returns `false` without touching anything when the value is not a
    /// hex-encoded JSON object or the action is neither `add_key` nor
    /// `update_key`.
    ///
    /// # Errors
    ///
    /// `DecodingError` when the value looks like a JSON blob but is not hex.
    pub fn add(&mut self, update: &BigMapUpdate, network: &str) -> Result<bool> {
        let action = match update.action {
            BigMapAction::AddKey => ContextAction::Create,
            BigMapAction::UpdateKey => ContextAction::Update,
            _ => return Ok(false),
        };
        let Some(content) = &update.content else {
            return Ok(false);
        };

        let raw = content.value.to_string();
        if !is_json_blob(&raw) {
            return Ok(false);
        }
        let value = hex::decode(raw.trim_matches('"'))
            .map_err(|e| MetadataIndexerError::DecodingError(format!("context value: {e}")))?;

        let item = ContextItem {
            network: network.to_string(),
            contract: update.contract.address.clone(),
            key: content.key_string(),
            value,
        };
        let key = item.cache_key();
        self.remember(&key);

        let action = match self.journal.get(&key) {
            Some(pending) if pending.action == ContextAction::Create => ContextAction::Create,
            _ => action,
        };

        self.cache.insert(key.clone(), item.clone());
        self.journal.insert(key, JournalEntry { action, item });
        Ok(true)
    }

    /// Drops a key; a pending create is simply forgotten.
    pub fn remove(&mut self, network: &str, address: &str, key: &str) {
        let cache_key = context_key(network, address, key);
        self.remember(&cache_key);
        let item = self.cache.remove(&cache_key).unwrap_or_else(|| ContextItem {
            network: network.to_string(),
            contract: address.to_string(),
            key: key.to_string(),
            value: Vec::new(),
        });

        match self.journal.get(&cache_key) {
            Some(pending) if pending.action == ContextAction::Create => {
                self.journal.remove(&cache_key);
            }
            _ => {
                self.journal.insert(
                    cache_key,
                    JournalEntry {
                        action: ContextAction::Delete,
                        item,
                    },
                );
            }
        }
    }

    /// Starts recording changes so that [`Context::rollback`] can undo them.
    pub fn begin(&mut self) {
        self.savepoint = Some(HashMap::new());
    }

    /// Keeps every change made since [`Context::begin`].
    pub fn commit(&mut self) {
        self.savepoint = None;
    }

    /// Restores cache and journal to their state at [`Context::begin`].
    pub fn rollback(&mut self) {
        let Some(saved) = self.savepoint.take() else {
            return;
        };
        for (key, (item, entry)) in saved {
            match item {
                Some(item) => {
                    self.cache.insert(key.clone(), item);
                }
                None => {
                    self.cache.remove(&key);
                }
            }
            match entry {
                Some(entry) => {
                    self.journal.insert(key, entry);
                }
                None => {
                    self.journal.remove(&key);
                }
            }
        }
    }

    fn remember(&mut self, key: &str) {
        if let Some(saved) = self.savepoint.as_mut() {
            if !saved.contains_key(key) {
                let before = (self.cache.get(key).cloned(), self.journal.get(key).cloned());
                saved.insert(key.to_string(), before);
            }
        }
    }

    /// Current value of `(network, address, key)`.
    #[must_use]
    pub fn get(&self, network: &str, address: &str, key: &str) -> Option<&ContextItem> {
        self.cache.get(&context_key(network, address, key))
    }

    /// Fills the cache from persistence. The journal is left untouched.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn load(&mut self, db: &dyn StorageBackend) -> Result<usize> {
        let items = db.current_context().await?;
        let count = items.len();
        for item in items {
            self.cache.insert(item.cache_key(), item);
        }
        Ok(count)
    }

    /// Replays the journal against persistence.
    ///
    /// Entries leave the journal as soon as they are written, so a failed
    /// dump can be retried without writing anything twice.
    ///
    /// # Errors
    ///
    /// The first backend error; remaining entries stay journaled.
    pub async fn dump(&mut self, db: &dyn StorageBackend) -> Result<usize> {
        let keys: Vec<String> = self.journal.keys().cloned().collect();
        let mut written = 0;
        for key in keys {
            if let Some(entry) = self.journal.get(&key) {
                db.dump_context(entry.action, &entry.item).await?;
                self.journal.remove(&key);
                written += 1;
            }
        }
        Ok(written)
    }

    /// Number of journaled writes.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.journal.len()
    }

    #[must_use]
    pub fn journal(&self) -> &BTreeMap<String, JournalEntry> {
        &self.journal
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
