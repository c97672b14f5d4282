//! In-memory storage backend.
//!
//! Thread-safe maps behind `RwLock`s. Used by the test suite and for dry
//! runs where nothing must survive the process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ContextAction, StorageBackend};
use crate::types::models::{
    ContextItem, ContractMetadata, IndexState, LevelChanges, Status, TokenMetadata,
};
use crate::utils::error::{MetadataIndexerError, Result};

type TokenKey = (String, String, u64);

#[derive(Debug, Default)]
struct Tables {
    contracts: HashMap<(String, String), ContractMetadata>,
    tokens: HashMap<TokenKey, TokenMetadata>,
    context: HashMap<String, ContextItem>,
    states: HashMap<String, IndexState>,
}

/// In-memory backend.
///
/// All tables live behind one lock so that [`StorageBackend::save_level`]
/// is atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<RwLock<Tables>>,
    save_level_calls: Arc<AtomicUsize>,
    fail_next_write: Arc<AtomicBool>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save_level` calls seen so far.
    #[must_use]
    pub fn save_level_calls(&self) -> usize {
        self.save_level_calls.load(Ordering::SeqCst)
    }

    /// Makes the next write operation fail with a backend error.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(MetadataIndexerError::BackendError(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Looks up one contract record.
    pub async fn contract(&self, network: &str, contract: &str) -> Option<ContractMetadata> {
        let tables = self.tables.read().await;
        tables
            .contracts
            .get(&(network.to_string(), contract.to_string()))
            .cloned()
    }

    /// Looks up one token record.
    pub async fn token(&self, network: &str, contract: &str, token_id: u64) -> Option<TokenMetadata> {
        let tables = self.tables.read().await;
        tables
            .tokens
            .get(&(network.to_string(), contract.to_string(), token_id))
            .cloned()
    }

    pub async fn contract_count(&self) -> usize {
        self.tables.read().await.contracts.len()
    }

    pub async fn token_count(&self) -> usize {
        self.tables.read().await.tokens.len()
    }

    /// Removes every stored row.
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        *tables = Tables::default();
    }
}

fn page<T>(rows: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    rows.into_iter().skip(offset).take(limit).collect()
}

fn upsert_contract(tables: &mut Tables, record: &ContractMetadata) {
    let key = (record.network.clone(), record.contract.clone());
    match tables.contracts.get_mut(&key) {
        Some(existing) => {
            let created_at = existing.created_at;
            *existing = record.clone();
            existing.created_at = created_at;
        }
        None => {
            tables.contracts.insert(key, record.clone());
        }
    }
}

fn upsert_token(tables: &mut Tables, record: &TokenMetadata) {
    let key = (
        record.network.clone(),
        record.contract.clone(),
        record.token_id,
    );
    match tables.tokens.get_mut(&key) {
        Some(existing) => {
            let created_at = existing.created_at;
            let image_processed = existing.image_processed;
            *existing = record.clone();
            existing.created_at = created_at;
            existing.image_processed = image_processed && existing.link == record.link;
        }
        None => {
            tables.tokens.insert(key, record.clone());
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn get_contract_metadata(
        &self,
        network: &str,
        status: Status,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ContractMetadata>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ContractMetadata> = tables
            .contracts
            .values()
            .filter(|c| c.network == network && c.status == status)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.retry_count
                .cmp(&b.retry_count)
                .then_with(|| a.update_id.cmp(&b.update_id))
        });
        Ok(page(rows, limit, offset))
    }

    async fn update_contract_metadata(&self, records: &[ContractMetadata]) -> Result<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        for record in records {
            if let Some(existing) = tables
                .contracts
                .get_mut(&(record.network.clone(), record.contract.clone()))
            {
                existing.status = record.status;
                existing.metadata.clone_from(&record.metadata);
                existing.retry_count = record.retry_count;
                existing.update_id = record.update_id;
                existing.updated_at = record.updated_at;
            }
        }
        Ok(())
    }

    async fn save_contract_metadata(&self, records: &[ContractMetadata]) -> Result<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        for record in records {
            upsert_contract(&mut tables, record);
        }
        Ok(())
    }

    async fn get_token_metadata(
        &self,
        network: &str,
        status: Status,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TokenMetadata>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<TokenMetadata> = tables
            .tokens
            .values()
            .filter(|t| t.network == network && t.status == status)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.retry_count
                .cmp(&b.retry_count)
                .then_with(|| a.update_id.cmp(&b.update_id))
        });
        Ok(page(rows, limit, offset))
    }

    async fn update_token_metadata(&self, records: &[TokenMetadata]) -> Result<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        for record in records {
            if let Some(existing) = tables.tokens.get_mut(&(
                record.network.clone(),
                record.contract.clone(),
                record.token_id,
            )) {
                existing.status = record.status;
                existing.metadata.clone_from(&record.metadata);
                existing.retry_count = record.retry_count;
                existing.update_id = record.update_id;
                existing.updated_at = record.updated_at;
            }
        }
        Ok(())
    }

    async fn save_token_metadata(&self, records: &[TokenMetadata]) -> Result<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        for record in records {
            upsert_token(&mut tables, record);
        }
        Ok(())
    }

    async fn current_context(&self) -> Result<Vec<ContextItem>> {
        let tables = self.tables.read().await;
        Ok(tables.context.values().cloned().collect())
    }

    async fn dump_context(&self, action: ContextAction, item: &ContextItem) -> Result<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        match action {
            ContextAction::Create | ContextAction::Update => {
                tables.context.insert(item.cache_key(), item.clone());
            }
            ContextAction::Delete => {
                tables.context.remove(&item.cache_key());
            }
        }
        Ok(())
    }

    async fn get_state(&self, index_name: &str) -> Result<Option<IndexState>> {
        let tables = self.tables.read().await;
        Ok(tables.states.get(index_name).cloned())
    }

    async fn update_state(&self, state: &IndexState) -> Result<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        tables.states.insert(state.index_name.clone(), state.clone());
        Ok(())
    }

    async fn save_level(&self, changes: &LevelChanges) -> Result<()> {
        self.save_level_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        let mut tables = self.tables.write().await;
        for record in &changes.contracts {
            upsert_contract(&mut tables, record);
        }
        for record in &changes.tokens {
            upsert_token(&mut tables, record);
        }
        tables
            .states
            .insert(changes.state.index_name.clone(), changes.state.clone());
        Ok(())
    }

    async fn set_image_processed(&self, token: &TokenMetadata) -> Result<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.tokens.get_mut(&(
            token.network.clone(),
            token.contract.clone(),
            token.token_id,
        )) {
            existing.image_processed = true;
        }
        Ok(())
    }

    async fn get_unprocessed_images(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TokenMetadata>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<TokenMetadata> = tables
            .tokens
            .values()
            .filter(|t| t.status == Status::Applied && !t.image_processed)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.update_id);
        Ok(page(rows, limit, offset))
    }

    async fn last_update_ids(&self, network: &str) -> Result<(i64, i64)> {
        let tables = self.tables.read().await;
        let contracts = tables
            .contracts
            .values()
            .filter(|c| c.network == network)
            .map(|c| c.update_id)
            .max()
            .unwrap_or(0);
        let tokens = tables
            .tokens
            .values()
            .filter(|t| t.network == network)
            .map(|t| t.update_id)
            .max()
            .unwrap_or(0);
        Ok((contracts, tokens))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_new_records_ordered_by_retry_count() {
        let storage = MemoryStorage::new();
        let mut a = ContractMetadata::new("mainnet", "KT1A", "ipfs://a", 1);
        a.retry_count = 2;
        let b = ContractMetadata::new("mainnet", "KT1B", "ipfs://b", 2);
        let mut c = ContractMetadata::new("mainnet", "KT1C", "ipfs://c", 3);
        c.status = Status::Applied;
        let other = ContractMetadata::new("ghostnet", "KT1D", "ipfs://d", 4);
        storage.save_contract_metadata(&[a, b, c, other]).await.unwrap();

        let rows = storage
            .get_contract_metadata("mainnet", Status::New, 15, 0)
            .await
            .unwrap();
        let contracts: Vec<&str> = rows.iter().map(|r| r.contract.as_str()).collect();
        assert_eq!(contracts, vec!["KT1B", "KT1A"]);

        let rows = storage
            .get_contract_metadata("mainnet", Status::New, 1, 1)
            .await
            .unwrap();
        assert_eq!(rows[0].contract, "KT1A");
    }

    #[tokio::test]
    async fn test_update_touches_only_resolution_fields() {
        let storage = MemoryStorage::new();
        let record = TokenMetadata::new("mainnet", "KT1A", 7, "ipfs://a", 1);
        storage.save_token_metadata(&[record.clone()]).await.unwrap();

        let mut changed = record.clone();
        changed.link = "ipfs://changed".into();
        changed.status = Status::Applied;
        changed.metadata = Some(json!({"name": "X"}));
        changed.update_id = 2;
        storage.update_token_metadata(&[changed]).await.unwrap();

        let stored = storage.token("mainnet", "KT1A", 7).await.unwrap();
        assert_eq!(stored.link, "ipfs://a");
        assert_eq!(stored.status, Status::Applied);
        assert_eq!(stored.metadata, Some(json!({"name": "X"})));
        assert_eq!(stored.update_id, 2);
    }

    #[tokio::test]
    async fn test_failed_save_level_leaves_nothing() {
        let storage = MemoryStorage::new();
        let mut changes = LevelChanges::new(IndexState::new("mainnet"));
        changes.state.level = 100;
        changes.push_contract(ContractMetadata::new("mainnet", "KT1A", "ipfs://a", 1));

        storage.fail_next_write();
        assert!(storage.save_level(&changes).await.is_err());
        assert_eq!(storage.contract_count().await, 0);
        assert!(storage.get_state("metadata_mainnet").await.unwrap().is_none());

        storage.save_level(&changes).await.unwrap();
        assert_eq!(storage.contract_count().await, 1);
        assert_eq!(
            storage.get_state("metadata_mainnet").await.unwrap().unwrap().level,
            100
        );
        assert_eq!(storage.save_level_calls(), 2);
    }

    #[tokio::test]
    async fn test_unprocessed_images_and_update_ids() {
        let storage = MemoryStorage::new();
        let mut applied = TokenMetadata::new("mainnet", "KT1A", 0, "ipfs://a", 5);
        applied.status = Status::Applied;
        let pending = TokenMetadata::new("mainnet", "KT1A", 1, "ipfs://b", 9);
        storage
            .save_token_metadata(&[applied.clone(), pending])
            .await
            .unwrap();
        storage
            .save_contract_metadata(&[ContractMetadata::new("mainnet", "KT1A", "x", 3)])
            .await
            .unwrap();

        let images = storage.get_unprocessed_images(10, 0).await.unwrap();
        assert_eq!(images.len(), 1);
        storage.set_image_processed(&applied).await.unwrap();
        assert!(storage.get_unprocessed_images(10, 0).await.unwrap().is_empty());

        assert_eq!(storage.last_update_ids("mainnet").await.unwrap(), (3, 9));
        assert_eq!(storage.last_update_ids("ghostnet").await.unwrap(), (0, 0));
    }
}
