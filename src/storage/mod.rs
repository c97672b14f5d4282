//! Persistence for metadata records, context items and index cursors.
//!
//! Every backend implements [`StorageBackend`]. The indexer only ever talks
//! to the trait object returned by [`open`], so the relational backend, the
//! document-search backend and the in-memory backend are interchangeable.

use crate::config::{DatabaseConfig, DatabaseKind};
use crate::types::models::{
    ContextItem, ContractMetadata, IndexState, LevelChanges, Status, TokenMetadata,
};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub mod elastic;
pub mod memory;
pub mod postgres;

pub use elastic::ElasticStorage;
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

/// Journal action replayed by [`StorageBackend::dump_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAction {
    Create,
    Update,
    Delete,
}

/// Abstract interface for storage operations.
///
/// `update_*_metadata` touches only `status`, `metadata`, `retry_count`,
/// `update_id` and `updated_at`, and is idempotent. `save_*_metadata`
/// upserts whole records.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Creates tables or indices that do not exist yet.
    async fn initialize(&self) -> Result<()>;

    /// Records of `network` in `status`, ordered by `retry_count` ascending.
    async fn get_contract_metadata(
        &self,
        network: &str,
        status: Status,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ContractMetadata>>;
    async fn update_contract_metadata(&self, records: &[ContractMetadata]) -> Result<()>;
    async fn save_contract_metadata(&self, records: &[ContractMetadata]) -> Result<()>;

    /// Records of `network` in `status`, ordered by `retry_count` ascending.
    async fn get_token_metadata(
        &self,
        network: &str,
        status: Status,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TokenMetadata>>;
    async fn update_token_metadata(&self, records: &[TokenMetadata]) -> Result<()>;
    async fn save_token_metadata(&self, records: &[TokenMetadata]) -> Result<()>;

    async fn current_context(&self) -> Result<Vec<ContextItem>>;
    async fn dump_context(&self, action: ContextAction, item: &ContextItem) -> Result<()>;

    async fn get_state(&self, index_name: &str) -> Result<Option<IndexState>>;
    async fn update_state(&self, state: &IndexState) -> Result<()>;

    /// Saves the records of one scanner message together with the cursor.
    ///
    /// Either everything is visible afterwards or nothing is.
    async fn save_level(&self, changes: &LevelChanges) -> Result<()>;

    async fn set_image_processed(&self, token: &TokenMetadata) -> Result<()>;
    /// Applied tokens whose images have not been processed yet.
    async fn get_unprocessed_images(&self, limit: usize, offset: usize)
        -> Result<Vec<TokenMetadata>>;

    /// Highest persisted `update_id` of `(contract_metadata, token_metadata)`.
    async fn last_update_ids(&self, network: &str) -> Result<(i64, i64)>;

    async fn close(&self) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// Opens and initializes the backend selected by `config`.
///
/// # Errors
///
/// Returns `ConfigError` for incomplete connection settings and the
/// backend's own error when it is unreachable.
pub async fn open(config: &DatabaseConfig) -> Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match config.kind {
        DatabaseKind::Postgres => {
            let url = config.connection_string()?;
            Arc::new(PostgresStorage::new(&url, config.max_connections).await?)
        }
        DatabaseKind::Elastic => Arc::new(ElasticStorage::new(
            config.hosts()?,
            config.timeout,
            config.mappings_dir.clone(),
        )?),
        DatabaseKind::Memory => Arc::new(MemoryStorage::new()),
    };

    storage.initialize().await?;
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_backend() {
        let config = DatabaseConfig {
            kind: DatabaseKind::Memory,
            ..DatabaseConfig::default()
        };
        let storage = open(&config).await.unwrap();
        assert_eq!(storage.backend_name(), "memory");
        assert!(storage.current_context().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_postgres_without_url_fails() {
        let config = DatabaseConfig {
            kind: DatabaseKind::Postgres,
            ..DatabaseConfig::default()
        };
        assert!(open(&config).await.is_err());
    }
}
