//! Resolution ticks: pull `New` records, resolve their links, queue the
//! outcome for a batched partial update.

use super::queue::{QueueBuffer, QueueHandler};
use crate::resolver::Resolver;
use crate::storage::StorageBackend;
use crate::types::models::{ContractMetadata, MetadataKind, Status, TokenMetadata};
use crate::utils::counter::Counter;
use crate::utils::error::Result;
use crate::utils::escape::sanitize_value;
use crate::utils::logging;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Records fetched per tick.
pub const TICK_BATCH: usize = 15;

/// Mutable view of the fields a resolution touches.
pub struct ResolutionFields<'a> {
    pub status: &'a mut Status,
    pub retry_count: &'a mut u16,
    pub metadata: &'a mut Option<Value>,
    pub update_id: &'a mut i64,
    pub updated_at: &'a mut DateTime<Utc>,
}

/// A metadata record that goes through resolution.
#[async_trait]
pub trait Resolvable: Clone + Send + Sync + 'static {
    const KIND: MetadataKind;

    fn address(&self) -> &str;
    fn link(&self) -> &str;
    fn fields_mut(&mut self) -> ResolutionFields<'_>;

    /// Pending records of `network`, fewest retries first.
    async fn fetch_pending(
        db: &dyn StorageBackend,
        network: &str,
        limit: usize,
    ) -> Result<Vec<Self>>;

    async fn update(db: &dyn StorageBackend, records: &[Self]) -> Result<()>;
}

#[async_trait]
impl Resolvable for ContractMetadata {
    const KIND: MetadataKind = MetadataKind::Contract;

    fn address(&self) -> &str {
        &self.contract
    }

    fn link(&self) -> &str {
        &self.link
    }

    fn fields_mut(&mut self) -> ResolutionFields<'_> {
        ResolutionFields {
            status: &mut self.status,
            retry_count: &mut self.retry_count,
            metadata: &mut self.metadata,
            update_id: &mut self.update_id,
            updated_at: &mut self.updated_at,
        }
    }

    async fn fetch_pending(
        db: &dyn StorageBackend,
        network: &str,
        limit: usize,
    ) -> Result<Vec<Self>> {
        db.get_contract_metadata(network, Status::New, limit, 0).await
    }

    async fn update(db: &dyn StorageBackend, records: &[Self]) -> Result<()> {
        db.update_contract_metadata(records).await
    }
}

#[async_trait]
impl Resolvable for TokenMetadata {
    const KIND: MetadataKind = MetadataKind::Token;

    fn address(&self) -> &str {
        &self.contract
    }

    fn link(&self) -> &str {
        &self.link
    }

    fn fields_mut(&mut self) -> ResolutionFields<'_> {
        ResolutionFields {
            status: &mut self.status,
            retry_count: &mut self.retry_count,
            metadata: &mut self.metadata,
            update_id: &mut self.update_id,
            updated_at: &mut self.updated_at,
        }
    }

    async fn fetch_pending(
        db: &dyn StorageBackend,
        network: &str,
        limit: usize,
    ) -> Result<Vec<Self>> {
        db.get_token_metadata(network, Status::New, limit, 0).await
    }

    async fn update(db: &dyn StorageBackend, records: &[Self]) -> Result<()> {
        db.update_token_metadata(records).await
    }
}

/// Shallow merge of `fetched` into `src`; keys already in `src` win.
///
/// Non-object documents replace an empty or absent `src` and are ignored
/// otherwise.
#[must_use]
pub fn merge(src: Option<&Value>, fetched: Value) -> Value {
    match (src, fetched) {
        (Some(Value::Object(src)), Value::Object(mut merged)) => {
            for (key, value) in src {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (Some(Value::Object(src)), fetched) if src.is_empty() => fetched,
        (Some(src @ Value::Object(_)), _) => src.clone(),
        (_, fetched) => fetched,
    }
}

/// Tick and flush callbacks of one metadata kind on one network.
pub struct Resolution<R: Resolvable> {
    name: String,
    network: String,
    db: Arc<dyn StorageBackend>,
    resolver: Arc<Resolver>,
    counter: Arc<Counter>,
    buffer: QueueBuffer<R>,
    max_retry: u16,
}

impl<R: Resolvable> Resolution<R> {
    #[must_use]
    pub fn new(
        network: impl Into<String>,
        db: Arc<dyn StorageBackend>,
        resolver: Arc<Resolver>,
        counter: Arc<Counter>,
        buffer: QueueBuffer<R>,
        max_retry: u16,
    ) -> Self {
        let network = network.into();
        Self {
            name: format!("{network} {}", R::KIND.as_str()),
            network,
            db,
            resolver,
            counter,
            buffer,
            max_retry: max_retry.max(1),
        }
    }

    /// Resolves one record in place. Every call assigns a fresh `update_id`.
    pub async fn resolve_record(&self, record: &mut R) {
        let result = self
            .resolver
            .resolve(&self.network, record.address(), record.link())
            .await
            .and_then(|data| Ok(serde_json::from_slice::<Value>(&data)?));

        let update_id = self.counter.increment();
        let link = record.link().to_string();
        let fields = record.fields_mut();

        match result {
            Ok(fetched) => {
                let mut merged = merge(fields.metadata.as_ref(), fetched);
                sanitize_value(&mut merged);
                *fields.metadata = Some(merged);
                *fields.status = Status::Applied;
            }
            Err(e) if e.is_retryable() => {
                *fields.retry_count = fields.retry_count.saturating_add(1);
                if *fields.retry_count >= self.max_retry {
                    *fields.status = Status::Failed;
                }
                tracing::debug!(
                    network = %self.network,
                    link = %link,
                    retry_count = *fields.retry_count,
                    error = %e,
                    "Resolution will be retried"
                );
            }
            Err(e) => {
                *fields.status = Status::Failed;
                tracing::warn!(network = %self.network, link = %link, error = %e, "Resolution failed");
            }
        }

        *fields.update_id = update_id;
        *fields.updated_at = Utc::now();
    }
}

#[async_trait]
impl<R: Resolvable> QueueHandler<R> for Resolution<R> {
    async fn tick(&self) -> Result<()> {
        let started = Instant::now();
        let records = R::fetch_pending(self.db.as_ref(), &self.network, TICK_BATCH).await?;
        let total = records.len();

        let resolved = join_all(records.into_iter().map(|mut record| async move {
            self.resolve_record(&mut record).await;
            record
        }))
        .await;

        let mut applied = 0;
        for mut record in resolved {
            if *record.fields_mut().status == Status::Applied {
                applied += 1;
            }
            self.buffer.add(record).await;
        }

        logging::log_tick(
            &self.network,
            R::KIND.as_str(),
            applied,
            total,
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        Ok(())
    }

    async fn flush(&self, batch: Vec<R>) -> Result<()> {
        R::update(self.db.as_ref(), &batch).await?;
        tracing::debug!(queue = %self.name, count = batch.len(), "Flushed resolved records");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
