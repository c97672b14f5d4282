//! Relational backend on `PostgreSQL`.
//!
//! The schema is created on [`StorageBackend::initialize`]; every statement
//! is idempotent so restarts against an existing database are safe.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::HashSet;
use std::time::Duration;

use super::{ContextAction, StorageBackend};
use crate::types::models::{
    ContextItem, ContractMetadata, IndexState, LevelChanges, Status, TokenMetadata,
};
use crate::utils::error::{MetadataIndexerError, Result};

// 9 bind parameters per row keeps a chunk well below the protocol limit.
const INSERT_CHUNK: usize = 1000;

const SCHEMA: [&str; 7] = [
    r"
    CREATE TABLE IF NOT EXISTS contract_metadata (
        network TEXT NOT NULL,
        contract TEXT NOT NULL,
        link TEXT NOT NULL,
        status SMALLINT NOT NULL DEFAULT 1,
        retry_count SMALLINT NOT NULL DEFAULT 0,
        metadata JSONB,
        update_id BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (network, contract)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS token_metadata (
        network TEXT NOT NULL,
        contract TEXT NOT NULL,
        token_id NUMERIC(20, 0) NOT NULL,
        link TEXT NOT NULL,
        status SMALLINT NOT NULL DEFAULT 1,
        retry_count SMALLINT NOT NULL DEFAULT 0,
        metadata JSONB,
        image_processed BOOLEAN NOT NULL DEFAULT FALSE,
        update_id BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (network, contract, token_id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS dipdup_metadata_context (
        network TEXT NOT NULL,
        contract TEXT NOT NULL,
        key TEXT NOT NULL,
        value BYTEA NOT NULL,
        PRIMARY KEY (network, contract, key)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS dipdup_state (
        index_name TEXT PRIMARY KEY,
        index_type TEXT NOT NULL,
        level BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    "CREATE INDEX IF NOT EXISTS contract_metadata_status_idx ON contract_metadata (network, status, retry_count)",
    "CREATE INDEX IF NOT EXISTS token_metadata_status_idx ON token_metadata (network, status, retry_count)",
    "CREATE INDEX IF NOT EXISTS token_metadata_image_idx ON token_metadata (image_processed) WHERE status = 3",
];

const TOKEN_COLUMNS: &str = "network, contract, token_id::text AS token_id, link, status, \
     retry_count, metadata, image_processed, update_id, created_at, updated_at";

const CONTRACT_COLUMNS: &str =
    "network, contract, link, status, retry_count, metadata, update_id, created_at, updated_at";

/// `PostgreSQL` storage backend.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connects a pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns `MetadataIndexerError::DatabaseError` if connection fails.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_i16(value: u16) -> i16 {
    i16::try_from(value).unwrap_or(i16::MAX)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn status_from_row(row: &PgRow) -> Result<Status> {
    let raw: i16 = row.try_get("status")?;
    Status::try_from(raw).map_err(MetadataIndexerError::DecodingError)
}

fn retry_count_from_row(row: &PgRow) -> Result<u16> {
    let raw: i16 = row.try_get("retry_count")?;
    Ok(u16::try_from(raw).unwrap_or(0))
}

fn contract_from_row(row: &PgRow) -> Result<ContractMetadata> {
    Ok(ContractMetadata {
        network: row.try_get("network")?,
        contract: row.try_get("contract")?,
        link: row.try_get("link")?,
        status: status_from_row(row)?,
        retry_count: retry_count_from_row(row)?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        update_id: row.try_get("update_id")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<TokenMetadata> {
    let token_id: String = row.try_get("token_id")?;
    let token_id = token_id
        .parse::<u64>()
        .map_err(|e| MetadataIndexerError::DecodingError(format!("token_id {token_id}: {e}")))?;

    Ok(TokenMetadata {
        network: row.try_get("network")?,
        contract: row.try_get("contract")?,
        token_id,
        link: row.try_get("link")?,
        status: status_from_row(row)?,
        retry_count: retry_count_from_row(row)?,
        metadata: row.try_get("metadata")?,
        image_processed: row.try_get("image_processed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        update_id: row.try_get("update_id")?,
    })
}

/// Keeps the last occurrence of every key; one upsert statement may not
/// touch the same row twice.
fn dedup_last<T, K: std::hash::Hash + Eq>(records: &[T], key: impl Fn(&T) -> K) -> Vec<&T> {
    let mut seen = HashSet::new();
    let mut out: Vec<&T> = records
        .iter()
        .rev()
        .filter(|r| seen.insert(key(r)))
        .collect();
    out.reverse();
    out
}

async fn upsert_contracts(
    conn: &mut sqlx::PgConnection,
    records: &[ContractMetadata],
) -> Result<()> {
    let records = dedup_last(records, |r| (r.network.clone(), r.contract.clone()));
    for chunk in records.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO contract_metadata (network, contract, link, status, retry_count, \
             metadata, update_id, created_at, updated_at) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(r.network.clone())
                .push_bind(r.contract.clone())
                .push_bind(r.link.clone())
                .push_bind(i16::from(r.status))
                .push_bind(to_i16(r.retry_count))
                .push_bind(r.metadata.clone())
                .push_bind(r.update_id)
                .push_bind(r.created_at)
                .push_bind(r.updated_at);
        });
        qb.push(
            " ON CONFLICT (network, contract) DO UPDATE SET \
             link = EXCLUDED.link, status = EXCLUDED.status, \
             retry_count = EXCLUDED.retry_count, metadata = EXCLUDED.metadata, \
             update_id = EXCLUDED.update_id, updated_at = EXCLUDED.updated_at",
        );
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn upsert_tokens(conn: &mut sqlx::PgConnection, records: &[TokenMetadata]) -> Result<()> {
    let records = dedup_last(records, |r| {
        (r.network.clone(), r.contract.clone(), r.token_id)
    });
    for chunk in records.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO token_metadata (network, contract, token_id, link, status, retry_count, \
             metadata, image_processed, update_id, created_at, updated_at) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(r.network.clone())
                .push_bind(r.contract.clone())
                .push_bind(r.token_id.to_string())
                .push_unseparated("::numeric")
                .push_bind(r.link.clone())
                .push_bind(i16::from(r.status))
                .push_bind(to_i16(r.retry_count))
                .push_bind(r.metadata.clone())
                .push_bind(r.image_processed)
                .push_bind(r.update_id)
                .push_bind(r.created_at)
                .push_bind(r.updated_at);
        });
        qb.push(
            " ON CONFLICT (network, contract, token_id) DO UPDATE SET \
             link = EXCLUDED.link, status = EXCLUDED.status, \
             retry_count = EXCLUDED.retry_count, metadata = EXCLUDED.metadata, \
             image_processed = token_metadata.image_processed AND token_metadata.link = EXCLUDED.link, \
             update_id = EXCLUDED.update_id, updated_at = EXCLUDED.updated_at",
        );
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn upsert_state(conn: &mut sqlx::PgConnection, state: &IndexState) -> Result<()> {
    sqlx::query(
        "INSERT INTO dipdup_state (index_name, index_type, level, updated_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (index_name) DO UPDATE SET \
         index_type = EXCLUDED.index_type, level = EXCLUDED.level, updated_at = EXCLUDED.updated_at",
    )
    .bind(&state.index_name)
    .bind(&state.index_type)
    .bind(i64::try_from(state.level).unwrap_or(i64::MAX))
    .bind(state.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl StorageBackend for PostgresStorage {
    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
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
        let rows = sqlx::query(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contract_metadata \
             WHERE network = $1 AND status = $2 \
             ORDER BY retry_count ASC, update_id ASC LIMIT $3 OFFSET $4"
        ))
        .bind(network)
        .bind(i16::from(status))
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(contract_from_row).collect()
    }

    async fn update_contract_metadata(&self, records: &[ContractMetadata]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                "UPDATE contract_metadata SET status = $1, metadata = $2, retry_count = $3, \
                 update_id = $4, updated_at = $5 WHERE network = $6 AND contract = $7",
            )
            .bind(i16::from(r.status))
            .bind(r.metadata.clone())
            .bind(to_i16(r.retry_count))
            .bind(r.update_id)
            .bind(r.updated_at)
            .bind(&r.network)
            .bind(&r.contract)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_contract_metadata(&self, records: &[ContractMetadata]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        upsert_contracts(&mut tx, records).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_token_metadata(
        &self,
        network: &str,
        status: Status,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TokenMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM token_metadata \
             WHERE network = $1 AND status = $2 \
             ORDER BY retry_count ASC, update_id ASC LIMIT $3 OFFSET $4"
        ))
        .bind(network)
        .bind(i16::from(status))
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(token_from_row).collect()
    }

    async fn update_token_metadata(&self, records: &[TokenMetadata]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                "UPDATE token_metadata SET status = $1, metadata = $2, retry_count = $3, \
                 update_id = $4, updated_at = $5 \
                 WHERE network = $6 AND contract = $7 AND token_id = $8::numeric",
            )
            .bind(i16::from(r.status))
            .bind(r.metadata.clone())
            .bind(to_i16(r.retry_count))
            .bind(r.update_id)
            .bind(r.updated_at)
            .bind(&r.network)
            .bind(&r.contract)
            .bind(r.token_id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_token_metadata(&self, records: &[TokenMetadata]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        upsert_tokens(&mut tx, records).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn current_context(&self) -> Result<Vec<ContextItem>> {
        let rows = sqlx::query("SELECT network, contract, key, value FROM dipdup_metadata_context")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ContextItem> {
                Ok(ContextItem {
                    network: row.try_get("network")?,
                    contract: row.try_get("contract")?,
                    key: row.try_get("key")?,
                    value: row.try_get("value")?,
                })
            })
            .collect()
    }

    async fn dump_context(&self, action: ContextAction, item: &ContextItem) -> Result<()> {
        match action {
            ContextAction::Create | ContextAction::Update => {
                sqlx::query(
                    "INSERT INTO dipdup_metadata_context (network, contract, key, value) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (network, contract, key) DO UPDATE SET value = EXCLUDED.value",
                )
                .bind(&item.network)
                .bind(&item.contract)
                .bind(&item.key)
                .bind(&item.value)
                .execute(&self.pool)
                .await?;
            }
            ContextAction::Delete => {
                sqlx::query(
                    "DELETE FROM dipdup_metadata_context \
                     WHERE network = $1 AND contract = $2 AND key = $3",
                )
                .bind(&item.network)
                .bind(&item.contract)
                .bind(&item.key)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn get_state(&self, index_name: &str) -> Result<Option<IndexState>> {
        let row = sqlx::query(
            "SELECT index_name, index_type, level, updated_at FROM dipdup_state WHERE index_name = $1",
        )
        .bind(index_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<IndexState> {
            let level: i64 = row.try_get("level")?;
            Ok(IndexState {
                index_name: row.try_get("index_name")?,
                index_type: row.try_get("index_type")?,
                level: u64::try_from(level).unwrap_or(0),
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn update_state(&self, state: &IndexState) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_state(&mut conn, state).await
    }

    async fn save_level(&self, changes: &LevelChanges) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !changes.contracts.is_empty() {
            upsert_contracts(&mut tx, &changes.contracts).await?;
        }
        if !changes.tokens.is_empty() {
            upsert_tokens(&mut tx, &changes.tokens).await?;
        }
        upsert_state(&mut tx, &changes.state).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_image_processed(&self, token: &TokenMetadata) -> Result<()> {
        sqlx::query(
            "UPDATE token_metadata SET image_processed = TRUE \
             WHERE network = $1 AND contract = $2 AND token_id = $3::numeric",
        )
        .bind(&token.network)
        .bind(&token.contract)
        .bind(token.token_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_unprocessed_images(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TokenMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {TOKEN_COLUMNS} FROM token_metadata \
             WHERE status = 3 AND image_processed = FALSE \
             ORDER BY update_id ASC LIMIT $1 OFFSET $2"
        ))
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(token_from_row).collect()
    }

    async fn last_update_ids(&self, network: &str) -> Result<(i64, i64)> {
        let contracts: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(update_id), 0) FROM contract_metadata WHERE network = $1",
        )
        .bind(network)
        .fetch_one(&self.pool)
        .await?;
        let tokens: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(update_id), 0) FROM token_metadata WHERE network = $1",
        )
        .bind(network)
        .fetch_one(&self.pool)
        .await?;
        Ok((contracts, tokens))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
