//! `metadata_indexer` - resolves Tezos contract and token metadata.
//!
//! The indexer follows `metadata` and `token_metadata` big-map updates
//! through a chain observer (TzKT), materialises one record per contract
//! or token, and resolves the linked JSON documents from IPFS, HTTP(S),
//! on-chain storage (`tezos-storage:`) or `sha256://` links.
//!
//! # Architecture
//!
//! - [`streams`]: chain observer HTTP client, event hub client, scanner
//! - [`core`]: context store, update interpreter, work queues, orchestrator
//! - [`resolver`]: protocol adapters behind one [`Resolver`]
//! - [`uri`]: link parsers
//! - [`storage`]: [`StorageBackend`] with relational, search and in-memory backends
//! - [`config`], [`telemetry`]: ambient configuration and logging
//!
//! # Quick Start
//!
//! ```no_run
//! use metadata_indexer::{storage, Config, Indexer};
//! use std::sync::Arc;
//!
//! # async fn example() -> metadata_indexer::Result<()> {
//! let config = Config::load("dipdup.yml")?;
//! for (network, indexer_config) in &config.metadata.indexers {
//!     let db = storage::open(&config.database).await?;
//!     let indexer = Arc::new(Indexer::new(
//!         network,
//!         indexer_config,
//!         &config.metadata.settings,
//!         db,
//!     )?);
//!     indexer.start().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Public API exports
pub use config::{Config, DatabaseConfig, DatabaseKind, IndexerConfig, MetadataConfig, Settings};
pub use core::context::{Context, SharedContext};
pub use core::indexer::Indexer;
pub use resolver::Resolver;
pub use storage::{ElasticStorage, MemoryStorage, PostgresStorage, StorageBackend};
pub use types::models::{ContextItem, ContractMetadata, IndexState, Status, TokenMetadata};
pub use utils::error::{MetadataIndexerError, Result};

// Module declarations
pub mod config;
pub mod core;
pub mod resolver;
pub mod storage;
pub mod streams;
pub mod telemetry;
pub mod types;
pub mod uri;
pub mod utils;
