//! `Indexer` - per-network orchestrator.
//!
//! One `Indexer` owns everything a network needs: the context store, the
//! scanner, the update interpreter, the two resolution queues and the
//! index cursor. The listener task applies scanner output strictly in
//! order; the queue tasks resolve pending records in the background.

use super::context::{Context, SharedContext};
use super::interpreter::Interpreter;
use super::queue::{Queue, QueueBuffer, QueueHandler};
use super::resolution::{Resolution, Resolvable};
use crate::config::{IndexerConfig, Settings};
use crate::resolver::Resolver;
use crate::storage::StorageBackend;
use crate::streams::scanner::{Scanner, ScannerChannels};
use crate::streams::tzkt::TzktClient;
use crate::types::models::{index_name, ContractMetadata, IndexState, MetadataKind, TokenMetadata};
use crate::types::tzkt::Message;
use crate::utils::counter::Counter;
use crate::utils::error::{MetadataIndexerError, Result};
use crate::utils::logging;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Resolution pipeline of one metadata kind.
struct Pipeline<R: Resolvable> {
    handler: Arc<Resolution<R>>,
    buffer: QueueBuffer<R>,
    queue: Mutex<Option<Queue<R>>>,
}

impl<R: Resolvable> Pipeline<R> {
    fn new(
        network: &str,
        db: &Arc<dyn StorageBackend>,
        resolver: &Arc<Resolver>,
        counter: &Arc<Counter>,
        settings: &Settings,
    ) -> Self {
        let queue = Queue::new(
            settings.queue_capacity,
            Duration::from_secs(settings.flush_interval),
        );
        let buffer = queue.buffer();
        let handler = Arc::new(Resolution::new(
            network,
            db.clone(),
            resolver.clone(),
            counter.clone(),
            buffer.clone(),
            settings.max_retry_count_on_error,
        ));
        Self {
            handler,
            buffer,
            queue: Mutex::new(Some(queue)),
        }
    }

    async fn start(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let queue = self.queue.lock().await.take()?;
        Some(queue.start(self.handler.clone(), cancel))
    }

    async fn resolve_once(&self) -> Result<usize> {
        self.handler.tick().await?;
        Ok(self.buffer.flush_into(self.handler.as_ref()).await)
    }
}

/// Pause before the scanner replays a level whose commit failed.
const REPLAY_DELAY: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Tasks {
    listener: Option<JoinHandle<()>>,
    queues: Vec<JoinHandle<()>>,
}

/// Scanner run owned by the listener.
struct ScannerRun {
    channels: ScannerChannels,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ScannerRun {
    async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        join("scanner", self.handle).await
    }
}

pub struct Indexer {
    network: String,
    db: Arc<dyn StorageBackend>,
    settings: Settings,
    tzkt: TzktClient,
    accounts: Vec<String>,
    context: SharedContext,
    interpreter: Interpreter,
    contract_counter: Arc<Counter>,
    token_counter: Arc<Counter>,
    contracts: Pipeline<ContractMetadata>,
    tokens: Pipeline<TokenMetadata>,
    state: Mutex<IndexState>,
    listener_cancel: CancellationToken,
    scanner_cancel: CancellationToken,
    queue_cancel: CancellationToken,
    tasks: Mutex<Tasks>,
    closed: AtomicBool,
}

impl Indexer {
    /// Wires the components of `network`. Nothing runs until [`Indexer::start`].
    ///
    /// # Errors
    ///
    /// `ConfigError` for unusable datasource or resolver settings.
    pub fn new(
        network: &str,
        config: &IndexerConfig,
        settings: &Settings,
        db: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let tzkt = TzktClient::new(
            &config.datasources.tzkt,
            Duration::from_secs(settings.http_timeout),
        )?;
        let context = Context::new().shared();
        let resolver = Arc::new(Resolver::new(settings, context.clone())?);
        let contract_counter = Arc::new(Counter::new(0));
        let token_counter = Arc::new(Counter::new(0));

        Ok(Self {
            network: network.to_string(),
            interpreter: Interpreter::new(network, contract_counter.clone(), token_counter.clone()),
            contracts: Pipeline::new(network, &db, &resolver, &contract_counter, settings),
            tokens: Pipeline::new(network, &db, &resolver, &token_counter, settings),
            db,
            settings: settings.clone(),
            tzkt,
            accounts: config.filters.accounts.clone(),
            context,
            contract_counter,
            token_counter,
            state: Mutex::new(IndexState::new(network)),
            listener_cancel: CancellationToken::new(),
            scanner_cancel: CancellationToken::new(),
            queue_cancel: CancellationToken::new(),
            tasks: Mutex::new(Tasks::default()),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    #[must_use]
    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// Current index cursor.
    pub async fn state(&self) -> IndexState {
        self.state.lock().await.clone()
    }

    /// Loads the cursor, the context store and the `update_id` floors.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn prepare(&self) -> Result<()> {
        let name = index_name(&self.network);
        let state = match self.db.get_state(&name).await? {
            Some(state) => state,
            None => {
                let state = IndexState::new(&self.network);
                self.db.update_state(&state).await?;
                state
            }
        };
        *self.state.lock().await = state;

        let loaded = self.context.write().await.load(self.db.as_ref()).await?;

        let (contract_floor, token_floor) = self.db.last_update_ids(&self.network).await?;
        self.contract_counter.raise_to(contract_floor);
        self.token_counter.raise_to(token_floor);

        tracing::debug!(
            network = %self.network,
            context = loaded,
            contract_update_id = contract_floor,
            token_update_id = token_floor,
            "Indexer prepared"
        );
        Ok(())
    }

    /// Starts queues, listener and scanner from the persisted level.
    ///
    /// # Errors
    ///
    /// Propagates errors of [`Indexer::prepare`].
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.prepare().await?;
        let level = self.state.lock().await.level;
        logging::log_startup(&self.network, self.tzkt.base_url(), level);

        let mut tasks = self.tasks.lock().await;

        if self.settings.indexes(MetadataKind::Contract) {
            tasks.queues.extend(self.contracts.start(self.queue_cancel.clone()).await);
        }
        if self.settings.indexes(MetadataKind::Token) {
            tasks.queues.extend(self.tokens.start(self.queue_cancel.clone()).await);
        }

        let this = Arc::clone(self);
        let cancel = self.listener_cancel.clone();
        tasks.listener = Some(tokio::spawn(async move { this.listen(level, cancel).await }));
        Ok(())
    }

    /// Starts a scanner emitting every level after `level`.
    fn spawn_scanner(&self, level: u64) -> ScannerRun {
        let tags = self
            .settings
            .kinds()
            .into_iter()
            .map(|kind| kind.as_str().to_string())
            .collect();
        let cancel = self.scanner_cancel.child_token();
        let scanner = Scanner::new(&self.network, self.tzkt.clone(), self.accounts.clone(), tags);
        let (channels, handle) = scanner.start(level, cancel.clone());
        ScannerRun {
            channels,
            handle,
            cancel,
        }
    }

    async fn listen(self: Arc<Self>, level: u64, cancel: CancellationToken) {
        let mut scanner = self.spawn_scanner(level);
        loop {
            let failed = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                message = scanner.channels.big_maps.recv() => {
                    let Some(message) = message else {
                        tracing::warn!(network = %self.network, "Scanner channel closed");
                        break;
                    };
                    match self.handle_message(message).await {
                        Ok(()) => false,
                        Err(e) => {
                            logging::log_error(&format!("{} level commit", self.network), &e.to_string());
                            true
                        }
                    }
                }
                Some(level) = scanner.channels.blocks.recv() => {
                    if let Err(e) = self.handle_block(level).await {
                        logging::log_error(&format!("{} block level", self.network), &e.to_string());
                    }
                    false
                }
            };

            if failed {
                // Messages queued behind the failed level are discarded with
                // the old scanner; the new one replays from the cursor.
                if let Err(e) = scanner.stop().await {
                    logging::log_error(&format!("{} scanner", self.network), &e.to_string());
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(REPLAY_DELAY) => {}
                }
                let level = self.state.lock().await.level;
                tracing::warn!(network = %self.network, level, "Replaying after failed commit");
                scanner = self.spawn_scanner(level);
            }
        }

        if let Err(e) = scanner.stop().await {
            logging::log_error(&format!("{} scanner", self.network), &e.to_string());
        }
        tracing::debug!(network = %self.network, "Listener stopped");
    }

    /// Applies one scanner message: new records and the cursor in one
    /// commit, then the context journal.
    ///
    /// # Errors
    ///
    /// Backend errors; the cursor and the context store are left as they
    /// were before the message then.
    pub async fn handle_message(&self, message: Message) -> Result<()> {
        let mut context = self.context.write().await;
        context.begin();
        let mut changes = self.interpreter.interpret_message(&message, &mut context);

        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.level = next.level.max(message.level);
        next.updated_at = Utc::now();
        changes.state = next;

        if let Err(e) = self.db.save_level(&changes).await {
            context.rollback();
            return Err(e);
        }
        context.commit();
        *state = changes.state;
        drop(state);

        if context.pending() > 0 {
            context.dump(self.db.as_ref()).await?;
        }
        drop(context);

        logging::log_level(
            &self.network,
            message.level,
            changes.contracts.len(),
            changes.tokens.len(),
        );
        Ok(())
    }

    /// Moves the cursor to `level - 1` when no big-map update was seen for
    /// more than one block.
    ///
    /// # Errors
    ///
    /// Backend errors from the state update.
    pub async fn handle_block(&self, level: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if level <= state.level.saturating_add(1) {
            return Ok(());
        }

        let mut next = state.clone();
        next.level = level - 1;
        next.updated_at = Utc::now();
        self.db.update_state(&next).await?;
        *state = next;
        Ok(())
    }

    /// Runs one resolution tick per indexed kind and flushes the results
    /// immediately. Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Backend errors of the fetch.
    pub async fn resolve_once(&self) -> Result<usize> {
        let mut written = 0;
        if self.settings.indexes(MetadataKind::Contract) {
            written += self.contracts.resolve_once().await?;
        }
        if self.settings.indexes(MetadataKind::Token) {
            written += self.tokens.resolve_once().await?;
        }
        Ok(written)
    }

    /// Stops every task, dumps the context journal and closes the backend.
    ///
    /// Idempotent. Cleanup continues past failures; the first one is
    /// returned.
    ///
    /// # Errors
    ///
    /// The first task, dump or backend error encountered.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_error: Option<MetadataIndexerError> = None;
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);

        // The listener stops its scanner on the way out.
        self.listener_cancel.cancel();
        if let Some(listener) = tasks.listener.take() {
            record(&mut first_error, join("listener", listener).await);
        }
        self.scanner_cancel.cancel();

        self.queue_cancel.cancel();
        for queue in tasks.queues.drain(..) {
            record(&mut first_error, join("queue", queue).await);
        }

        let dumped = self.context.write().await.dump(self.db.as_ref()).await;
        record(&mut first_error, dumped.map(|_| ()));
        record(&mut first_error, self.db.close().await);

        tracing::info!(network = %self.network, "Indexer closed");
        first_error.map_or(Ok(()), Err)
    }
}

async fn join(name: &str, handle: JoinHandle<()>) -> Result<()> {
    handle
        .await
        .map_err(|e| MetadataIndexerError::InternalError(format!("{name} task: {e}")))
}

fn record(first: &mut Option<MetadataIndexerError>, result: Result<()>) {
    if let Err(e) = result {
        logging::log_error("close", &e.to_string());
        if first.is_none() {
            *first = Some(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Datasources;
    use crate::storage::MemoryStorage;
    use crate::types::models::Status;

    fn indexer(storage: &MemoryStorage) -> Indexer {
        let config = IndexerConfig {
            filters: Default::default(),
            datasources: Datasources {
                tzkt: "http://127.0.0.1:1".into(),
            },
        };
        let settings = Settings::new(vec!["http://127.0.0.1:1".into()]);
        Indexer::new("mainnet", &config, &settings, Arc::new(storage.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_prepare_creates_state_and_seeds_counters() {
        let storage = MemoryStorage::new();
        let mut existing = ContractMetadata::new("mainnet", "KT1A", "ipfs://x", 41);
        existing.status = Status::Applied;
        storage.save_contract_metadata(&[existing]).await.unwrap();

        let indexer = indexer(&storage);
        indexer.prepare().await.unwrap();

        assert_eq!(indexer.state().await.level, 0);
        assert!(storage.get_state("metadata_mainnet").await.unwrap().is_some());
        assert_eq!(indexer.contract_counter.increment(), 42);
        assert_eq!(indexer.token_counter.increment(), 1);
    }

    #[tokio::test]
    async fn test_block_moves_cursor_only_forward() {
        let storage = MemoryStorage::new();
        let indexer = indexer(&storage);
        indexer.prepare().await.unwrap();

        indexer.handle_block(1).await.unwrap();
        assert_eq!(indexer.state().await.level, 0);

        indexer.handle_block(10).await.unwrap();
        assert_eq!(indexer.state().await.level, 9);

        indexer.handle_block(5).await.unwrap();
        assert_eq!(indexer.state().await.level, 9);
        assert_eq!(
            storage.get_state("metadata_mainnet").await.unwrap().unwrap().level,
            9
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let storage = MemoryStorage::new();
        let indexer = indexer(&storage);
        indexer.prepare().await.unwrap();
        indexer.close().await.unwrap();
        indexer.close().await.unwrap();
    }
}
