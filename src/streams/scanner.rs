//! Big-map scanner: historical catch-up followed by live subscription.
//!
//! The scanner owns one background task. It emits whole levels on the
//! big-map channel and raw block levels on the block channel. After every
//! disconnect it catches up over HTTP again before resubscribing, so no
//! level is skipped.

use super::events::{Event, EventStream, EventsClient, Subscription};
use super::tzkt::{BigMapFilter, TzktClient, PAGE_SIZE};
use crate::types::tzkt::{BigMapUpdate, Message};
use crate::utils::error::Result;
use crate::utils::logging;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the big-map message channel.
pub const BIG_MAPS_CAPACITY: usize = 1024;
/// Capacity of the block level channel.
pub const BLOCKS_CAPACITY: usize = 10;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Receiving ends of the scanner output.
pub struct ScannerChannels {
    pub big_maps: mpsc::Receiver<Message>,
    pub blocks: mpsc::Receiver<u64>,
}

/// Groups consecutive updates sharing a level, keeping their order.
#[must_use]
pub fn group_by_level(updates: Vec<BigMapUpdate>) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    for update in updates {
        match messages.last_mut() {
            Some(last) if last.level == update.level => last.body.push(update),
            _ => messages.push(Message {
                level: update.level,
                body: vec![update],
            }),
        }
    }
    messages
}

async fn emit(tx: &mpsc::Sender<Message>, message: Message, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        sent = tx.send(message) => sent.is_ok(),
    }
}

pub struct Scanner {
    network: String,
    client: TzktClient,
    events: EventsClient,
    contracts: Vec<String>,
    tags: Vec<String>,
    page_size: usize,
    reconnect_delay: Duration,
}

impl Scanner {
    #[must_use]
    pub fn new(
        network: impl Into<String>,
        client: TzktClient,
        contracts: Vec<String>,
        tags: Vec<String>,
    ) -> Self {
        let events = EventsClient::new(client.events_url());
        Self {
            network: network.into(),
            client,
            events,
            contracts,
            tags,
            page_size: PAGE_SIZE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, PAGE_SIZE);
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Hub subscriptions: blocks plus one big-map subscription per
    /// contract, or a single wildcard one.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions = vec![Subscription::Blocks];
        if self.contracts.is_empty() {
            subscriptions.push(Subscription::BigMaps {
                contract: None,
                tags: self.tags.clone(),
            });
        } else {
            subscriptions.extend(self.contracts.iter().map(|c| Subscription::BigMaps {
                contract: Some(c.clone()),
                tags: self.tags.clone(),
            }));
        }
        subscriptions
    }

    /// Spawns the scanner task starting after `level`.
    pub fn start(self, level: u64, cancel: CancellationToken) -> (ScannerChannels, JoinHandle<()>) {
        let (big_maps_tx, big_maps) = mpsc::channel(BIG_MAPS_CAPACITY);
        let (blocks_tx, blocks) = mpsc::channel(BLOCKS_CAPACITY);
        let handle = tokio::spawn(self.run(level, big_maps_tx, blocks_tx, cancel));
        (ScannerChannels { big_maps, blocks }, handle)
    }

    async fn run(
        self,
        mut level: u64,
        big_maps: mpsc::Sender<Message>,
        blocks: mpsc::Sender<u64>,
        cancel: CancellationToken,
    ) {
        let subscriptions = self.subscriptions();

        while !cancel.is_cancelled() {
            if let Err(e) = self.catch_up(&mut level, &big_maps, &cancel).await {
                logging::log_error(&format!("{} catch-up", self.network), &e.to_string());
                if !self.wait(&cancel).await {
                    break;
                }
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }

            match self.events.connect(&subscriptions, cancel.child_token()).await {
                Ok(stream) => {
                    // Close the gap between the catch-up and the subscription.
                    if let Err(e) = self.catch_up(&mut level, &big_maps, &cancel).await {
                        logging::log_error(&format!("{} catch-up", self.network), &e.to_string());
                    } else {
                        tracing::info!(network = %self.network, level, "Scanner is live");
                        self.live(stream, &mut level, &big_maps, &blocks, &cancel).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(network = %self.network, error = %e, "Event hub unavailable");
                }
            }

            if !self.wait(&cancel).await {
                break;
            }
        }

        tracing::info!(network = %self.network, level, "Scanner stopped");
    }

    async fn wait(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }

    /// Emits every level in `(level, head]`, updating `level` as it goes.
    ///
    /// # Errors
    ///
    /// Chain observer errors; `level` then points at the last emitted level.
    pub async fn catch_up(
        &self,
        level: &mut u64,
        tx: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let head = self.client.head().await?;
            if head.level <= *level {
                return Ok(());
            }
            tracing::info!(network = %self.network, from = *level, to = head.level, "Catching up");
            self.sync_range(level, head.level, tx, cancel).await?;
        }
    }

    async fn sync_range(
        &self,
        level: &mut u64,
        to: u64,
        tx: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut filter = BigMapFilter {
            tags: self.tags.clone(),
            contracts: self.contracts.clone(),
            level_gt: Some(*level),
            level_le: to,
            offset_cr: None,
            limit: self.page_size,
        };
        let mut pending: Option<Message> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let page = self.client.big_map_updates(&filter).await?;
            let full = page.len() >= self.page_size;
            if let Some(last) = page.last() {
                filter.offset_cr = Some(last.id);
            }

            for update in page {
                let same_level = pending.as_ref().is_some_and(|m| m.level == update.level);
                if !same_level {
                    if let Some(done) = pending.take() {
                        let done_level = done.level;
                        if !emit(tx, done, cancel).await {
                            return Ok(());
                        }
                        *level = done_level;
                    }
                    pending = Some(Message {
                        level: update.level,
                        body: Vec::new(),
                    });
                }
                if let Some(message) = pending.as_mut() {
                    message.body.push(update);
                }
            }

            if !full {
                break;
            }
        }

        if let Some(done) = pending.take() {
            if !emit(tx, done, cancel).await {
                return Ok(());
            }
        }
        *level = to;
        Ok(())
    }

    async fn live(
        &self,
        mut stream: EventStream,
        level: &mut u64,
        big_maps: &mpsc::Sender<Message>,
        blocks: &mpsc::Sender<u64>,
        cancel: &CancellationToken,
    ) {
        // Levels up to here are complete; later ones may arrive in parts.
        let synced = *level;
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = stream.recv() => event,
            };

            match event {
                None => {
                    tracing::warn!(network = %self.network, "Event hub disconnected");
                    return;
                }
                Some(Event::BigMaps(updates)) => {
                    for message in group_by_level(updates) {
                        if message.level <= synced {
                            continue;
                        }
                        let message_level = message.level;
                        if !emit(big_maps, message, cancel).await {
                            return;
                        }
                        *level = (*level).max(message_level);
                    }
                }
                Some(Event::Blocks(list)) => {
                    for block in list {
                        if blocks.try_send(block.level).is_err() {
                            tracing::debug!(network = %self.network, level = block.level, "Block channel full");
                        }
                    }
                }
                Some(Event::Reorg { channel, level: target }) => {
                    tracing::warn!(network = %self.network, channel = ?channel, level = target, "Reorg ignored");
                }
                Some(Event::State { channel, level: state }) => {
                    tracing::debug!(network = %self.network, channel = ?channel, level = state, "Subscribed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn raw_update(id: u64, level: u64) -> Value {
        json!({
            "id": id,
            "level": level,
            "bigmap": 1,
            "contract": {"address": "KT1A"},
            "path": "token_metadata",
            "action": "add_key",
            "content": {"hash": "expr", "key": id.to_string(), "value": {}}
        })
    }

    async fn tzkt(head: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/head"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "level": head })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/bigmaps/updates"))
            .and(query_param("offset.cr", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([raw_update(3, 101)])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/bigmaps/updates"))
            .and(query_param("level.gt", "99"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([raw_update(1, 100), raw_update(2, 100)])),
            )
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    fn scanner(server: &MockServer) -> Scanner {
        let client = TzktClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        Scanner::new(
            "mainnet",
            client,
            vec![],
            vec!["token_metadata".into(), "metadata".into()],
        )
        .with_page_size(2)
        .with_reconnect_delay(Duration::from_millis(50))
    }

    #[test]
    fn test_group_by_level() {
        let updates: Vec<BigMapUpdate> = [(1, 10), (2, 10), (3, 11), (4, 10)]
            .iter()
            .map(|(id, level)| serde_json::from_value(raw_update(*id, *level)).unwrap())
            .collect();
        let messages = group_by_level(updates);
        let shape: Vec<(u64, usize)> = messages.iter().map(|m| (m.level, m.body.len())).collect();
        assert_eq!(shape, vec![(10, 2), (11, 1), (10, 1)]);
    }

    #[test]
    fn test_subscriptions() {
        let client = TzktClient::new("http://localhost", Duration::from_secs(1)).unwrap();
        let s = Scanner::new("mainnet", client.clone(), vec![], vec!["metadata".into()]);
        assert_eq!(s.subscriptions().len(), 2);

        let s = Scanner::new(
            "mainnet",
            client,
            vec!["KT1A".into(), "KT1B".into()],
            vec!["metadata".into()],
        );
        let subs = s.subscriptions();
        assert_eq!(subs.len(), 3);
        assert_eq!(
            subs[2],
            Subscription::BigMaps {
                contract: Some("KT1B".into()),
                tags: vec!["metadata".into()]
            }
        );
    }

    #[tokio::test]
    async fn test_catch_up_emits_whole_levels() {
        let server = tzkt(101).await;
        let scanner = scanner(&server);
        let (tx, mut rx) = mpsc::channel(16);
        let mut level = 99;

        scanner
            .catch_up(&mut level, &tx, &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.level, 100);
        assert_eq!(first.body.iter().map(|u| u.id).collect::<Vec<_>>(), vec![1, 2]);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.level, 101);
        assert_eq!(second.body.len(), 1);
        assert!(rx.recv().await.is_none());
        assert_eq!(level, 101);
    }

    #[tokio::test]
    async fn test_catch_up_noop_at_head() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/head"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "level": 50 })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/bigmaps/updates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let (tx, _rx) = mpsc::channel(1);
        let mut level = 50;
        scanner(&server)
            .catch_up(&mut level, &tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(level, 50);
    }

    #[tokio::test]
    async fn test_started_scanner_stops_on_cancel() {
        let server = tzkt(101).await;
        let cancel = CancellationToken::new();
        let (mut channels, handle) = scanner(&server).start(99, cancel.clone());

        assert_eq!(channels.big_maps.recv().await.unwrap().level, 100);
        assert_eq!(channels.big_maps.recv().await.unwrap().level, 101);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_live_keeps_split_levels() {
        let server = MockServer::start().await;
        let scanner = scanner(&server);
        let update = |id: u64, level: u64| -> BigMapUpdate {
            serde_json::from_value(raw_update(id, level)).unwrap()
        };

        let (events_tx, events_rx) = mpsc::channel(8);
        for batch in [
            vec![update(1, 100)],
            vec![update(2, 101)],
            vec![update(3, 101), update(4, 102)],
        ] {
            events_tx.send(Event::BigMaps(batch)).await.unwrap();
        }
        drop(events_tx);

        let (big_maps_tx, mut big_maps_rx) = mpsc::channel(8);
        let (blocks_tx, _blocks_rx) = mpsc::channel(1);
        let mut level = 100;
        scanner
            .live(
                EventStream::from_receiver(events_rx),
                &mut level,
                &big_maps_tx,
                &blocks_tx,
                &CancellationToken::new(),
            )
            .await;
        drop(big_maps_tx);

        let mut received = Vec::new();
        while let Some(message) = big_maps_rx.recv().await {
            received.push((message.level, message.body.iter().map(|u| u.id).collect::<Vec<_>>()));
        }
        assert_eq!(
            received,
            vec![(101, vec![2]), (101, vec![3]), (102, vec![4])]
        );
        assert_eq!(level, 102);
    }
}
