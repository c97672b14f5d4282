//! Chain observer event hub client (SignalR JSON protocol over WebSocket).
//!
//! Frames are JSON documents terminated by the record separator `0x1e`.
//! After the handshake the client invokes `SubscribeToBlocks` and
//! `SubscribeToBigMaps`; the hub then pushes invocations targeting the
//! `blocks` and `bigmaps` channels.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::types::tzkt::{BigMapUpdate, Block};
use crate::utils::error::{MetadataIndexerError, Result};
use crate::utils::logging::sanitize_url;

/// SignalR record separator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const HANDSHAKE: &str = r#"{"protocol":"json","version":1}"#;
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);
const EVENT_BUFFER: usize = 1024;

// SignalR message types.
const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Hub channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Blocks,
    BigMaps,
}

/// Decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Subscription confirmed at `level`.
    State { channel: Channel, level: u64 },
    Blocks(Vec<Block>),
    BigMaps(Vec<BigMapUpdate>),
    /// The chain was rolled back to `level`.
    Reorg { channel: Channel, level: u64 },
}

/// Hub subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Blocks,
    BigMaps {
        contract: Option<String>,
        tags: Vec<String>,
    },
}

impl Subscription {
    fn invocation(&self, id: usize) -> Value {
        match self {
            Subscription::Blocks => json!({
                "type": INVOCATION,
                "invocationId": id.to_string(),
                "target": "SubscribeToBlocks",
                "arguments": []
            }),
            Subscription::BigMaps { contract, tags } => {
                let mut args = json!({ "tags": tags });
                if let Some(contract) = contract {
                    args["contract"] = json!(contract);
                }
                json!({
                    "type": INVOCATION,
                    "invocationId": id.to_string(),
                    "target": "SubscribeToBigMaps",
                    "arguments": [args]
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    state: u64,
    #[serde(default)]
    data: Option<Value>,
}

/// Decodes `data` item by item; undecodable items are logged and skipped.
fn one_or_many<T: serde::de::DeserializeOwned>(channel: Channel, data: Value) -> Vec<T> {
    let items = match data {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(channel = ?channel, error = %e, "Skipping undecodable event item");
                None
            }
        })
        .collect()
}

/// Splits a text message into frames and decodes the channel messages.
///
/// Malformed frames and items are logged and skipped; the rest of the
/// message is still delivered.
///
/// # Errors
///
/// `ConnectionError` when the hub rejects a subscription or closes the
/// connection.
pub fn parse_frames(text: &str) -> Result<Vec<Event>> {
    let mut events = Vec::new();

    for raw in text.split(RECORD_SEPARATOR).filter(|f| !f.trim().is_empty()) {
        let frame: Frame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping undecodable hub frame");
                continue;
            }
        };

        match frame.kind {
            INVOCATION => {
                let channel = match frame.target.as_deref() {
                    Some("blocks") => Channel::Blocks,
                    Some("bigmaps") => Channel::BigMaps,
                    other => {
                        tracing::debug!(channel = ?other, "Ignoring hub channel");
                        continue;
                    }
                };
                for message in frame.arguments {
                    let Ok(message) = serde_json::from_value::<ChannelMessage>(message) else {
                        tracing::warn!(channel = ?channel, "Skipping undecodable channel message");
                        continue;
                    };
                    let data = message.data.unwrap_or(Value::Null);
                    events.push(match (message.kind, channel) {
                        (0, _) => Event::State {
                            channel,
                            level: message.state,
                        },
                        (1, Channel::Blocks) => Event::Blocks(one_or_many(channel, data)),
                        (1, Channel::BigMaps) => Event::BigMaps(one_or_many(channel, data)),
                        (2, _) => Event::Reorg {
                            channel,
                            level: message.state,
                        },
                        (kind, _) => {
                            tracing::debug!(kind, "Unknown channel message type");
                            continue;
                        }
                    });
                }
            }
            COMPLETION => {
                if let Some(error) = frame.error {
                    return Err(MetadataIndexerError::ConnectionError(format!(
                        "subscription failed: {error}"
                    )));
                }
            }
            CLOSE => {
                return Err(MetadataIndexerError::ConnectionError(format!(
                    "hub closed connection: {}",
                    frame.error.unwrap_or_default()
                )));
            }
            _ => {}
        }
    }

    Ok(events)
}

fn frame(value: &Value) -> WsMessage {
    WsMessage::Text(format!("{value}{RECORD_SEPARATOR}"))
}

/// Live event stream; background tasks stop when it is dropped.
pub struct EventStream {
    receiver: mpsc::Receiver<Event>,
    tasks: Vec<JoinHandle<()>>,
}

impl EventStream {
    /// Next event, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    #[cfg(test)]
    pub(crate) fn from_receiver(receiver: mpsc::Receiver<Event>) -> Self {
        Self {
            receiver,
            tasks: Vec::new(),
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Event hub client.
pub struct EventsClient {
    url: String,
    ping_interval: Duration,
}

impl EventsClient {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connects, performs the handshake and sends every subscription.
    ///
    /// # Errors
    ///
    /// `ConnectionError` when the hub is unreachable or rejects the
    /// handshake.
    pub async fn connect(
        &self,
        subscriptions: &[Subscription],
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        tracing::info!(url = %sanitize_url(&self.url), "Connecting to event hub");

        let (ws_stream, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            MetadataIndexerError::ConnectionError(format!("WebSocket connection failed: {e}"))
        })?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(WsMessage::Text(format!("{HANDSHAKE}{RECORD_SEPARATOR}")))
            .await
            .map_err(|e| MetadataIndexerError::ConnectionError(format!("handshake: {e}")))?;

        // The handshake answer is `{}` or `{"error": "..."}`.
        let mut leftover = None;
        loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let mut parts = text.splitn(2, RECORD_SEPARATOR);
                    let answer: Value = serde_json::from_str(parts.next().unwrap_or("{}"))
                        .map_err(|e| MetadataIndexerError::ConnectionError(format!("handshake: {e}")))?;
                    if let Some(error) = answer.get("error") {
                        return Err(MetadataIndexerError::ConnectionError(format!(
                            "handshake rejected: {error}"
                        )));
                    }
                    leftover = parts.next().map(str::to_string).filter(|s| !s.is_empty());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(MetadataIndexerError::ConnectionError(format!("handshake: {e}")));
                }
                None => {
                    return Err(MetadataIndexerError::ConnectionError(
                        "connection closed during handshake".to_string(),
                    ));
                }
            }
        }

        for (id, subscription) in subscriptions.iter().enumerate() {
            write
                .send(frame(&subscription.invocation(id)))
                .await
                .map_err(|e| MetadataIndexerError::ConnectionError(format!("subscribe: {e}")))?;
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let write = Arc::new(Mutex::new(write));

        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            if let Some(text) = leftover {
                if !forward(&text, &tx).await {
                    return;
                }
            }
            loop {
                tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    message = read.next() => match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if !forward(&text, &tx).await {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Event hub read failed");
                            break;
                        }
                    }
                }
            }
        });

        let pinger = tokio::spawn(ping_loop(write, self.ping_interval, cancel));

        Ok(EventStream {
            receiver: rx,
            tasks: vec![reader, pinger],
        })
    }
}

/// Decodes `text` and pushes its events; `false` stops the reader.
async fn forward(text: &str, tx: &mpsc::Sender<Event>) -> bool {
    match parse_frames(text) {
        Ok(events) => {
            for event in events {
                if tx.send(event).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "Event hub error");
            false
        }
    }
}

async fn ping_loop(write: Arc<Mutex<WsSink>>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.lock().await.close().await;
                break;
            }
            _ = ticker.tick() => {
                let ping = frame(&json!({ "type": PING }));
                if write.lock().await.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
