//! Bounded work queue flushed when full, on a timer and on shutdown.
//!
//! One background task per queue. It ticks once on start, then waits for
//! the ticker, a "full" signal or cancellation. Ticker and full signals
//! flush the buffer and tick again; cancellation performs a last flush and
//! exits.

use crate::utils::error::Result;
use crate::utils::logging;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CAPACITY: usize = 15;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Callbacks driven by a [`Queue`].
#[async_trait]
pub trait QueueHandler<T: Send + 'static>: Send + Sync {
    /// Periodic work; usually produces items for the queue.
    async fn tick(&self) -> Result<()>;

    /// Persists a non-empty batch.
    async fn flush(&self, batch: Vec<T>) -> Result<()>;

    fn name(&self) -> &str;
}

/// Producer side of a queue.
pub struct QueueBuffer<T> {
    items: Arc<Mutex<Vec<T>>>,
    capacity: usize,
    full: mpsc::Sender<()>,
}

impl<T> Clone for QueueBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            capacity: self.capacity,
            full: self.full.clone(),
        }
    }
}

impl<T: Send + 'static> QueueBuffer<T> {
    /// Appends `item`, signalling the consumer once capacity is reached.
    pub async fn add(&self, item: T) {
        let mut items = self.items.lock().await;
        items.push(item);
        if items.len() == self.capacity {
            // A pending signal already covers this batch.
            let _ = self.full.try_send(());
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Hands the whole buffer to `handler` while holding the lock and
    /// returns the number of items written.
    ///
    /// A failed batch is dropped, not requeued: its records are still `New`
    /// in persistence and the next tick picks them up again.
    pub async fn flush_into<H: QueueHandler<T> + ?Sized>(&self, handler: &H) -> usize {
        let mut items = self.items.lock().await;
        if items.is_empty() {
            return 0;
        }
        let batch = std::mem::take(&mut *items);
        let count = batch.len();
        match handler.flush(batch).await {
            Ok(()) => count,
            Err(e) => {
                tracing::warn!(queue = handler.name(), dropped = count, error = %e, "Flush failed, batch dropped");
                0
            }
        }
    }
}

/// Consumer side, turned into a task by [`Queue::start`].
pub struct Queue<T> {
    buffer: QueueBuffer<T>,
    full: mpsc::Receiver<()>,
    interval: Duration,
}

impl<T: Send + 'static> Queue<T> {
    #[must_use]
    pub fn new(capacity: usize, interval: Duration) -> Self {
        let (full_tx, full) = mpsc::channel(1);
        Self {
            buffer: QueueBuffer {
                items: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
                capacity: capacity.max(1),
                full: full_tx,
            },
            full,
            interval,
        }
    }

    #[must_use]
    pub fn buffer(&self) -> QueueBuffer<T> {
        self.buffer.clone()
    }

    /// Spawns the background task. It returns after the final flush that
    /// follows cancellation.
    pub fn start<H>(self, handler: Arc<H>, cancel: CancellationToken) -> JoinHandle<()>
    where
        H: QueueHandler<T> + 'static,
    {
        tokio::spawn(self.run(handler, cancel))
    }

    async fn run<H>(mut self, handler: Arc<H>, cancel: CancellationToken)
    where
        H: QueueHandler<T> + 'static,
    {
        tick::<T, H>(handler.as_ref()).await;

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = self.full.recv() => {}
            }

            self.buffer.flush_into(handler.as_ref()).await;
            if !cancel.is_cancelled() {
                tick::<T, H>(handler.as_ref()).await;
            }
        }

        let flushed = self.buffer.flush_into(handler.as_ref()).await;
        tracing::debug!(queue = handler.name(), flushed, "Queue stopped");
    }
}

async fn tick<T: Send + 'static, H: QueueHandler<T> + ?Sized>(handler: &H) {
    if let Err(e) = handler.tick().await {
        logging::log_error(&format!("{} tick", handler.name()), &e.to_string());
    }
}
