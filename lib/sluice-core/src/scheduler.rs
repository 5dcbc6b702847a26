//! Batching of submitted events.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering::AcqRel, Ordering::Acquire},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use tokio::{
    select,
    sync::{mpsc, oneshot, Notify},
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{event::MetricEvent, spawn_traced};

/// Receives batches released by a [`Scheduler`].
///
/// The scheduler waits for each call to return before releasing the next batch, so implementations never see two
/// batches at once.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// Handles a batch of events, in submission order.
    ///
    /// `cancel` is triggered when the scheduler is closed. Implementations should abandon any outstanding work when it
    /// is.
    async fn handle_batch(&self, batch: Vec<MetricEvent>, cancel: &CancellationToken);
}

/// Batching settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SchedulerConfig {
    interval: Duration,
    batch_size: usize,
    capacity: usize,
}

impl SchedulerConfig {
    /// Creates a new `SchedulerConfig`.
    ///
    /// Pending events are released every `interval`, or as soon as `batch_size` of them are pending, whichever comes
    /// first. At most `capacity` events are held at once.
    pub fn new(interval: Duration, batch_size: usize, capacity: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            interval,
            batch_size,
            capacity: capacity.max(batch_size),
        }
    }

    /// Returns the time trigger.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the count trigger, which is also the maximum number of events per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns the maximum number of pending events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

struct Shared {
    queue: ArrayQueue<MetricEvent>,
    batch_size: usize,
    closed: AtomicBool,
    cancel: CancellationToken,
    batch_ready: Notify,
}

/// Accumulates submitted events and releases them in batches.
///
/// Events are held in a bounded, lock-free queue, so any number of producers can submit concurrently without blocking.
/// A background task releases pending events to a [`BatchHandler`] when either trigger fires:
///
/// - the interval has elapsed since the last release
/// - the number of pending events reaches the batch size
///
/// Either trigger resets the interval. Releases are strictly sequential: while a batch is being handled, further
/// triggers are coalesced into the next release instead of starting a second one, which keeps batches ordered on the
/// wire.
///
/// When the queue is full, new events are rejected rather than buffered, which bounds memory when the handler is
/// stalled.
pub struct Scheduler {
    shared: Arc<Shared>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl Scheduler {
    /// Starts a scheduler that releases batches to `handler`.
    ///
    /// The interval timer starts immediately. Triggering `cancel` has the same effect as calling
    /// [`close`][Self::close].
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<H>(config: SchedulerConfig, handler: Arc<H>, cancel: CancellationToken) -> Self
    where
        H: BatchHandler + ?Sized,
    {
        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(config.capacity),
            batch_size: config.batch_size,
            closed: AtomicBool::new(false),
            cancel,
            batch_ready: Notify::new(),
        });

        let (flush_tx, flush_rx) = mpsc::channel(8);
        spawn_traced(run_scheduler(Arc::clone(&shared), handler, config.interval, flush_rx));

        Self { shared, flush_tx }
    }

    /// Submits an event.
    ///
    /// Never blocks. Returns `false` if the event was rejected, either because the queue is full or because the
    /// scheduler is closed.
    pub fn submit(&self, event: MetricEvent) -> bool {
        if self.is_closed() {
            return false;
        }

        if self.shared.queue.push(event).is_err() {
            return false;
        }

        if self.shared.queue.len() >= self.shared.batch_size {
            self.shared.batch_ready.notify_one();
        }
        true
    }

    /// Releases every pending event now, and waits up to `timeout` for them to be handled.
    ///
    /// If a batch is already being handled, it is waited for as well. Returns `true` if everything was handled in time.
    pub async fn flush(&self, timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let flushed = async {
            if self.flush_tx.send(ack_tx).await.is_err() {
                return false;
            }
            ack_rx.await.is_ok()
        };

        tokio::time::timeout(timeout, flushed).await.unwrap_or(false)
    }

    /// Closes the scheduler.
    ///
    /// Stops the interval timer and cancels the batch being handled, if any. Pending events are discarded, and any
    /// further submissions are rejected.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, AcqRel) {
            debug!(pending = self.pending(), "Closing scheduler.");
        }
        self.shared.cancel.cancel();
    }

    /// Returns `true` if the scheduler has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Acquire) || self.shared.cancel.is_cancelled()
    }

    /// Returns the number of pending events.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Returns the maximum number of pending events.
    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_scheduler<H>(
    shared: Arc<Shared>, handler: Arc<H>, interval: Duration, mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
) where
    H: BatchHandler + ?Sized,
{
    let next_release = sleep(interval);
    tokio::pin!(next_release);

    loop {
        select! {
            biased;

            _ = shared.cancel.cancelled() => break,
            maybe_ack = flush_rx.recv() => {
                let Some(ack) = maybe_ack else { break };

                debug!(pending = shared.queue.len(), "Flush requested.");
                release(&shared, &*handler, shared.queue.len()).await;
                next_release.as_mut().reset(Instant::now() + interval);

                let _ = ack.send(());
            },
            _ = shared.batch_ready.notified() => {
                // Only full batches are released here. A remainder waits for the next trigger.
                let full_batches = shared.queue.len() / shared.batch_size;
                if full_batches > 0 {
                    release(&shared, &*handler, full_batches * shared.batch_size).await;
                    next_release.as_mut().reset(Instant::now() + interval);
                }
            },
            _ = &mut next_release => {
                let pending = shared.queue.len();
                if pending > 0 {
                    debug!(pending, "Interval elapsed. Releasing pending events.");
                    release(&shared, &*handler, pending).await;
                }
                next_release.as_mut().reset(Instant::now() + interval);
            },
        }
    }

    debug!(discarded = shared.queue.len(), "Scheduler stopped.");
}

/// Releases up to `limit` pending events, in batches of at most the batch size.
async fn release<H>(shared: &Shared, handler: &H, limit: usize)
where
    H: BatchHandler + ?Sized,
{
    let mut remaining = limit;
    while remaining > 0 && !shared.cancel.is_cancelled() {
        let take = remaining.min(shared.batch_size);
        let mut batch = Vec::with_capacity(take);
        while batch.len() < take {
            match shared.queue.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }

        if batch.is_empty() {
            break;
        }

        remaining = remaining.saturating_sub(batch.len());
        handler.handle_batch(batch, &shared.cancel).await;
    }
}
