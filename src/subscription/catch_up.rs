//! Historical replay worker.
//!
//! Reads the event source forward in bounded batches, strictly one batch
//! in flight: the next read is issued only once the previous batch has
//! been fully acknowledged. An empty read means the live tail was
//! reached, reported through [`WorkerMessage::CaughtUp`].

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::event::{RecordedEvent, StreamSelector};
use crate::store::EventStore;

/// Messages from the worker to the subscription task.
#[derive(Debug)]
pub(super) enum WorkerMessage {
    /// A non-empty batch of historical events, in cursor order.
    Batch(Vec<RecordedEvent>),

    /// The historical log is exhausted at `cursor`.
    CaughtUp { cursor: i64 },

    /// A read against the event source failed.
    Failed(anyhow::Error),
}

pub(super) struct CatchUpWorker<S> {
    store: Arc<S>,
    selector: StreamSelector,
    from: i64,
    batch_size: usize,
    batches: mpsc::Sender<WorkerMessage>,
    acked: watch::Receiver<i64>,
}

impl<S> CatchUpWorker<S>
where
    S: EventStore,
{
    /// Spawns the worker task replaying from `from`, reporting into the
    /// returned channel. `acked` carries the subscription's acknowledged
    /// watermark and gates batch pacing.
    pub(super) fn spawn(
        store: Arc<S>,
        selector: StreamSelector,
        from: i64,
        batch_size: usize,
        acked: watch::Receiver<i64>,
    ) -> (mpsc::Receiver<WorkerMessage>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);

        let worker = Self {
            store,
            selector,
            from,
            batch_size,
            batches: tx,
            acked,
        };

        (rx, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        loop {
            let batch = match self.read_batch().await {
                Ok(batch) => batch,
                Err(error) => {
                    let _ = self
                        .batches
                        .send(WorkerMessage::Failed(anyhow::Error::new(error)))
                        .await;
                    return;
                }
            };

            let tail = match batch.last() {
                Some(event) => self.selector.cursor(event),
                None => {
                    tracing::debug!(
                        subscription.cursor = self.from,
                        "catch-up reached the live tail"
                    );

                    let _ = self
                        .batches
                        .send(WorkerMessage::CaughtUp { cursor: self.from })
                        .await;
                    return;
                }
            };

            if self.batches.send(WorkerMessage::Batch(batch)).await.is_err() {
                return;
            }

            // One batch in flight: block until it is fully acknowledged.
            while *self.acked.borrow() < tail {
                if self.acked.changed().await.is_err() {
                    return;
                }
            }

            self.from = tail;
        }
    }

    async fn read_batch(&self) -> Result<Vec<RecordedEvent>, S::Error> {
        match &self.selector {
            StreamSelector::All => {
                self.store
                    .read_all_forward(self.from, self.batch_size)
                    .await
            }
            StreamSelector::Stream(stream_uuid) => {
                self.store
                    .read_stream_forward(stream_uuid, self.from, self.batch_size)
                    .await
            }
        }
    }
}
