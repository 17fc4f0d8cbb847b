//! Contains support for long-running, resumable subscriptions to the
//! events persisted in an [`EventStore`].
//!
//! ## What are Subscriptions?
//!
//! A subscription delivers the events of a single stream, or of all
//! streams, to one consumer, strictly in order. Its position survives
//! restarts: every acknowledged event moves a durable cursor, and a
//! re-subscribe resumes from the last acknowledged position, replaying
//! whatever was delivered but never acked.
//!
//! A subscription identity is `(stream, name)`. At most one consumer may
//! hold it at a time, enforced through a store-side advisory lock; a
//! second subscriber is rejected with [`Error::LockContested`].
//!
//! ## Delivery protocol
//!
//! After [`Subscription::subscribe`] resolves, the consumer receives
//! [`SubscriptionMessage::Events`] batches and must acknowledge them
//! through [`Subscription::ack`]. Acking the last event of a batch
//! implicitly acknowledges the whole batch. Once historical replay has
//! completed (and its final batch was acked),
//! [`SubscriptionMessage::CaughtUp`] reports the boundary cursor, and
//! subsequent batches are live pushes. At most `max_in_flight`
//! unacknowledged events are outstanding at any time.

mod catch_up;
mod state;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::event::{RecordedEvent, StreamSelector};
use crate::notify::{Lagged, Notifications};
use crate::store::EventStore;

use catch_up::{CatchUpWorker, WorkerMessage};
use state::{Effect, StateMachine};

/// Bound of the delivery channel, in batches.
const DELIVERY_CHANNEL_SIZE: usize = 16;

/// Bound of the inbound command channel.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Error types returned by a [`Subscription`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The storage backend failed. The subscription terminates; state is
    /// recovered from the persisted cursor on the next subscribe.
    #[error("subscription storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// Another consumer holds the advisory lock for this subscription
    /// identity. The caller may retry later.
    #[error("subscription is locked by another consumer")]
    LockContested,

    /// The event source produced an event that does not strictly advance
    /// the cursor. Indicates storage corruption; fatal.
    #[error("event source ordering violation: got cursor {got}, last seen {last_seen}")]
    OrderingViolation {
        /// Cursor of the last event correctly observed.
        last_seen: i64,
        /// Offending cursor returned by the source.
        got: i64,
    },

    /// The pending buffer outgrew its configured bound because the
    /// consumer could not keep up. Fatal.
    #[error("subscription pending buffer exceeded its bound of {capacity} events")]
    BufferOverflow {
        /// The configured buffer bound.
        capacity: usize,
    },

    /// The subscription fell behind the broadcast bus and notifications
    /// were discarded. The gap cannot be recovered from the bus; fatal.
    #[error(transparent)]
    Lagged(#[from] Lagged),

    /// The consumer side of the delivery channel is gone.
    #[error("subscriber is no longer reachable")]
    SubscriberDown,
}

/// Messages delivered to the subscription consumer.
#[derive(Debug, PartialEq, Eq)]
pub enum SubscriptionMessage<T> {
    /// A batch of events, in cursor order. Must be acknowledged.
    Events(Vec<T>),

    /// Historical replay has completed at `cursor`; every following
    /// [`Events`](SubscriptionMessage::Events) batch is a live push.
    CaughtUp {
        /// The catch-up boundary cursor.
        cursor: i64,
    },
}

type Mapper<T> = Arc<dyn Fn(RecordedEvent) -> T + Send + Sync>;

/// Options accepted by [`Subscription::subscribe`].
pub struct SubscriptionOptions<T = RecordedEvent> {
    start_from_event_number: i64,
    start_from_stream_version: i64,
    max_in_flight: usize,
    batch_size: usize,
    buffer_capacity: usize,
    mapper: Mapper<T>,
}

impl Default for SubscriptionOptions<RecordedEvent> {
    fn default() -> Self {
        Self {
            start_from_event_number: 0,
            start_from_stream_version: 0,
            max_in_flight: 1000,
            batch_size: 1000,
            buffer_capacity: 10_000,
            mapper: Arc::new(|event| event),
        }
    }
}

impl<T> SubscriptionOptions<T> {
    /// Initial cursor for an `$all` subscription created by this
    /// subscribe call. Ignored when the subscription row already exists
    /// with a further-ahead cursor. Default 0, the beginning.
    #[must_use]
    pub fn start_from_event_number(mut self, event_number: i64) -> Self {
        self.start_from_event_number = event_number;
        self
    }

    /// Initial cursor for a single-stream subscription created by this
    /// subscribe call. Ignored when the subscription row already exists
    /// with a further-ahead cursor. Default 0, the beginning.
    #[must_use]
    pub fn start_from_stream_version(mut self, stream_version: i64) -> Self {
        self.start_from_stream_version = stream_version;
        self
    }

    /// Cap on delivered-but-unacknowledged events. Default 1000.
    #[must_use]
    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Batch size used by historical replay, clamped to
    /// [`max_in_flight`](SubscriptionOptions::max_in_flight) when the
    /// subscription starts. Default 1000.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Bound of the pending buffer holding live events that cannot be
    /// delivered yet. Exceeding it terminates the subscription with
    /// [`Error::BufferOverflow`]. Default 10000.
    #[must_use]
    pub fn buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity.max(1);
        self
    }
}

impl SubscriptionOptions<RecordedEvent> {
    /// Applies a pure transform to every event before delivery.
    ///
    /// The mapper affects neither ordering nor cursor tracking: acks are
    /// still expressed in `(event_number, stream_version)` terms.
    pub fn map<T>(
        self,
        mapper: impl Fn(RecordedEvent) -> T + Send + Sync + 'static,
    ) -> SubscriptionOptions<T> {
        SubscriptionOptions {
            start_from_event_number: self.start_from_event_number,
            start_from_stream_version: self.start_from_stream_version,
            max_in_flight: self.max_in_flight,
            batch_size: self.batch_size,
            buffer_capacity: self.buffer_capacity,
            mapper: Arc::new(mapper),
        }
    }
}

impl<T> Clone for SubscriptionOptions<T> {
    fn clone(&self) -> Self {
        Self {
            start_from_event_number: self.start_from_event_number,
            start_from_stream_version: self.start_from_stream_version,
            max_in_flight: self.max_in_flight,
            batch_size: self.batch_size,
            buffer_capacity: self.buffer_capacity,
            mapper: Arc::clone(&self.mapper),
        }
    }
}

impl<T> fmt::Debug for SubscriptionOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("start_from_event_number", &self.start_from_event_number)
            .field("start_from_stream_version", &self.start_from_stream_version)
            .field("max_in_flight", &self.max_in_flight)
            .field("batch_size", &self.batch_size)
            .field("buffer_capacity", &self.buffer_capacity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Command {
    Ack {
        event_number: i64,
        stream_version: i64,
    },
    Shutdown,
    Unsubscribe,
}

/// An active subscription handle.
///
/// Dropping the handle disconnects the consumer: the subscription task
/// terminates, the advisory lock is released, and the durable cursor is
/// kept so a later subscribe resumes from it. Use
/// [`unsubscribe`](Subscription::unsubscribe) to also delete the
/// durable state.
#[derive(Debug)]
pub struct Subscription<T = RecordedEvent> {
    name: String,
    selector: StreamSelector,
    commands: mpsc::Sender<Command>,
    delivery: mpsc::Receiver<SubscriptionMessage<T>>,
    task: JoinHandle<Result<(), Error>>,
}

impl<T> Subscription<T>
where
    T: Send + 'static,
{
    /// Subscribes to the events selected by `selector` under the given
    /// subscription name, resuming from the durable cursor if the
    /// subscription already exists.
    ///
    /// Fails with [`Error::LockContested`] when another consumer
    /// currently holds this subscription identity.
    pub async fn subscribe<S>(
        store: Arc<S>,
        selector: StreamSelector,
        name: impl Into<String>,
        options: SubscriptionOptions<T>,
    ) -> Result<Self, Error>
    where
        S: EventStore,
    {
        let name = name.into();

        let row = store
            .locate_or_create_subscription(
                selector.stream_uuid(),
                &name,
                options.start_from_event_number,
                options.start_from_stream_version,
            )
            .await
            .map_err(|err| Error::Storage(anyhow::Error::new(err)))?;

        let acquired = store
            .try_advisory_lock(row.subscription_id)
            .await
            .map_err(|err| Error::Storage(anyhow::Error::new(err)))?;

        if !acquired {
            return Err(Error::LockContested);
        }

        let start_from = selector.cursor_of(
            options.start_from_event_number,
            options.start_from_stream_version,
        );
        let cursor = row.cursor(&selector).max(start_from);

        tracing::debug!(
            subscription.name = %name,
            subscription.stream = %selector.stream_uuid(),
            subscription.checkpoint = cursor,
            "resuming subscription"
        );

        let mut machine =
            StateMachine::new(selector.clone(), options.max_in_flight, options.buffer_capacity);
        machine.row_loaded(cursor);

        // Open the bus receiver before the first historical read, so no
        // commit can fall between replay and live notifications. The
        // overlap this creates is deduplicated against the replay cursor
        // both when events are buffered and again when they are flushed.
        let notifications = store.subscribe_to_bus(&selector);

        machine.lock_acquired();

        // Replay batches are delivered whole and double as the in-flight
        // bound while catching up; a batch wider than the window would
        // breach it.
        let batch_size = options.batch_size.min(options.max_in_flight);

        let (acked_tx, acked_rx) = watch::channel(cursor);
        let (worker_rx, worker_handle) = CatchUpWorker::spawn(
            Arc::clone(&store),
            selector.clone(),
            cursor,
            batch_size,
            acked_rx,
        );

        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CHANNEL_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let task = SubscriptionTask {
            store,
            selector: selector.clone(),
            name: name.clone(),
            subscription_id: row.subscription_id,
            mapper: Arc::clone(&options.mapper),
            machine,
            delivery: delivery_tx,
            commands: command_rx,
            notifications,
            worker: Some(worker_rx),
            worker_handle,
            acked_tx,
        };

        Ok(Self {
            name,
            selector,
            commands: command_tx,
            delivery: delivery_rx,
            task: tokio::spawn(task.run()),
        })
    }
}

impl<T> Subscription<T> {
    /// The subscription name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The selector this subscription observes.
    pub fn selector(&self) -> &StreamSelector {
        &self.selector
    }

    /// Waits for the next message from the subscription.
    ///
    /// Returns `None` once the subscription has terminated; the
    /// termination cause is reported by
    /// [`shutdown`](Subscription::shutdown)/[`unsubscribe`](Subscription::unsubscribe),
    /// or logged if the handle is simply dropped.
    pub async fn next(&mut self) -> Option<SubscriptionMessage<T>> {
        self.delivery.recv().await
    }

    /// Acknowledges every delivered event up to and including the given
    /// position, advancing the durable cursor.
    ///
    /// Stale positions are ignored; an ack racing a concluded
    /// subscription is a no-op.
    pub async fn ack(&self, event_number: i64, stream_version: i64) {
        let _ = self
            .commands
            .send(Command::Ack {
                event_number,
                stream_version,
            })
            .await;
    }

    /// Disconnects the consumer, keeping the durable cursor: a later
    /// subscribe with the same identity resumes where this one left off.
    pub async fn shutdown(self) -> Result<(), Error> {
        self.conclude(Command::Shutdown).await
    }

    /// Stops the subscription and deletes its durable state. A later
    /// subscribe with the same identity starts from scratch.
    pub async fn unsubscribe(self) -> Result<(), Error> {
        self.conclude(Command::Unsubscribe).await
    }

    async fn conclude(self, command: Command) -> Result<(), Error> {
        let Self {
            commands,
            delivery,
            task,
            ..
        } = self;

        let _ = commands.send(command).await;

        // Unblocks a task mid-delivery; in-flight batches are discarded.
        drop(delivery);

        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                Err(Error::Storage(anyhow::anyhow!("subscription task panicked")))
            }
            Err(_) => Ok(()),
        }
    }
}

struct SubscriptionTask<S, T> {
    store: Arc<S>,
    selector: StreamSelector,
    name: String,
    subscription_id: i64,
    mapper: Mapper<T>,
    machine: StateMachine,
    delivery: mpsc::Sender<SubscriptionMessage<T>>,
    commands: mpsc::Receiver<Command>,
    notifications: Notifications,
    worker: Option<mpsc::Receiver<WorkerMessage>>,
    worker_handle: JoinHandle<()>,
    acked_tx: watch::Sender<i64>,
}

impl<S, T> SubscriptionTask<S, T>
where
    S: EventStore,
    T: Send + 'static,
{
    async fn run(mut self) -> Result<(), Error> {
        let mut result = self.process().await;

        if matches!(result, Err(Error::SubscriberDown)) {
            // The delivery channel may have been torn down by a racing
            // shutdown or unsubscribe call; honor it if so.
            if let Some(command) = self.drain_conclusion() {
                result = match command {
                    Command::Unsubscribe => self.delete_durable_state().await,
                    _ => Ok(()),
                };
            }
        }

        self.worker_handle.abort();
        self.machine.unsubscribe();

        if let Err(error) = &result {
            tracing::error!(
                subscription.name = %self.name,
                subscription.stream = %self.selector.stream_uuid(),
                error = %error,
                "subscription terminated"
            );
        }

        if let Err(error) = self.store.advisory_unlock(self.subscription_id).await {
            tracing::warn!(
                subscription.name = %self.name,
                error = %error,
                "failed to release subscription advisory lock"
            );
        }

        result
    }

    async fn process(&mut self) -> Result<(), Error> {
        loop {
            let catching_up = self.worker.is_some();

            tokio::select! {
                // Commands first: acks shrink the in-flight window and
                // must not starve behind a busy bus.
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Ack { event_number, stream_version }) => {
                        let effects = self.machine.ack(event_number, stream_version);
                        self.perform(effects).await?;
                    }
                    Some(Command::Unsubscribe) => {
                        return self.delete_durable_state().await;
                    }
                    Some(Command::Shutdown) => return Ok(()),
                    None => return Err(Error::SubscriberDown),
                },

                message = Self::recv_worker(self.worker.as_mut()), if catching_up => {
                    match message {
                        Some(WorkerMessage::Batch(events)) => {
                            let effects = self
                                .machine
                                .catch_up_batch(events)
                                .map_err(Error::from)?;
                            self.perform(effects).await?;
                        }
                        Some(WorkerMessage::CaughtUp { cursor }) => {
                            self.worker = None;
                            let effects = self.machine.caught_up(cursor);
                            self.perform(effects).await?;
                        }
                        Some(WorkerMessage::Failed(error)) => {
                            return Err(Error::Storage(error));
                        }
                        None => self.worker = None,
                    }
                },

                notification = self.notifications.recv() => match notification {
                    Ok(Some(notification)) => {
                        let effects = self
                            .machine
                            .notify_events(&notification.events)
                            .map_err(Error::from)?;
                        self.perform(effects).await?;
                    }
                    Ok(None) => {
                        return Err(Error::Storage(anyhow::anyhow!(
                            "event bus closed while subscription was live"
                        )));
                    }
                    Err(lagged) => return Err(Error::Lagged(lagged)),
                },
            }
        }
    }

    async fn perform(&mut self, effects: Vec<Effect>) -> Result<(), Error> {
        for effect in effects {
            match effect {
                Effect::Deliver(events) => {
                    let mapped = events.into_iter().map(|event| (self.mapper)(event)).collect();

                    self.delivery
                        .send(SubscriptionMessage::Events(mapped))
                        .await
                        .map_err(|_| Error::SubscriberDown)?;
                }
                Effect::NotifyCaughtUp { cursor } => {
                    self.delivery
                        .send(SubscriptionMessage::CaughtUp { cursor })
                        .await
                        .map_err(|_| Error::SubscriberDown)?;
                }
                Effect::PersistCursor {
                    event_number,
                    stream_version,
                } => {
                    self.store
                        .update_cursor(
                            self.selector.stream_uuid(),
                            &self.name,
                            event_number,
                            stream_version,
                        )
                        .await
                        .map_err(|err| Error::Storage(anyhow::Error::new(err)))?;
                }
                Effect::AckWatermark(cursor) => {
                    let _ = self.acked_tx.send(cursor);
                }
            }
        }

        Ok(())
    }

    async fn recv_worker(
        worker: Option<&mut mpsc::Receiver<WorkerMessage>>,
    ) -> Option<WorkerMessage> {
        match worker {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Consumes whatever conclusion command raced the failure, if any.
    fn drain_conclusion(&mut self) -> Option<Command> {
        while let Ok(command) = self.commands.try_recv() {
            if matches!(command, Command::Shutdown | Command::Unsubscribe) {
                return Some(command);
            }
        }

        None
    }

    async fn delete_durable_state(&self) -> Result<(), Error> {
        self.store
            .delete_subscription(self.selector.stream_uuid(), &self.name)
            .await
            .map_err(|err| Error::Storage(anyhow::Error::new(err)))
    }
}

impl From<state::Fatal> for Error {
    fn from(fatal: state::Fatal) -> Self {
        match fatal {
            state::Fatal::OrderingViolation { last_seen, got } => {
                Self::OrderingViolation { last_seen, got }
            }
            state::Fatal::BufferOverflow { capacity } => Self::BufferOverflow { capacity },
        }
    }
}
