//! Contains the broadcast bus announcing committed events to live
//! subscriptions.
//!
//! After an append commits, the store publishes the committed batch as a
//! [`StreamEvents`] notification. Each active subscription holds a
//! [`Notifications`] receiver filtered down to its own selector.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::{RecordedEvent, StreamSelector};

/// Default bound of the per-subscriber broadcast queue.
const DEFAULT_BUS_CAPACITY: usize = 128;

/// A batch of events committed to one stream in a single append.
///
/// Events are shared behind an [`Arc`]: the bus clones the notification
/// once per subscriber.
#[derive(Debug, Clone)]
pub struct StreamEvents {
    /// Uuid of the stream the batch was committed to.
    pub stream_uuid: String,

    /// The committed events, in commit order.
    pub events: Arc<Vec<RecordedEvent>>,
}

/// Error returned by [`Notifications::recv`] when the receiver fell
/// behind the bus and notifications were discarded.
///
/// A lagging subscription cannot recover its gap from the bus; the
/// subscription engine treats this as fatal and terminates the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("subscriber lagged behind the event bus, {missed} notifications lost")]
pub struct Lagged {
    /// Number of notifications dropped while the receiver lagged.
    pub missed: u64,
}

#[derive(Debug, Clone)]
enum Broadcast {
    Events(StreamEvents),
    Closed,
}

/// Multi-producer, multi-consumer bus carrying [`StreamEvents`]
/// notifications from appenders to live subscriptions.
///
/// Publication order on the bus follows commit order, so any one
/// receiver observes per-stream (and, for `$all`, global) commit order.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Broadcast>,
}

impl EventBus {
    /// Creates a new bus whose per-subscriber queues hold up to
    /// `capacity` notifications.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes a committed batch to every matching subscriber.
    ///
    /// Send errors are ignored: a bus with no live subscribers is not
    /// an error condition for the appender.
    pub fn publish(&self, stream_uuid: impl Into<String>, events: Vec<RecordedEvent>) {
        if events.is_empty() {
            return;
        }

        let notification = StreamEvents {
            stream_uuid: stream_uuid.into(),
            events: Arc::new(events),
        };

        let _ = self.tx.send(Broadcast::Events(notification));
    }

    /// Closes the bus for every current and future receiver.
    ///
    /// Stores call this when they can no longer uphold their delivery
    /// contract, e.g. on loss of the session owning the advisory locks;
    /// every live subscription observes the closure and terminates.
    pub fn close(&self) {
        let _ = self.tx.send(Broadcast::Closed);
    }

    /// Opens a receiver observing the notifications matching `selector`.
    pub fn subscribe(&self, selector: &StreamSelector) -> Notifications {
        Notifications {
            rx: self.tx.subscribe(),
            selector: selector.clone(),
            closed: false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Receiving side of the [`EventBus`], filtered to a single selector.
#[derive(Debug)]
pub struct Notifications {
    rx: broadcast::Receiver<Broadcast>,
    selector: StreamSelector,
    closed: bool,
}

impl Notifications {
    /// Waits for the next notification matching the selector.
    ///
    /// Returns `Ok(None)` once the bus has been closed, and
    /// [`Lagged`] if the receiver fell behind and lost notifications.
    pub async fn recv(&mut self) -> Result<Option<StreamEvents>, Lagged> {
        if self.closed {
            return Ok(None);
        }

        loop {
            match self.rx.recv().await {
                Ok(Broadcast::Events(notification))
                    if self.selector.matches(&notification.stream_uuid) =>
                {
                    return Ok(Some(notification));
                }
                Ok(Broadcast::Events(_)) => continue,
                Ok(Broadcast::Closed) | Err(broadcast::error::RecvError::Closed) => {
                    self.closed = true;
                    return Ok(None);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(Lagged { missed });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn event(stream_uuid: &str, event_number: i64, stream_version: i64) -> RecordedEvent {
        RecordedEvent {
            event_id: Uuid::new_v4(),
            event_number,
            stream_uuid: stream_uuid.to_owned(),
            stream_version,
            event_type: "test".to_owned(),
            correlation_id: None,
            causation_id: None,
            data: Vec::new(),
            metadata: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn notifications_are_filtered_by_selector() {
        let bus = EventBus::default();
        let mut notifications = bus.subscribe(&StreamSelector::new("stream-1"));

        bus.publish("stream-2", vec![event("stream-2", 1, 1)]);
        bus.publish("stream-1", vec![event("stream-1", 2, 1)]);

        let received = notifications.recv().await.unwrap().unwrap();
        assert_eq!(received.stream_uuid, "stream-1");
        assert_eq!(received.events[0].event_number, 2);
    }

    #[tokio::test]
    async fn all_selector_observes_every_stream() {
        let bus = EventBus::default();
        let mut notifications = bus.subscribe(&StreamSelector::All);

        bus.publish("stream-1", vec![event("stream-1", 1, 1)]);
        bus.publish("stream-2", vec![event("stream-2", 2, 1)]);

        let first = notifications.recv().await.unwrap().unwrap();
        let second = notifications.recv().await.unwrap().unwrap();
        assert_eq!(first.stream_uuid, "stream-1");
        assert_eq!(second.stream_uuid, "stream-2");
    }

    #[tokio::test]
    async fn closing_the_bus_ends_every_receiver() {
        let bus = EventBus::default();
        let mut notifications = bus.subscribe(&StreamSelector::All);

        bus.publish("stream-1", vec![event("stream-1", 1, 1)]);
        bus.close();

        assert!(notifications.recv().await.unwrap().is_some());
        assert!(notifications.recv().await.unwrap().is_none());

        // Closure is sticky.
        bus.publish("stream-1", vec![event("stream-1", 2, 2)]);
        assert!(notifications.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lagging_receiver_reports_the_missed_count() {
        let bus = EventBus::new(1);
        let mut notifications = bus.subscribe(&StreamSelector::All);

        bus.publish("stream-1", vec![event("stream-1", 1, 1)]);
        bus.publish("stream-1", vec![event("stream-1", 2, 2)]);

        assert_eq!(notifications.recv().await.unwrap_err(), Lagged { missed: 1 });
    }
}
