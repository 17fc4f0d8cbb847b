//! Contains an in-memory [`EventStore`] implementation, backed by
//! [`HashMap`] indexes over a single global event log.
//!
//! Useful for tests and local development. The store is safe to use
//! across threads, and `clone()`s share the same backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::event::{EventData, RecordedEvent, StreamSelector};
use crate::notify::{EventBus, Notifications};
use crate::store::{EventStore, ExpectedVersion, SubscriptionRow, WrongExpectedVersion};

/// Error type returned by the [`InMemoryEventStore`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An [`ExpectedVersion::Exact`] check failed on append.
    #[error(transparent)]
    Conflict(#[from] WrongExpectedVersion),

    /// A cursor update referenced a subscription row that does not exist.
    #[error("subscription not found: {stream_uuid}/{name}")]
    SubscriptionNotFound {
        /// Stream uuid of the missing row.
        stream_uuid: String,
        /// Subscription name of the missing row.
        name: String,
    },
}

#[derive(Debug, Default)]
struct Backend {
    // Offsets into `log`, keyed by stream uuid.
    streams: HashMap<String, StreamRecord>,
    log: Vec<RecordedEvent>,
    next_stream_id: i64,
    subscriptions: HashMap<(String, String), SubscriptionRow>,
    next_subscription_id: i64,
    locks: HashSet<i64>,
}

#[derive(Debug, Default)]
struct StreamRecord {
    stream_id: i64,
    offsets: Vec<usize>,
}

impl Backend {
    fn stream_entry(&mut self, stream_uuid: &str) -> &mut StreamRecord {
        if !self.streams.contains_key(stream_uuid) {
            self.next_stream_id += 1;

            self.streams.insert(
                stream_uuid.to_owned(),
                StreamRecord {
                    stream_id: self.next_stream_id,
                    offsets: Vec::new(),
                },
            );
        }

        self.streams
            .get_mut(stream_uuid)
            .expect("stream record just inserted")
    }
}

/// In-memory [`EventStore`] implementation.
///
/// Advisory locks are process-scoped: the "session" owning a lock is the
/// subscription task that acquired it, and clean termination releases it
/// through [`EventStore::advisory_unlock`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<RwLock<Backend>>,
    bus: EventBus,
}

impl InMemoryEventStore {
    /// Creates a new, empty store whose bus queues hold up to
    /// `bus_capacity` notifications per subscriber.
    pub fn new(bus_capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            bus: EventBus::new(bus_capacity),
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    type Error = Error;

    async fn create_stream(&self, stream_uuid: &str) -> Result<i64, Self::Error> {
        let mut inner = self.inner.write();
        Ok(inner.stream_entry(stream_uuid).stream_id)
    }

    async fn append_to_stream(
        &self,
        stream_uuid: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<Vec<i64>, Self::Error> {
        let mut inner = self.inner.write();

        let current_version = inner
            .streams
            .get(stream_uuid)
            .map(|stream| stream.offsets.len() as i64)
            .unwrap_or_default();

        expected.check(current_version)?;

        let first_event_number = inner.log.len() as i64 + 1;
        let created_at = Utc::now();

        let recorded: Vec<RecordedEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| RecordedEvent {
                event_id: Uuid::new_v4(),
                event_number: first_event_number + i as i64,
                stream_uuid: stream_uuid.to_owned(),
                stream_version: current_version + i as i64 + 1,
                event_type: event.event_type,
                correlation_id: event.correlation_id,
                causation_id: event.causation_id,
                data: event.data,
                metadata: event.metadata,
                created_at,
            })
            .collect();

        let first_offset = inner.log.len();
        inner.log.extend(recorded.iter().cloned());

        let stream = inner.stream_entry(stream_uuid);
        stream
            .offsets
            .extend(first_offset..first_offset + recorded.len());

        let event_numbers = recorded.iter().map(|event| event.event_number).collect();

        // Published under the write lock so bus order follows commit order.
        self.bus.publish(stream_uuid, recorded);

        Ok(event_numbers)
    }

    async fn read_stream_forward(
        &self,
        stream_uuid: &str,
        from_version: i64,
        count: usize,
    ) -> Result<Vec<RecordedEvent>, Self::Error> {
        let inner = self.inner.read();

        // A stream with no events yet reads as empty, not as an error.
        let offsets = inner
            .streams
            .get(stream_uuid)
            .map(|stream| stream.offsets.as_slice())
            .unwrap_or_default();

        Ok(offsets
            .iter()
            .map(|&offset| &inner.log[offset])
            .filter(|event| event.stream_version > from_version)
            .take(count)
            .cloned()
            .collect())
    }

    async fn read_all_forward(
        &self,
        from_event_number: i64,
        count: usize,
    ) -> Result<Vec<RecordedEvent>, Self::Error> {
        let inner = self.inner.read();

        Ok(inner
            .log
            .iter()
            .filter(|event| event.event_number > from_event_number)
            .take(count)
            .cloned()
            .collect())
    }

    async fn locate_or_create_subscription(
        &self,
        stream_uuid: &str,
        name: &str,
        start_event_number: i64,
        start_stream_version: i64,
    ) -> Result<SubscriptionRow, Self::Error> {
        let mut inner = self.inner.write();

        let key = (stream_uuid.to_owned(), name.to_owned());

        if let Some(row) = inner.subscriptions.get(&key) {
            return Ok(row.clone());
        }

        inner.next_subscription_id += 1;

        let row = SubscriptionRow {
            subscription_id: inner.next_subscription_id,
            stream_uuid: stream_uuid.to_owned(),
            subscription_name: name.to_owned(),
            last_seen_event_number: start_event_number,
            last_seen_stream_version: start_stream_version,
            created_at: Utc::now(),
        };

        inner.subscriptions.insert(key, row.clone());

        Ok(row)
    }

    async fn update_cursor(
        &self,
        stream_uuid: &str,
        name: &str,
        event_number: i64,
        stream_version: i64,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write();

        let key = (stream_uuid.to_owned(), name.to_owned());

        let row = inner
            .subscriptions
            .get_mut(&key)
            .ok_or_else(|| Error::SubscriptionNotFound {
                stream_uuid: stream_uuid.to_owned(),
                name: name.to_owned(),
            })?;

        row.last_seen_event_number = event_number;
        row.last_seen_stream_version = stream_version;

        Ok(())
    }

    async fn delete_subscription(
        &self,
        stream_uuid: &str,
        name: &str,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write();
        inner
            .subscriptions
            .remove(&(stream_uuid.to_owned(), name.to_owned()));

        Ok(())
    }

    async fn try_advisory_lock(&self, subscription_id: i64) -> Result<bool, Self::Error> {
        let mut inner = self.inner.write();
        Ok(inner.locks.insert(subscription_id))
    }

    async fn advisory_unlock(&self, subscription_id: i64) -> Result<(), Self::Error> {
        let mut inner = self.inner.write();
        inner.locks.remove(&subscription_id);

        Ok(())
    }

    fn subscribe_to_bus(&self, selector: &StreamSelector) -> Notifications {
        self.bus.subscribe(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ALL_STREAMS;

    fn payload(event_type: &str) -> EventData {
        EventData::new(event_type, b"{}".to_vec())
    }

    #[tokio::test]
    async fn append_assigns_dense_global_and_stream_orderings() {
        let store = InMemoryEventStore::default();

        let first = store
            .append_to_stream("stream-1", ExpectedVersion::Any, vec![payload("a")])
            .await
            .unwrap();
        let second = store
            .append_to_stream("stream-2", ExpectedVersion::Any, vec![payload("b")])
            .await
            .unwrap();
        let third = store
            .append_to_stream("stream-1", ExpectedVersion::Any, vec![payload("c")])
            .await
            .unwrap();

        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![2]);
        assert_eq!(third, vec![3]);

        let stream = store.read_stream_forward("stream-1", 0, 100).await.unwrap();
        assert_eq!(
            stream
                .iter()
                .map(|event| event.stream_version)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );

        let all = store.read_all_forward(1, 100).await.unwrap();
        assert_eq!(
            all.iter().map(|event| event.event_number).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn exact_version_check_guards_concurrent_appends() {
        let store = InMemoryEventStore::default();

        store
            .append_to_stream("stream-1", ExpectedVersion::Exact(0), vec![payload("a")])
            .await
            .unwrap();

        let conflict = store
            .append_to_stream("stream-1", ExpectedVersion::Exact(0), vec![payload("b")])
            .await
            .unwrap_err();

        assert!(matches!(
            conflict,
            Error::Conflict(WrongExpectedVersion {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn existing_subscription_row_ignores_the_requested_start() {
        let store = InMemoryEventStore::default();

        let created = store
            .locate_or_create_subscription("stream-1", "projection", 0, 2)
            .await
            .unwrap();
        assert_eq!(created.last_seen_stream_version, 2);

        let located = store
            .locate_or_create_subscription("stream-1", "projection", 0, 9)
            .await
            .unwrap();
        assert_eq!(located.last_seen_stream_version, 2);
        assert_eq!(located.subscription_id, created.subscription_id);
    }

    #[tokio::test]
    async fn advisory_lock_is_exclusive_until_released() {
        let store = InMemoryEventStore::default();

        assert!(store.try_advisory_lock(7).await.unwrap());
        assert!(!store.try_advisory_lock(7).await.unwrap());

        store.advisory_unlock(7).await.unwrap();
        assert!(store.try_advisory_lock(7).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_streams_read_as_empty() {
        let store = InMemoryEventStore::default();

        store
            .append_to_stream("stream-1", ExpectedVersion::Any, vec![payload("a")])
            .await
            .unwrap();

        let events = store.read_stream_forward(ALL_STREAMS, 0, 10).await.unwrap();
        assert!(events.is_empty());
    }
}
