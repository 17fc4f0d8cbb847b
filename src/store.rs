//! Contains the Event Store port consumed by the subscription engine.
//!
//! Implementations of [`EventStore`] provide durable storage for events
//! and subscription cursors. The crate ships an in-memory implementation
//! in [`inmemory`](crate::inmemory); a PostgreSQL implementation lives in
//! the `everstream-postgres` crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::{EventData, RecordedEvent, StreamSelector};
use crate::notify::Notifications;

/// Optimistic concurrency check applied when appending to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append regardless of the current stream version.
    Any,

    /// Append only if the current stream version is exactly the one
    /// specified; fail with [`WrongExpectedVersion`] otherwise.
    Exact(i64),
}

impl ExpectedVersion {
    /// Validates the check against the actual current stream version.
    pub fn check(self, actual: i64) -> Result<(), WrongExpectedVersion> {
        match self {
            Self::Any => Ok(()),
            Self::Exact(expected) if expected == actual => Ok(()),
            Self::Exact(expected) => Err(WrongExpectedVersion { expected, actual }),
        }
    }
}

/// Conflict raised when an [`ExpectedVersion::Exact`] check fails on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wrong expected stream version: expected {expected}, actual {actual}")]
pub struct WrongExpectedVersion {
    /// The version the appender expected the stream to be at.
    pub expected: i64,

    /// The version the stream was actually at.
    pub actual: i64,
}

/// Durable state of a subscription, one row per `(stream_uuid, name)`.
///
/// The cursor pair records the last position acknowledged by a consumer;
/// the `0` sentinel means "before the first event".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRow {
    /// Store-internal numeric id, used to key the advisory lock.
    pub subscription_id: i64,

    /// Stream uuid the subscription observes, or the `$all` sentinel.
    pub stream_uuid: String,

    /// Name identifying the subscription within its stream.
    pub subscription_name: String,

    /// Last acknowledged global event number.
    pub last_seen_event_number: i64,

    /// Last acknowledged per-stream version.
    pub last_seen_stream_version: i64,

    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl SubscriptionRow {
    /// The active persisted cursor under the given selector kind.
    pub fn cursor(&self, selector: &StreamSelector) -> i64 {
        selector.cursor_of(self.last_seen_event_number, self.last_seen_stream_version)
    }
}

/// Port to the durable event storage backing the subscription engine.
///
/// Reads are forward-only and bounded; appends assign the dense global
/// `event_number` and per-stream `stream_version` orderings. Committed
/// events are announced on a broadcast bus obtained through
/// [`subscribe_to_bus`](EventStore::subscribe_to_bus).
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Error type returned by the storage backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a new, empty stream, returning its internal numeric id.
    async fn create_stream(&self, stream_uuid: &str) -> Result<i64, Self::Error>;

    /// Appends events to a stream, creating the stream if it does not
    /// exist, and returns the assigned global event numbers in order.
    ///
    /// The append is transactional: either every event is committed, or
    /// none is. Commit publishes `(stream_uuid, events)` on the bus.
    async fn append_to_stream(
        &self,
        stream_uuid: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<Vec<i64>, Self::Error>;

    /// Reads up to `count` events from a single stream, with
    /// `stream_version >= from_version + 1`, ordered by ascending
    /// `stream_version`.
    ///
    /// Fewer than `count` events means the stream tail was reached.
    async fn read_stream_forward(
        &self,
        stream_uuid: &str,
        from_version: i64,
        count: usize,
    ) -> Result<Vec<RecordedEvent>, Self::Error>;

    /// Reads up to `count` events across all streams, with
    /// `event_number >= from_event_number + 1`, ordered by ascending
    /// `event_number`.
    ///
    /// Fewer than `count` events means the global tail was reached.
    async fn read_all_forward(
        &self,
        from_event_number: i64,
        count: usize,
    ) -> Result<Vec<RecordedEvent>, Self::Error>;

    /// Returns the subscription row for `(stream_uuid, name)`, creating it
    /// with the provided starting cursor if it does not exist yet.
    ///
    /// An existing row is returned unchanged: the starting position only
    /// applies on first creation.
    async fn locate_or_create_subscription(
        &self,
        stream_uuid: &str,
        name: &str,
        start_event_number: i64,
        start_stream_version: i64,
    ) -> Result<SubscriptionRow, Self::Error>;

    /// Persists the acknowledged cursor pair of a subscription.
    async fn update_cursor(
        &self,
        stream_uuid: &str,
        name: &str,
        event_number: i64,
        stream_version: i64,
    ) -> Result<(), Self::Error>;

    /// Deletes the subscription row for `(stream_uuid, name)`.
    async fn delete_subscription(&self, stream_uuid: &str, name: &str)
        -> Result<(), Self::Error>;

    /// Attempts to acquire the session-scoped advisory lock keyed by the
    /// subscription's internal id. Non-blocking: returns `false` when the
    /// lock is held elsewhere.
    async fn try_advisory_lock(&self, subscription_id: i64) -> Result<bool, Self::Error>;

    /// Releases an advisory lock previously acquired through
    /// [`try_advisory_lock`](EventStore::try_advisory_lock).
    ///
    /// Loss of the owning session releases the lock implicitly.
    async fn advisory_unlock(&self, subscription_id: i64) -> Result<(), Self::Error>;

    /// Subscribes to the broadcast bus announcing committed events,
    /// filtered down to the streams observed by `selector`.
    fn subscribe_to_bus(&self, selector: &StreamSelector) -> Notifications;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_expected_version_never_conflicts() {
        assert!(ExpectedVersion::Any.check(0).is_ok());
        assert!(ExpectedVersion::Any.check(42).is_ok());
    }

    #[test]
    fn exact_expected_version_conflicts_on_mismatch() {
        assert!(ExpectedVersion::Exact(3).check(3).is_ok());

        assert_eq!(
            ExpectedVersion::Exact(3).check(5),
            Err(WrongExpectedVersion {
                expected: 3,
                actual: 5
            })
        );
    }
}
