//! Contains the Event data model used across the crate.
//!
//! Events are appended to logical streams identified by an opaque
//! stream uuid, and receive two orderings on commit: a globally dense
//! `event_number`, and a per-stream dense `stream_version`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stream uuid sentinel identifying the union of all streams.
pub const ALL_STREAMS: &str = "$all";

/// A new event to be appended to a stream.
///
/// Payload and metadata are opaque to the store: serialization concerns
/// belong to the application appending the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// Application-defined event type discriminator.
    pub event_type: String,

    /// Id correlating this event with others belonging to the same unit
    /// of work, if any.
    pub correlation_id: Option<Uuid>,

    /// Id of the event that caused this one, if any.
    pub causation_id: Option<Uuid>,

    /// Opaque event payload.
    pub data: Vec<u8>,

    /// Opaque event metadata.
    pub metadata: Vec<u8>,
}

impl EventData {
    /// Creates a new event payload with the specified type discriminator.
    pub fn new(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id: None,
            causation_id: None,
            data,
            metadata: Vec::new(),
        }
    }

    /// Sets the correlation id on the event payload.
    #[must_use]
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Sets the causation id on the event payload.
    #[must_use]
    pub fn causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Sets the metadata bytes on the event payload.
    #[must_use]
    pub fn metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An event that has been committed to the store.
///
/// Immutable once persisted: the store never updates or deletes
/// recorded events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique id assigned on commit.
    pub event_id: Uuid,

    /// Globally dense, monotonic position assigned on commit, starting at 1.
    pub event_number: i64,

    /// Uuid of the stream the event belongs to.
    pub stream_uuid: String,

    /// Per-stream dense, monotonic position, starting at 1.
    pub stream_version: i64,

    /// Application-defined event type discriminator.
    pub event_type: String,

    /// Id correlating this event with others belonging to the same unit
    /// of work, if any.
    pub correlation_id: Option<Uuid>,

    /// Id of the event that caused this one, if any.
    pub causation_id: Option<Uuid>,

    /// Opaque event payload.
    pub data: Vec<u8>,

    /// Opaque event metadata.
    pub metadata: Vec<u8>,

    /// Commit timestamp.
    pub created_at: DateTime<Utc>,
}

/// Selects the events a subscription observes: a single stream,
/// or the union of all streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamSelector {
    /// Every stream in the store, ordered by `event_number`.
    All,

    /// A single stream, ordered by `stream_version`.
    Stream(String),
}

impl StreamSelector {
    /// Creates a selector for the specified stream uuid, mapping the
    /// [`ALL_STREAMS`] sentinel to [`StreamSelector::All`].
    pub fn new(stream_uuid: impl Into<String>) -> Self {
        let stream_uuid = stream_uuid.into();

        if stream_uuid == ALL_STREAMS {
            Self::All
        } else {
            Self::Stream(stream_uuid)
        }
    }

    /// The stream uuid this selector is persisted under.
    pub fn stream_uuid(&self) -> &str {
        match self {
            Self::All => ALL_STREAMS,
            Self::Stream(uuid) => uuid,
        }
    }

    /// The active cursor scalar of an event under this selector:
    /// `stream_version` for a single stream, `event_number` for `$all`.
    pub fn cursor(&self, event: &RecordedEvent) -> i64 {
        match self {
            Self::All => event.event_number,
            Self::Stream(_) => event.stream_version,
        }
    }

    /// The active cursor scalar of a `(event_number, stream_version)` pair
    /// under this selector.
    pub fn cursor_of(&self, event_number: i64, stream_version: i64) -> i64 {
        match self {
            Self::All => event_number,
            Self::Stream(_) => stream_version,
        }
    }

    /// Whether an event committed to `stream_uuid` is observed by
    /// this selector.
    pub fn matches(&self, stream_uuid: &str) -> bool {
        match self {
            Self::All => true,
            Self::Stream(uuid) => uuid == stream_uuid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_number: i64, stream_version: i64) -> RecordedEvent {
        RecordedEvent {
            event_id: Uuid::new_v4(),
            event_number,
            stream_uuid: "stream-1".to_owned(),
            stream_version,
            event_type: "test".to_owned(),
            correlation_id: None,
            causation_id: None,
            data: Vec::new(),
            metadata: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn all_streams_sentinel_maps_to_the_all_selector() {
        assert_eq!(StreamSelector::new("$all"), StreamSelector::All);
        assert_eq!(
            StreamSelector::new("stream-1"),
            StreamSelector::Stream("stream-1".to_owned())
        );
    }

    #[test]
    fn active_cursor_depends_on_the_selector_kind() {
        let event = event(42, 7);

        assert_eq!(StreamSelector::All.cursor(&event), 42);
        assert_eq!(StreamSelector::new("stream-1").cursor(&event), 7);
    }

    #[test]
    fn single_stream_selector_only_matches_its_own_stream() {
        let selector = StreamSelector::new("stream-1");

        assert!(selector.matches("stream-1"));
        assert!(!selector.matches("stream-2"));
        assert!(StreamSelector::All.matches("stream-2"));
    }
}
