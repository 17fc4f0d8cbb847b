//! State machine driving a single subscription.
//!
//! Transitions are computed synchronously and return the [`Effect`]s the
//! owning task must perform afterwards. The task processes one message
//! at a time, so every transition observes a consistent cursor pair.

use std::collections::VecDeque;

use crate::event::{RecordedEvent, StreamSelector};

/// Lifecycle states of a subscription.
///
/// `Subscribed { overflowing: true }` suppresses live pushes until acks
/// shrink the in-flight window below `max_in_flight`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum State {
    Initial,
    SubscribeToEvents,
    CatchingUp,
    Subscribed { overflowing: bool },
    Unsubscribed,
}

/// I/O the task must carry out after a transition, in order.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Effect {
    /// Push a batch to the subscriber channel.
    Deliver(Vec<RecordedEvent>),

    /// Tell the subscriber historical replay has completed at `cursor`.
    NotifyCaughtUp { cursor: i64 },

    /// Persist the acknowledged cursor pair.
    PersistCursor { event_number: i64, stream_version: i64 },

    /// Publish the acknowledged watermark to the catch-up worker.
    AckWatermark(i64),
}

/// Unrecoverable conditions detected by a transition.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Fatal {
    /// The event source handed over an event that does not strictly
    /// advance the cursor. Indicates storage corruption.
    OrderingViolation { last_seen: i64, got: i64 },

    /// The pending buffer exceeded its configured bound.
    BufferOverflow { capacity: usize },
}

pub(super) struct StateMachine {
    selector: StreamSelector,
    state: State,
    last_seen: i64,
    last_ack: i64,
    max_in_flight: usize,
    buffer: VecDeque<RecordedEvent>,
    buffer_capacity: usize,
    // Completion cursor reported by the worker while acks were still
    // outstanding; honored once last_ack reaches it.
    pending_caught_up: Option<i64>,
}

impl StateMachine {
    pub(super) fn new(
        selector: StreamSelector,
        max_in_flight: usize,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            selector,
            state: State::Initial,
            last_seen: 0,
            last_ack: 0,
            max_in_flight,
            buffer: VecDeque::new(),
            buffer_capacity,
            pending_caught_up: None,
        }
    }

    pub(super) fn state(&self) -> State {
        self.state
    }

    pub(super) fn last_seen(&self) -> i64 {
        self.last_seen
    }

    pub(super) fn last_ack(&self) -> i64 {
        self.last_ack
    }

    fn in_flight(&self) -> usize {
        (self.last_seen - self.last_ack).max(0) as usize
    }

    /// The subscription row has been located or created: both cursors
    /// resume from it.
    pub(super) fn row_loaded(&mut self, cursor: i64) {
        debug_assert_eq!(self.state, State::Initial);

        self.last_seen = cursor;
        self.last_ack = cursor;
        self.state = State::SubscribeToEvents;
    }

    /// The advisory lock has been acquired: historical replay may start.
    pub(super) fn lock_acquired(&mut self) {
        debug_assert_eq!(self.state, State::SubscribeToEvents);

        self.state = State::CatchingUp;
    }

    /// A batch read by the catch-up worker. Delivered as-is: the batch
    /// size is the in-flight bound during replay.
    pub(super) fn catch_up_batch(
        &mut self,
        events: Vec<RecordedEvent>,
    ) -> Result<Vec<Effect>, Fatal> {
        debug_assert_eq!(self.state, State::CatchingUp);

        let mut cursor = self.last_seen;

        for event in &events {
            let got = self.selector.cursor(event);

            if got <= cursor {
                return Err(Fatal::OrderingViolation {
                    last_seen: cursor,
                    got,
                });
            }

            cursor = got;
        }

        if events.is_empty() {
            return Ok(Vec::new());
        }

        self.last_seen = cursor;

        Ok(vec![Effect::Deliver(events)])
    }

    /// The worker exhausted the historical log at `cursor`.
    pub(super) fn caught_up(&mut self, cursor: i64) -> Vec<Effect> {
        debug_assert_eq!(self.state, State::CatchingUp);

        if cursor > self.last_ack {
            // Outstanding acks on the final batch; defer the transition.
            self.pending_caught_up = Some(cursor);
            return Vec::new();
        }

        self.enter_subscribed(cursor)
    }

    /// Live events announced by the bus.
    pub(super) fn notify_events(
        &mut self,
        events: &[RecordedEvent],
    ) -> Result<Vec<Effect>, Fatal> {
        match self.state {
            State::CatchingUp | State::Subscribed { overflowing: true } => {
                self.buffer_events(events)?;
                Ok(Vec::new())
            }
            State::Subscribed { overflowing: false } => {
                self.buffer_events(events)?;
                Ok(self.flush_buffer())
            }
            State::Initial | State::SubscribeToEvents | State::Unsubscribed => Ok(Vec::new()),
        }
    }

    /// A consumer acknowledgment.
    ///
    /// Non-advancing acks are idempotent no-ops; everything else moves
    /// `last_ack`, persists the pair, and may resume suppressed work.
    pub(super) fn ack(&mut self, event_number: i64, stream_version: i64) -> Vec<Effect> {
        let acked = self.selector.cursor_of(event_number, stream_version);

        if acked <= self.last_ack {
            tracing::trace!(
                ack.cursor = acked,
                subscription.last_ack = self.last_ack,
                "stale ack ignored"
            );

            return Vec::new();
        }

        if acked > self.last_seen {
            tracing::warn!(
                ack.cursor = acked,
                subscription.last_seen = self.last_seen,
                "ack is ahead of the last delivered event"
            );
        }

        self.last_ack = acked;

        let mut effects = vec![
            Effect::PersistCursor {
                event_number,
                stream_version,
            },
            Effect::AckWatermark(self.last_ack),
        ];

        match self.state {
            State::Subscribed { overflowing: true } if self.in_flight() < self.max_in_flight => {
                effects.extend(self.flush_buffer());
            }
            State::CatchingUp => {
                if let Some(cursor) = self.pending_caught_up {
                    if self.last_ack >= cursor {
                        self.pending_caught_up = None;
                        effects.extend(self.enter_subscribed(cursor));
                    }
                }
            }
            _ => {}
        }

        effects
    }

    /// Terminal transition; any state may unsubscribe.
    pub(super) fn unsubscribe(&mut self) {
        self.state = State::Unsubscribed;
        self.buffer.clear();
    }

    fn enter_subscribed(&mut self, cursor: i64) -> Vec<Effect> {
        self.last_seen = cursor;
        self.state = State::Subscribed { overflowing: false };

        tracing::debug!(
            subscription.cursor = cursor,
            "historical replay complete, now live"
        );

        let mut effects = vec![Effect::NotifyCaughtUp { cursor }];
        effects.extend(self.flush_buffer());
        effects
    }

    fn buffer_events(&mut self, events: &[RecordedEvent]) -> Result<(), Fatal> {
        for event in events {
            // Live duplicates of already-seen positions are dropped here;
            // this also skips events below a start_from cursor placed
            // beyond the tail.
            let cursor = self.selector.cursor(event);

            if cursor <= self.last_seen
                || self
                    .buffer
                    .back()
                    .is_some_and(|last| self.selector.cursor(last) >= cursor)
            {
                continue;
            }

            if self.buffer.len() >= self.buffer_capacity {
                return Err(Fatal::BufferOverflow {
                    capacity: self.buffer_capacity,
                });
            }

            self.buffer.push_back(event.clone());
        }

        Ok(())
    }

    /// Delivers buffered events up to the in-flight window, and settles
    /// the `overflowing` flag from what remains.
    fn flush_buffer(&mut self) -> Vec<Effect> {
        // Entries buffered as live notifications may have been read and
        // delivered by replay in the meantime; the insert-time guard
        // cannot see that, so re-check against the advanced cursor.
        while self
            .buffer
            .front()
            .is_some_and(|event| self.selector.cursor(event) <= self.last_seen)
        {
            self.buffer.pop_front();
        }

        let budget = self.max_in_flight.saturating_sub(self.in_flight());
        let take = budget.min(self.buffer.len());

        let mut effects = Vec::new();

        if take > 0 {
            let batch: Vec<RecordedEvent> = self.buffer.drain(..take).collect();

            self.last_seen = self
                .selector
                .cursor(batch.last().expect("drained batch is non-empty"));

            effects.push(Effect::Deliver(batch));
        }

        self.state = State::Subscribed {
            overflowing: !self.buffer.is_empty() || self.in_flight() >= self.max_in_flight,
        };

        effects
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn stream_event(stream_version: i64) -> RecordedEvent {
        RecordedEvent {
            event_id: Uuid::new_v4(),
            event_number: stream_version,
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

    fn machine(max_in_flight: usize) -> StateMachine {
        let mut machine = StateMachine::new(
            StreamSelector::new("stream-1"),
            max_in_flight,
            1024,
        );
        machine.row_loaded(0);
        machine.lock_acquired();
        machine
    }

    fn delivered(effects: &[Effect]) -> Vec<i64> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Deliver(events) => {
                    Some(events.iter().map(|event| event.stream_version))
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn catch_up_batches_advance_last_seen_to_the_batch_tail() {
        let mut machine = machine(100);

        let effects = machine
            .catch_up_batch(vec![stream_event(1), stream_event(2), stream_event(3)])
            .unwrap();

        assert_eq!(delivered(&effects), vec![1, 2, 3]);
        assert_eq!(machine.last_seen(), 3);
        assert_eq!(machine.last_ack(), 0);
    }

    #[test]
    fn out_of_order_source_events_are_fatal() {
        let mut machine = machine(100);

        let fatal = machine
            .catch_up_batch(vec![stream_event(1), stream_event(1)])
            .unwrap_err();

        assert_eq!(
            fatal,
            Fatal::OrderingViolation {
                last_seen: 1,
                got: 1
            }
        );
    }

    #[test]
    fn caught_up_with_outstanding_acks_is_deferred_until_acked() {
        let mut machine = machine(100);

        machine
            .catch_up_batch(vec![stream_event(1), stream_event(2)])
            .unwrap();

        assert!(machine.caught_up(2).is_empty());
        assert_eq!(machine.state(), State::CatchingUp);

        let effects = machine.ack(2, 2);
        assert!(effects.contains(&Effect::NotifyCaughtUp { cursor: 2 }));
        assert_eq!(machine.state(), State::Subscribed { overflowing: false });
        assert_eq!(machine.last_seen(), 2);
        assert_eq!(machine.last_ack(), 2);
    }

    #[test]
    fn live_events_buffered_during_catch_up_are_flushed_after_the_boundary() {
        let mut machine = machine(100);

        machine.catch_up_batch(vec![stream_event(1)]).unwrap();

        // Live tail overlaps the historical read; 1 is a duplicate.
        machine
            .notify_events(&[stream_event(1), stream_event(2), stream_event(3)])
            .unwrap();

        machine.ack(1, 1);

        let effects = machine.caught_up(1);
        assert!(effects.contains(&Effect::NotifyCaughtUp { cursor: 1 }));
        assert_eq!(delivered(&effects), vec![2, 3]);
        assert_eq!(machine.last_seen(), 3);
    }

    #[test]
    fn buffered_live_events_later_read_by_replay_are_not_redelivered() {
        let mut machine = machine(100);

        machine
            .catch_up_batch(vec![stream_event(1), stream_event(2), stream_event(3)])
            .unwrap();

        // A commit lands while replay is still behind it: buffered live.
        machine.notify_events(&[stream_event(4)]).unwrap();

        machine.ack(3, 3);

        // The worker's next read picks up the same event from the store.
        let effects = machine.catch_up_batch(vec![stream_event(4)]).unwrap();
        assert_eq!(delivered(&effects), vec![4]);

        machine.ack(4, 4);

        let effects = machine.caught_up(4);
        assert!(effects.contains(&Effect::NotifyCaughtUp { cursor: 4 }));
        assert!(
            delivered(&effects).is_empty(),
            "the buffered copy of an already-replayed event must be dropped"
        );
        assert_eq!(machine.state(), State::Subscribed { overflowing: false });
        assert_eq!(machine.last_seen(), 4);
    }

    #[test]
    fn live_delivery_stalls_at_the_in_flight_bound() {
        let mut machine = machine(3);
        let effects = machine.caught_up(0);
        assert!(effects.contains(&Effect::NotifyCaughtUp { cursor: 0 }));

        let effects = machine
            .notify_events(&[stream_event(1), stream_event(2), stream_event(3)])
            .unwrap();
        assert_eq!(delivered(&effects), vec![1, 2, 3]);
        assert_eq!(machine.state(), State::Subscribed { overflowing: true });

        // Window is full: the next group is buffered, not delivered.
        let effects = machine
            .notify_events(&[stream_event(4), stream_event(5), stream_event(6)])
            .unwrap();
        assert!(delivered(&effects).is_empty());

        let effects = machine.ack(3, 3);
        assert_eq!(delivered(&effects), vec![4, 5, 6]);
        assert_eq!(machine.state(), State::Subscribed { overflowing: true });

        assert!(machine.ack(6, 6).iter().all(|effect| !matches!(
            effect,
            Effect::Deliver(_) | Effect::NotifyCaughtUp { .. }
        )));
        assert_eq!(machine.state(), State::Subscribed { overflowing: false });
    }

    #[test]
    fn stale_acks_are_ignored_without_effects() {
        let mut machine = machine(100);

        machine.catch_up_batch(vec![stream_event(1), stream_event(2)]).unwrap();
        assert!(!machine.ack(2, 2).is_empty());

        assert!(machine.ack(2, 2).is_empty());
        assert!(machine.ack(1, 1).is_empty());
        assert_eq!(machine.last_ack(), 2);
    }

    #[test]
    fn buffer_overflow_is_fatal() {
        let mut machine = StateMachine::new(StreamSelector::new("stream-1"), 1, 2);
        machine.row_loaded(0);
        machine.lock_acquired();
        machine.caught_up(0);

        machine.notify_events(&[stream_event(1)]).unwrap();

        let fatal = machine
            .notify_events(&[stream_event(2), stream_event(3), stream_event(4)])
            .unwrap_err();

        assert_eq!(fatal, Fatal::BufferOverflow { capacity: 2 });
    }
}
