//! `everstream` is an append-only event store with durable, resumable,
//! pull-style subscriptions.
//!
//! Events are appended to logical streams and receive two dense,
//! monotonic orderings on commit: a global `event_number` and a
//! per-stream `stream_version`. Consumers subscribe to a single stream
//! or to the union of all streams (`$all`), receive events strictly in
//! order, and acknowledge them to advance a durable cursor.
//!
//! ## Components
//!
//! * [`store::EventStore`] — the storage port: appends, forward reads,
//!   subscription cursors, advisory locks, and the committed-events bus.
//!   [`inmemory::InMemoryEventStore`] implements it in-process; the
//!   `everstream-postgres` crate implements it over PostgreSQL.
//! * [`subscription::Subscription`] — the subscription engine: catches
//!   up from the durable cursor, transitions to live notifications
//!   without duplication or gaps, and bounds in-flight events until the
//!   consumer acknowledges them.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use everstream::event::{EventData, StreamSelector};
//! use everstream::inmemory::InMemoryEventStore;
//! use everstream::store::{EventStore, ExpectedVersion};
//! use everstream::subscription::{Subscription, SubscriptionMessage, SubscriptionOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryEventStore::default());
//!
//! store
//!     .append_to_stream(
//!         "account-1",
//!         ExpectedVersion::Any,
//!         vec![EventData::new("account_opened", b"{}".to_vec())],
//!     )
//!     .await
//!     .unwrap();
//!
//! let mut subscription = Subscription::subscribe(
//!     store,
//!     StreamSelector::new("account-1"),
//!     "example",
//!     SubscriptionOptions::default(),
//! )
//! .await
//! .unwrap();
//!
//! while let Some(message) = subscription.next().await {
//!     match message {
//!         SubscriptionMessage::Events(events) => {
//!             for event in &events {
//!                 println!("{}: {}", event.stream_version, event.event_type);
//!             }
//!             let last = events.last().unwrap();
//!             subscription.ack(last.event_number, last.stream_version).await;
//!         }
//!         SubscriptionMessage::CaughtUp { .. } => break,
//!     }
//! }
//! # }
//! ```

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod event;
pub mod inmemory;
pub mod notify;
pub mod store;
pub mod subscription;
