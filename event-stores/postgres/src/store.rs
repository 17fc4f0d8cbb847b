//! Contains the [`EventStore`] implementation using PostgreSQL
//! as the backend data store.

use std::collections::HashSet;
use std::ops::DerefMut;
use std::sync::Arc;

use async_trait::async_trait;
use bb8::{Pool, RunError};
use bb8_postgres::PostgresConnectionManager;
use parking_lot::Mutex;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use everstream::event::{EventData, RecordedEvent, StreamSelector};
use everstream::notify::{EventBus, Notifications};
use everstream::store::{EventStore, ExpectedVersion, SubscriptionRow, WrongExpectedVersion};

use crate::listener::{self, NotificationPayload};

/// Embedded migrations module.
mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("src/migrations");
}

/// Result returning the crate [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by the [`PostgresEventStore`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An [`ExpectedVersion::Exact`] check failed on append.
    #[error(transparent)]
    Conflict(#[from] WrongExpectedVersion),

    /// Error returned by Postgres when executing queries.
    #[error("postgres client returned an error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Error returned by the bb8 connection pool.
    #[error("bb8 connection pool returned an error: {0}")]
    Pool(#[from] RunError<tokio_postgres::Error>),

    /// Error returned while running the embedded database migrations.
    #[error("failed to run database migrations: {0}")]
    Migrate(#[from] refinery::Error),

    /// Error while encoding the `NOTIFY` payload announcing a commit.
    #[error("failed to encode notification payload: {0}")]
    EncodePayload(#[source] serde_json::Error),
}

// Serializes appends so both global and per-stream orderings stay dense.
// Negative sentinel: subscription locks use positive subscription ids in
// the same key space.
const APPEND_SERIALIZATION_KEY: i64 = -1;

const CREATE_STREAM: &str = "INSERT INTO streams (stream_uuid) VALUES ($1)
    ON CONFLICT (stream_uuid) DO UPDATE SET stream_uuid = EXCLUDED.stream_uuid
    RETURNING stream_id";

const CURRENT_STREAM_VERSION: &str =
    "SELECT COALESCE(MAX(stream_version), 0) FROM events WHERE stream_id = $1";

const LAST_EVENT_NUMBER: &str = "SELECT COALESCE(MAX(event_number), 0) FROM events";

const INSERT_EVENT: &str = "INSERT INTO events
    (event_id, event_number, stream_id, stream_version, event_type,
     correlation_id, causation_id, data, metadata)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

const READ_STREAM_FORWARD: &str = "SELECT e.event_id, e.event_number, s.stream_uuid,
        e.stream_version, e.event_type, e.correlation_id, e.causation_id,
        e.data, e.metadata, e.created_at
    FROM events e JOIN streams s ON s.stream_id = e.stream_id
    WHERE s.stream_uuid = $1 AND e.stream_version > $2
    ORDER BY e.stream_version ASC
    LIMIT $3";

const READ_ALL_FORWARD: &str = "SELECT e.event_id, e.event_number, s.stream_uuid,
        e.stream_version, e.event_type, e.correlation_id, e.causation_id,
        e.data, e.metadata, e.created_at
    FROM events e JOIN streams s ON s.stream_id = e.stream_id
    WHERE e.event_number > $1
    ORDER BY e.event_number ASC
    LIMIT $2";

const CREATE_SUBSCRIPTION: &str = "INSERT INTO subscriptions
    (stream_uuid, subscription_name, last_seen_event_number, last_seen_stream_version)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (stream_uuid, subscription_name) DO NOTHING
    RETURNING subscription_id, stream_uuid, subscription_name,
        last_seen_event_number, last_seen_stream_version, created_at";

const LOCATE_SUBSCRIPTION: &str = "SELECT subscription_id, stream_uuid, subscription_name,
        last_seen_event_number, last_seen_stream_version, created_at
    FROM subscriptions
    WHERE stream_uuid = $1 AND subscription_name = $2";

const UPDATE_CURSOR: &str = "UPDATE subscriptions
    SET last_seen_event_number = $3, last_seen_stream_version = $4
    WHERE stream_uuid = $1 AND subscription_name = $2";

const DELETE_SUBSCRIPTION: &str =
    "DELETE FROM subscriptions WHERE stream_uuid = $1 AND subscription_name = $2";

const TRY_ADVISORY_LOCK: &str = "SELECT pg_try_advisory_lock($1)";

const ADVISORY_UNLOCK: &str = "SELECT pg_advisory_unlock($1)";

/// [`EventStore`] implementation using a PostgreSQL backend.
///
/// Queries run on a `bb8` connection pool. Advisory locks live on a
/// dedicated session connection, so every lock is released at once if
/// the process loses its database connection. Committed events are
/// announced with `pg_notify` and re-broadcast on an in-process
/// [`EventBus`] by a `LISTEN` task.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
    lock_client: Arc<tokio_postgres::Client>,
    // Advisory locks are reentrant within one session; this set keeps
    // same-process subscribers mutually exclusive too.
    held_locks: Arc<Mutex<HashSet<i64>>>,
    bus: EventBus,
}

impl PostgresEventStore {
    /// Connects to the database pointed by the DSN, runs the embedded
    /// migrations, and starts the `LISTEN` task feeding the event bus.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let manager = PostgresConnectionManager::new_from_stringlike(dsn, NoTls)?;
        let pool = Pool::builder().build(manager).await?;

        {
            let mut connection = pool.get().await?;
            embedded::migrations::runner()
                .run_async(connection.deref_mut())
                .await?;
        }

        let (lock_client, lock_connection) = tokio_postgres::connect(dsn, NoTls).await?;

        let bus = EventBus::default();

        let bus_captured = bus.clone();
        tokio::spawn(async move {
            if let Err(error) = lock_connection.await {
                tracing::error!(error = %error, "advisory lock connection failed");
            }

            // Session-scoped locks die with this connection: close the
            // bus so every live subscription terminates rather than
            // keep delivering without its lock.
            bus_captured.close();
        });

        listener::spawn(dsn, pool.clone(), bus.clone()).await?;

        Ok(Self {
            pool,
            lock_client: Arc::new(lock_client),
            held_locks: Arc::default(),
            bus,
        })
    }
}

/// Decodes an event row selected by the `READ_*` queries.
pub(crate) fn row_to_event(row: &Row) -> std::result::Result<RecordedEvent, tokio_postgres::Error> {
    Ok(RecordedEvent {
        event_id: row.try_get("event_id")?,
        event_number: row.try_get("event_number")?,
        stream_uuid: row.try_get("stream_uuid")?,
        stream_version: row.try_get("stream_version")?,
        event_type: row.try_get("event_type")?,
        correlation_id: row.try_get("correlation_id")?,
        causation_id: row.try_get("causation_id")?,
        data: row.try_get("data")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_subscription(row: &Row) -> std::result::Result<SubscriptionRow, tokio_postgres::Error> {
    Ok(SubscriptionRow {
        subscription_id: row.try_get("subscription_id")?,
        stream_uuid: row.try_get("stream_uuid")?,
        subscription_name: row.try_get("subscription_name")?,
        last_seen_event_number: row.try_get("last_seen_event_number")?,
        last_seen_stream_version: row.try_get("last_seen_stream_version")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl EventStore for PostgresEventStore {
    type Error = Error;

    async fn create_stream(&self, stream_uuid: &str) -> Result<i64> {
        let client = self.pool.get().await?;
        let row = client.query_one(CREATE_STREAM, &[&stream_uuid]).await?;

        Ok(row.try_get(0)?)
    }

    async fn append_to_stream(
        &self,
        stream_uuid: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<Vec<i64>> {
        let mut connection = self.pool.get().await?;
        let tx = connection.transaction().await?;

        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&APPEND_SERIALIZATION_KEY])
            .await?;

        let stream_id: i64 = tx
            .query_one(CREATE_STREAM, &[&stream_uuid])
            .await?
            .try_get(0)?;

        let current_version: i64 = tx
            .query_one(CURRENT_STREAM_VERSION, &[&stream_id])
            .await?
            .try_get(0)?;

        expected.check(current_version)?;

        let last_event_number: i64 = tx.query_one(LAST_EVENT_NUMBER, &[]).await?.try_get(0)?;

        let mut event_numbers = Vec::with_capacity(events.len());

        for (i, event) in events.into_iter().enumerate() {
            let event_number = last_event_number + i as i64 + 1;
            let stream_version = current_version + i as i64 + 1;

            tx.execute(
                INSERT_EVENT,
                &[
                    &Uuid::new_v4(),
                    &event_number,
                    &stream_id,
                    &stream_version,
                    &event.event_type,
                    &event.correlation_id,
                    &event.causation_id,
                    &event.data,
                    &event.metadata,
                ],
            )
            .await?;

            event_numbers.push(event_number);
        }

        if let (Some(first), Some(last)) = (event_numbers.first(), event_numbers.last()) {
            let payload = serde_json::to_string(&NotificationPayload {
                stream_uuid: stream_uuid.to_owned(),
                first_event_number: *first,
                last_event_number: *last,
            })
            .map_err(Error::EncodePayload)?;

            // Delivered to LISTEN sessions on commit, in commit order.
            tx.execute("SELECT pg_notify($1, $2)", &[&listener::CHANNEL, &payload])
                .await?;
        }

        tx.commit().await?;

        Ok(event_numbers)
    }

    async fn read_stream_forward(
        &self,
        stream_uuid: &str,
        from_version: i64,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                READ_STREAM_FORWARD,
                &[&stream_uuid, &from_version, &(count as i64)],
            )
            .await?;

        rows.iter()
            .map(|row| row_to_event(row).map_err(Error::from))
            .collect()
    }

    async fn read_all_forward(
        &self,
        from_event_number: i64,
        count: usize,
    ) -> Result<Vec<RecordedEvent>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(READ_ALL_FORWARD, &[&from_event_number, &(count as i64)])
            .await?;

        rows.iter()
            .map(|row| row_to_event(row).map_err(Error::from))
            .collect()
    }

    async fn locate_or_create_subscription(
        &self,
        stream_uuid: &str,
        name: &str,
        start_event_number: i64,
        start_stream_version: i64,
    ) -> Result<SubscriptionRow> {
        let client = self.pool.get().await?;

        let inserted = client
            .query_opt(
                CREATE_SUBSCRIPTION,
                &[&stream_uuid, &name, &start_event_number, &start_stream_version],
            )
            .await?;

        let row = match inserted {
            Some(row) => row,
            // Insert conflicted: the row already exists, return it as-is.
            None => {
                client
                    .query_one(LOCATE_SUBSCRIPTION, &[&stream_uuid, &name])
                    .await?
            }
        };

        Ok(row_to_subscription(&row)?)
    }

    async fn update_cursor(
        &self,
        stream_uuid: &str,
        name: &str,
        event_number: i64,
        stream_version: i64,
    ) -> Result<()> {
        let client = self.pool.get().await?;

        client
            .execute(
                UPDATE_CURSOR,
                &[&stream_uuid, &name, &event_number, &stream_version],
            )
            .await?;

        Ok(())
    }

    async fn delete_subscription(&self, stream_uuid: &str, name: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(DELETE_SUBSCRIPTION, &[&stream_uuid, &name])
            .await?;

        Ok(())
    }

    async fn try_advisory_lock(&self, subscription_id: i64) -> Result<bool> {
        if !self.held_locks.lock().insert(subscription_id) {
            return Ok(false);
        }

        let acquired: bool = self
            .lock_client
            .query_one(TRY_ADVISORY_LOCK, &[&subscription_id])
            .await
            .and_then(|row| row.try_get(0))
            .map_err(|err| {
                self.held_locks.lock().remove(&subscription_id);
                err
            })?;

        if !acquired {
            self.held_locks.lock().remove(&subscription_id);
        }

        Ok(acquired)
    }

    async fn advisory_unlock(&self, subscription_id: i64) -> Result<()> {
        self.held_locks.lock().remove(&subscription_id);

        self.lock_client
            .query_one(ADVISORY_UNLOCK, &[&subscription_id])
            .await?;

        Ok(())
    }

    fn subscribe_to_bus(&self, selector: &StreamSelector) -> Notifications {
        self.bus.subscribe(selector)
    }
}
