//! Contains the `LISTEN` task bridging Postgres commit notifications
//! onto the in-process [`EventBus`].
//!
//! Appends announce their committed range with `pg_notify`; the payload
//! carries positions only, so it never hits the notification size
//! limit. This task re-reads the committed range through the pool and
//! publishes the full events on the bus, preserving commit order.

use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_postgres::{AsyncMessage, NoTls};

use everstream::notify::EventBus;

use crate::store::row_to_event;

/// Notification channel used for committed-events announcements.
pub(crate) const CHANNEL: &str = "everstream_events";

const FETCH_RANGE: &str = "SELECT e.event_id, e.event_number, s.stream_uuid,
        e.stream_version, e.event_type, e.correlation_id, e.causation_id,
        e.data, e.metadata, e.created_at
    FROM events e JOIN streams s ON s.stream_id = e.stream_id
    WHERE e.event_number >= $1 AND e.event_number <= $2
    ORDER BY e.event_number ASC";

/// `NOTIFY` payload announcing one committed append.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct NotificationPayload {
    pub(crate) stream_uuid: String,
    pub(crate) first_event_number: i64,
    pub(crate) last_event_number: i64,
}

/// Opens a dedicated `LISTEN` session and spawns the forwarding task.
pub(crate) async fn spawn(
    dsn: &str,
    pool: Pool<PostgresConnectionManager<NoTls>>,
    bus: EventBus,
) -> Result<(), tokio_postgres::Error> {
    let (client, mut connection) = tokio_postgres::connect(dsn, NoTls).await?;

    let client = std::sync::Arc::new(client);
    let client_captured = client.clone();

    let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));

    tokio::spawn(async move {
        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(error) => {
                    tracing::error!(error = %error, "listener connection failed");
                    break;
                }
            };

            if let AsyncMessage::Notification(notification) = message {
                forward(notification.payload(), &pool, &bus).await;
            }
        }

        // Without the LISTEN session no commit can be announced; close
        // the bus so live subscriptions terminate instead of hanging.
        bus.close();

        // Keep the listening session alive for as long as the task runs.
        drop(client_captured);
    });

    client
        .batch_execute(&("LISTEN ".to_owned() + CHANNEL + ";"))
        .await?;

    Ok(())
}

async fn forward(payload: &str, pool: &Pool<PostgresConnectionManager<NoTls>>, bus: &EventBus) {
    let payload: NotificationPayload = match serde_json::from_str(payload) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(error = %error, "discarding undecodable notification payload");
            return;
        }
    };

    let client = match pool.get().await {
        Ok(client) => client,
        Err(error) => {
            tracing::error!(error = %error, "failed to get a connection to fetch notified events");
            return;
        }
    };

    let rows = match client
        .query(
            FETCH_RANGE,
            &[&payload.first_event_number, &payload.last_event_number],
        )
        .await
    {
        Ok(rows) => rows,
        Err(error) => {
            tracing::error!(error = %error, "failed to fetch notified events");
            return;
        }
    };

    let mut events = Vec::with_capacity(rows.len());

    for row in &rows {
        match row_to_event(row) {
            Ok(event) => events.push(event),
            Err(error) => {
                tracing::error!(error = %error, "failed to decode notified event");
                return;
            }
        }
    }

    bus.publish(payload.stream_uuid, events);
}
