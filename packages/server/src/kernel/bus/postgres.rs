//! Postgres-backed event bus.
//!
//! One physical `NOTIFY` channel (`bus_any`) carries `{event_id, topic}`
//! envelopes; subscribers filter by topic and fetch the durable row by id.
//! The insert always happens before the notify, and a periodic sweep
//! re-notifies rows that were persisted but never handled.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::common::OrchestratorResult;

use super::{EventBus, EventRecord, EventStream, NewEvent, Topic};

const CHANNEL: &str = "bus_any";

/// Envelope published on the notification channel.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    event_id: i64,
    topic: String,
}

#[derive(Clone)]
pub struct PostgresEventBus {
    pool: PgPool,
}

impl PostgresEventBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn notify(&self, event_id: i64, topic: &str) {
        let envelope = Envelope { event_id, topic: topic.to_string() };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event_id, error = %err, "failed to encode bus envelope");
                return;
            }
        };
        // Notification failures are recovered by the sweeper.
        if let Err(err) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await
        {
            warn!(event_id, error = %err, "bus notify failed, sweeper will retry");
        }
    }

    async fn fetch(&self, event_id: i64) -> OrchestratorResult<Option<EventRecord>> {
        let record = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, topic, payload, basket_id, workspace_id, origin, actor_id, ts, delivered_at
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

#[async_trait]
impl EventBus for PostgresEventBus {
    async fn emit(&self, event: NewEvent) -> OrchestratorResult<EventRecord> {
        let record = sqlx::query_as::<_, EventRecord>(
            r#"
            INSERT INTO events (topic, payload, basket_id, workspace_id, origin, actor_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, topic, payload, basket_id, workspace_id, origin, actor_id, ts, delivered_at
            "#,
        )
        .bind(event.topic.as_str())
        .bind(&event.payload)
        .bind(event.basket_id)
        .bind(event.workspace_id)
        .bind(&event.origin)
        .bind(event.actor_id)
        .fetch_one(&self.pool)
        .await?;

        self.notify(record.id, &record.topic).await;

        debug!(event_id = record.id, topic = %record.topic, "event emitted");
        Ok(record)
    }

    async fn subscribe(&self, topics: &[Topic]) -> OrchestratorResult<EventStream> {
        let wanted: Vec<String> = topics.iter().map(|t| t.as_str().to_string()).collect();
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(crate::common::OrchestratorError::from)?;
        listener
            .listen(CHANNEL)
            .await
            .map_err(crate::common::OrchestratorError::from)?;

        let (tx, rx) = mpsc::channel(256);
        let bus = self.clone();

        tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(err) => {
                        warn!(error = %err, "bus listener dropped, subscriber must replay");
                        break;
                    }
                };

                let envelope: Envelope = match serde_json::from_str(notification.payload()) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(error = %err, raw = notification.payload(), "bad bus envelope");
                        continue;
                    }
                };

                if !wanted.contains(&envelope.topic) {
                    continue;
                }

                match bus.fetch(envelope.event_id).await {
                    Ok(Some(record)) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!(event_id = envelope.event_id, "notified event row missing");
                    }
                    Err(err) => {
                        warn!(event_id = envelope.event_id, error = %err, "event fetch failed");
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn replay_after(
        &self,
        cursor: i64,
        topics: &[Topic],
    ) -> OrchestratorResult<Vec<EventRecord>> {
        let wanted: Vec<String> = topics.iter().map(|t| t.as_str().to_string()).collect();
        let records = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, topic, payload, basket_id, workspace_id, origin, actor_id, ts, delivered_at
            FROM events
            WHERE id > $1 AND topic = ANY($2)
            ORDER BY id ASC
            "#,
        )
        .bind(cursor)
        .bind(&wanted)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn mark_delivered(&self, event_id: i64) -> OrchestratorResult<()> {
        sqlx::query("UPDATE events SET delivered_at = NOW() WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_undelivered(
        &self,
        threshold: Duration,
    ) -> OrchestratorResult<Vec<EventRecord>> {
        let records = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, topic, payload, basket_id, workspace_id, origin, actor_id, ts, delivered_at
            FROM events
            WHERE delivered_at IS NULL
              AND ts < NOW() - make_interval(secs => $1)
            ORDER BY id ASC
            "#,
        )
        .bind(threshold.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        for record in &records {
            self.notify(record.id, &record.topic).await;
        }

        Ok(records)
    }
}
