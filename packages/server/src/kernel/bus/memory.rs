//! In-memory event bus used by tests and single-process setups.
//!
//! Same contract as the Postgres bus: an append-only log assigns monotone
//! ids, live delivery goes over a broadcast channel, and undelivered rows
//! can be swept and re-broadcast.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use crate::common::OrchestratorResult;

use super::{EventBus, EventRecord, EventStream, NewEvent, Topic};

struct Log {
    events: Vec<EventRecord>,
    next_id: i64,
}

#[derive(Clone)]
pub struct MemoryEventBus {
    log: Arc<Mutex<Log>>,
    tx: broadcast::Sender<EventRecord>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            log: Arc::new(Mutex::new(Log { events: Vec::new(), next_id: 1 })),
            tx,
        }
    }

    /// All persisted events, oldest first. Test helper.
    pub fn all_events(&self) -> Vec<EventRecord> {
        self.log.lock().expect("bus log poisoned").events.clone()
    }

    /// Persisted events for one topic. Test helper.
    pub fn events_for(&self, topic: Topic) -> Vec<EventRecord> {
        self.all_events()
            .into_iter()
            .filter(|e| e.topic == topic.as_str())
            .collect()
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn emit(&self, event: NewEvent) -> OrchestratorResult<EventRecord> {
        let record = {
            let mut log = self.log.lock().expect("bus log poisoned");
            let record = EventRecord {
                id: log.next_id,
                topic: event.topic.as_str().to_string(),
                payload: event.payload,
                basket_id: event.basket_id,
                workspace_id: event.workspace_id,
                origin: event.origin,
                actor_id: event.actor_id,
                ts: Utc::now(),
                delivered_at: None,
            };
            log.next_id += 1;
            log.events.push(record.clone());
            record
        };

        // Nobody listening is fine; the log is the source of truth.
        let _ = self.tx.send(record.clone());
        Ok(record)
    }

    async fn subscribe(&self, topics: &[Topic]) -> OrchestratorResult<EventStream> {
        let wanted: Vec<String> = topics.iter().map(|t| t.as_str().to_string()).collect();
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(256);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if wanted.contains(&event.topic) && out_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    // Lagged consumers recover through replay_after.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out_rx)
    }

    async fn replay_after(
        &self,
        cursor: i64,
        topics: &[Topic],
    ) -> OrchestratorResult<Vec<EventRecord>> {
        let wanted: Vec<&str> = topics.iter().map(Topic::as_str).collect();
        let log = self.log.lock().expect("bus log poisoned");
        Ok(log
            .events
            .iter()
            .filter(|e| e.id > cursor && wanted.contains(&e.topic.as_str()))
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, event_id: i64) -> OrchestratorResult<()> {
        let mut log = self.log.lock().expect("bus log poisoned");
        if let Some(event) = log.events.iter_mut().find(|e| e.id == event_id) {
            event.delivered_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn sweep_undelivered(
        &self,
        threshold: Duration,
    ) -> OrchestratorResult<Vec<EventRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let stale: Vec<EventRecord> = {
            let log = self.log.lock().expect("bus log poisoned");
            log.events
                .iter()
                .filter(|e| e.delivered_at.is_none() && e.ts < cutoff)
                .cloned()
                .collect()
        };
        for event in &stale {
            let _ = self.tx.send(event.clone());
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BasketId, WorkspaceId};
    use crate::kernel::bus::DumpCreatedPayload;
    use crate::common::DumpId;

    fn dump_event() -> NewEvent {
        let workspace_id = WorkspaceId::new();
        let basket_id = BasketId::new();
        NewEvent::new(
            Topic::DumpCreated,
            &DumpCreatedPayload { dump_id: DumpId::new(), basket_id, workspace_id },
        )
        .unwrap()
        .scoped(workspace_id, Some(basket_id))
    }

    #[tokio::test]
    async fn emit_assigns_monotone_ids() {
        let bus = MemoryEventBus::new();
        let a = bus.emit(dump_event()).await.unwrap();
        let b = bus.emit(dump_event()).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn subscribers_only_see_their_topics() {
        let bus = MemoryEventBus::new();
        let mut stream = bus.subscribe(&[Topic::SubstrateCommitted]).await.unwrap();

        bus.emit(dump_event()).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stream.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn replay_returns_events_after_cursor() {
        let bus = MemoryEventBus::new();
        let first = bus.emit(dump_event()).await.unwrap();
        let second = bus.emit(dump_event()).await.unwrap();

        let replayed = bus.replay_after(first.id, &[Topic::DumpCreated]).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, second.id);
    }

    #[tokio::test]
    async fn sweep_rebroadcasts_only_stale_undelivered() {
        let bus = MemoryEventBus::new();
        let stale = bus.emit(dump_event()).await.unwrap();
        let handled = bus.emit(dump_event()).await.unwrap();
        bus.mark_delivered(handled.id).await.unwrap();

        let swept = bus.sweep_undelivered(Duration::from_secs(0)).await.unwrap();
        let ids: Vec<i64> = swept.iter().map(|e| e.id).collect();
        assert!(ids.contains(&stale.id));
        assert!(!ids.contains(&handled.id));
    }
}
