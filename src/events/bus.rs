//! Message-passing boundary between the event source and the router.
//!
//! The source publishes and never waits on enrichment; a single consumer
//! task drains the channel into an [`EventSink`], normally the
//! [`EventRouter`]. Store errors during delivery are retried with a short
//! backoff; events that still fail are counted as dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::events::{Event, EventRouter, IngestReport};

/// Delivery attempts per event before it is dropped.
const DELIVERY_ATTEMPTS: u32 = 3;

/// Backoff before the first redelivery; doubles each attempt.
const REDELIVERY_DELAY: Duration = Duration::from_millis(100);

/// Sending half handed to event sources.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Event>,
}

impl EventPublisher {
    /// Queue an event. Waits when the bus is full; fails only once the
    /// consumer has stopped.
    pub async fn publish(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        debug!(event_id = %event.event_id, event_type = %event.event_type, "Event published");
        self.tx.send(event).await
    }
}

/// Bounded event channel.
pub struct EventBus;

impl EventBus {
    pub fn channel(capacity: usize) -> (EventPublisher, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventPublisher { tx }, rx)
    }
}

/// Receives events from the consumer. Delivery must be idempotent: a
/// redelivered event may have been partly accepted the first time.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &Event) -> Result<IngestReport, JobError>;
}

#[async_trait]
impl EventSink for EventRouter {
    async fn deliver(&self, event: &Event) -> Result<IngestReport, JobError> {
        self.ingest(event).await
    }
}

/// What the consumer did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub delivered: u64,
    /// Redelivery attempts after a failed delivery.
    pub retries: u64,
    /// Events abandoned after every attempt failed.
    pub dropped: u64,
}

/// Drain `rx` into `sink` until every publisher is dropped.
pub fn spawn_event_consumer(
    mut rx: mpsc::Receiver<Event>,
    sink: Arc<dyn EventSink>,
) -> tokio::task::JoinHandle<ConsumerStats> {
    tokio::spawn(async move {
        let mut stats = ConsumerStats::default();
        while let Some(event) = rx.recv().await {
            deliver_with_retry(sink.as_ref(), &event, &mut stats).await;
        }
        info!(
            delivered = stats.delivered,
            retries = stats.retries,
            dropped = stats.dropped,
            "Event consumer stopped"
        );
        stats
    })
}

async fn deliver_with_retry(sink: &dyn EventSink, event: &Event, stats: &mut ConsumerStats) {
    let mut delay = REDELIVERY_DELAY;
    for attempt in 1..=DELIVERY_ATTEMPTS {
        match sink.deliver(event).await {
            Ok(_) => {
                stats.delivered += 1;
                return;
            }
            Err(e) if attempt < DELIVERY_ATTEMPTS => {
                warn!(event_id = %event.event_id, attempt, "Event delivery failed, retrying: {e}");
                stats.retries += 1;
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                stats.dropped += 1;
                error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    attempts = DELIVERY_ATTEMPTS,
                    dropped_total = stats.dropped,
                    "Dropping event: {e}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::DatabaseError;
    use crate::events::default_route_table;
    use crate::jobs::{JobQueue, RetryPolicy};
    use crate::store::LibSqlBackend;
    use serde_json::json;

    /// Fails the first `failures` deliveries with a store error.
    struct FlakySink {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventSink for FlakySink {
        async fn deliver(&self, _event: &Event) -> Result<IngestReport, JobError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(JobError::Store(DatabaseError::Query("database is locked".into())));
            }
            Ok(IngestReport::default())
        }
    }

    #[tokio::test]
    async fn consumer_enqueues_published_events() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let queue = Arc::new(JobQueue::new(Arc::new(db), RetryPolicy::default()));
        let router = Arc::new(EventRouter::new(default_route_table(), Arc::clone(&queue)));

        let (publisher, rx) = EventBus::channel(16);
        let consumer = spawn_event_consumer(rx, router);

        publisher
            .publish(Event::new("e1", "media.uploaded", "g1", json!({"media_id": "p1"})))
            .await
            .unwrap();
        publisher
            .publish(Event::new("e2", "unknown.thing", "g1", json!({})))
            .await
            .unwrap();
        drop(publisher);
        let stats = consumer.await.unwrap();

        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 0);
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn transient_store_error_is_retried() {
        let sink = Arc::new(FlakySink {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let (publisher, rx) = EventBus::channel(4);
        let consumer = spawn_event_consumer(rx, sink.clone());

        publisher
            .publish(Event::new("e1", "memory.created", "g1", json!({})))
            .await
            .unwrap();
        drop(publisher);
        let stats = consumer.await.unwrap();

        assert_eq!(
            stats,
            ConsumerStats {
                delivered: 1,
                retries: 1,
                dropped: 0
            }
        );
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_failure_is_counted_as_dropped() {
        let sink = Arc::new(FlakySink {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let (publisher, rx) = EventBus::channel(4);
        let consumer = spawn_event_consumer(rx, sink.clone());

        publisher
            .publish(Event::new("e1", "memory.created", "g1", json!({})))
            .await
            .unwrap();
        drop(publisher);
        let stats = consumer.await.unwrap();

        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 0);
        assert_eq!(sink.calls.load(Ordering::SeqCst), DELIVERY_ATTEMPTS as usize);
    }
}
