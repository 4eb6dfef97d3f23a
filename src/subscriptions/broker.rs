//! In-process publish/subscribe event broker
//!
//! A concurrent registry mapping a topic to the handlers interested in it.
//! Publish fan-out is deliberately synchronous: every handler runs to
//! completion on the publishing task before `publish` returns, so a mutation
//! resolver pays the cost of delivering to each of its subscribers. Handlers
//! registered while a publish is in flight may or may not see that event; the
//! handler set is snapshotted outside the lock, which also keeps the lock
//! from ever being held across an await.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use uuid::Uuid;

use super::events::DomainEvent;

/// Broker-assigned identifier for a registered handler
pub type HandlerId = Uuid;

/// A registered callback, invoked once per matching publish
pub type EventHandler =
    Arc<dyn Fn(DomainEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    by_topic: HashMap<String, HashMap<HandlerId, EventHandler>>,
    topics: HashMap<HandlerId, String>,
}

/// Concurrent topic → handler registry with synchronous fan-out
#[derive(Default)]
pub struct EventBroker {
    handlers: RwLock<HandlerTable>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a topic. Never fails; the returned identifier
    /// is random so concurrent registrations from many connections cannot
    /// collide.
    pub fn subscribe(&self, topic: &str, handler: EventHandler) -> HandlerId {
        let id = Uuid::new_v4();
        let mut table = self.handlers.write();
        table
            .by_topic
            .entry(topic.to_string())
            .or_default()
            .insert(id, handler);
        table.topics.insert(id, topic.to_string());
        tracing::debug!(topic, handler = %id, "handler subscribed");
        id
    }

    /// Invoke every handler currently registered for the event's topic, in
    /// unspecified order, and wait for all of them. A failing handler is
    /// logged and does not abort delivery to the rest. Returns the number of
    /// handlers invoked.
    pub async fn publish(&self, event: DomainEvent) -> usize {
        let topic = event.topic();
        let snapshot: Vec<(HandlerId, EventHandler)> = {
            let table = self.handlers.read();
            table
                .by_topic
                .get(topic)
                .map(|handlers| {
                    handlers
                        .iter()
                        .map(|(id, handler)| (*id, handler.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let invoked = snapshot.len();
        for (id, handler) in snapshot {
            if let Err(error) = (handler.as_ref())(event.clone()).await {
                tracing::warn!(topic, handler = %id, error = %error, "event handler failed");
            }
        }

        invoked
    }

    /// Remove a handler. Removing an unknown or already-removed identifier is
    /// a no-op.
    pub fn unsubscribe(&self, id: HandlerId) {
        let mut table = self.handlers.write();
        if let Some(topic) = table.topics.remove(&id) {
            if let Some(handlers) = table.by_topic.get_mut(&topic) {
                handlers.remove(&id);
                if handlers.is_empty() {
                    table.by_topic.remove(&topic);
                }
            }
            tracing::debug!(topic, handler = %id, "handler unsubscribed");
        }
    }

    /// Number of handlers currently registered for a topic
    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers
            .read()
            .by_topic
            .get(topic)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::UserRecord;
    use crate::subscriptions::events::{USER_CREATED, USER_DELETED};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn user(id: i64) -> UserRecord {
        UserRecord {
            id,
            name: format!("user-{id}"),
            email: format!("user-{id}@example.com"),
            age: 30,
            profession: "tester".to_string(),
            friendly: true,
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn publish_without_handlers_is_a_noop() {
        let broker = EventBroker::new();
        let invoked = broker.publish(DomainEvent::UserCreated(user(1))).await;
        assert_eq!(invoked, 0);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_is_a_noop() {
        let broker = EventBroker::new();
        broker.unsubscribe(Uuid::new_v4());
        assert_eq!(broker.handler_count(USER_CREATED), 0);
    }

    #[tokio::test]
    async fn handlers_only_receive_their_topic() {
        let broker = EventBroker::new();
        let created = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));
        broker.subscribe(USER_CREATED, counting_handler(created.clone()));
        broker.subscribe(USER_DELETED, counting_handler(deleted.clone()));

        broker.publish(DomainEvent::UserCreated(user(1))).await;

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(deleted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_is_idempotent() {
        let broker = EventBroker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = broker.subscribe(USER_CREATED, counting_handler(counter.clone()));

        broker.publish(DomainEvent::UserCreated(user(1))).await;
        broker.unsubscribe(id);
        broker.unsubscribe(id);
        broker.publish(DomainEvent::UserCreated(user(2))).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(broker.handler_count(USER_CREATED), 0);
    }

    #[tokio::test]
    async fn failing_handler_does_not_abort_fanout() {
        let broker = EventBroker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        broker.subscribe(
            USER_CREATED,
            Arc::new(|_event| Box::pin(async { anyhow::bail!("delivery exploded") })),
        );
        broker.subscribe(USER_CREATED, counting_handler(counter.clone()));

        let invoked = broker.publish(DomainEvent::UserCreated(user(1))).await;

        assert_eq!(invoked, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_waits_for_slow_handlers() {
        let broker = EventBroker::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        broker.subscribe(
            USER_CREATED,
            Arc::new(move |_event| {
                let flag = flag.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let started = Instant::now();
        broker.publish(DomainEvent::UserCreated(user(1))).await;

        // The slow write happened on the publishing task, before return
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_subscribe_publish_unsubscribe_keeps_exact_accounting() {
        const CHURNERS: usize = 8;
        const PUBLISHERS: usize = 4;
        const ROUNDS: usize = 200;

        let broker = Arc::new(EventBroker::new());
        let mut tasks = Vec::new();

        for _ in 0..CHURNERS {
            let broker = broker.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let id = broker.subscribe(
                        USER_CREATED,
                        Arc::new(|_event| Box::pin(async { Ok(()) })),
                    );
                    tokio::task::yield_now().await;
                    broker.unsubscribe(id);
                }
                // One registration survives the churn per task
                broker.subscribe(USER_CREATED, Arc::new(|_event| Box::pin(async { Ok(()) })))
            }));
        }

        let mut publishers = Vec::new();
        for round in 0..PUBLISHERS {
            let broker = broker.clone();
            publishers.push(tokio::spawn(async move {
                for i in 0..ROUNDS {
                    broker
                        .publish(DomainEvent::UserCreated(user((round * ROUNDS + i) as i64)))
                        .await;
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut survivors = Vec::new();
        for task in tasks {
            survivors.push(task.await.expect("churn task panicked"));
        }
        for task in publishers {
            task.await.expect("publisher task panicked");
        }

        // Post-stress state is exactly the net of adds minus removes
        assert_eq!(broker.handler_count(USER_CREATED), CHURNERS);
        for id in survivors {
            broker.unsubscribe(id);
        }
        assert_eq!(broker.handler_count(USER_CREATED), 0);
    }
}
