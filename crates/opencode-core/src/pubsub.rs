//! In-process publish/subscribe broker embedded by the stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use opencode_types::{Event, EventKind};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sync::{read_unpoisoned, write_unpoisoned};

/// Per-subscriber buffer size.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// How long a full subscriber is given before the event is dropped for it.
pub const SLOW_SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(2);

struct Inner<T> {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Event<T>>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Fan-out of typed events to any number of subscribers.
///
/// Every subscriber receives the events published after it subscribed, in
/// publish order. A subscriber that stops draining its buffer loses events
/// without slowing the others down beyond [`SLOW_SUBSCRIBER_TIMEOUT`].
pub struct Broker<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Broker<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broker<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe until `cancel` fires, the receiver is dropped, or the broker shuts down.
    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<T>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        if self.inner.shutdown.is_cancelled() {
            // Dropping tx closes the receiver immediately.
            return rx;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        write_unpoisoned(&self.inner.subscribers).insert(id, tx.clone());

        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = inner.shutdown.cancelled() => {}
                _ = tx.closed() => {}
            }
            write_unpoisoned(&inner.subscribers).remove(&id);
            debug!(target: "opencode::pubsub", subscriber = id, "Subscriber removed");
        });

        rx
    }

    /// Publish an event to every current subscriber.
    pub async fn publish(&self, kind: EventKind, payload: T) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let subscribers: Vec<(u64, mpsc::Sender<Event<T>>)> = read_unpoisoned(&self.inner.subscribers)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, tx) in subscribers {
            let event = Event::new(kind, payload.clone());
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => closed.push(id),
                Err(TrySendError::Full(event)) => {
                    match tx.send_timeout(event, SLOW_SUBSCRIBER_TIMEOUT).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Closed(_)) => closed.push(id),
                        Err(SendTimeoutError::Timeout(_)) => {
                            warn!(
                                target: "opencode::pubsub",
                                subscriber = id,
                                "Subscriber buffer full, dropping event"
                            );
                        }
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = write_unpoisoned(&self.inner.subscribers);
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        read_unpoisoned(&self.inner.subscribers).len()
    }

    /// Close every subscription. Later publishes are ignored.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        write_unpoisoned(&self.inner.subscribers).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let broker: Broker<u32> = Broker::new();
        let cancel = CancellationToken::new();
        let mut rx = broker.subscribe(&cancel);

        for i in 0..10 {
            broker.publish(EventKind::Created, i).await;
        }
        for i in 0..10 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.payload, i);
            assert_eq!(event.kind, EventKind::Created);
        }
    }

    #[tokio::test]
    async fn test_events_before_subscribe_are_not_seen() {
        let broker: Broker<&'static str> = Broker::new();
        broker.publish(EventKind::Created, "early").await;

        let cancel = CancellationToken::new();
        let mut rx = broker.subscribe(&cancel);
        broker.publish(EventKind::Updated, "late").await;

        assert_eq!(rx.recv().await.unwrap().payload, "late");
    }

    #[tokio::test]
    async fn test_cancel_removes_subscriber() {
        let broker: Broker<u32> = Broker::new();
        let cancel = CancellationToken::new();
        let mut rx = broker.subscribe(&cancel);
        assert_eq!(broker.subscriber_count(), 1);

        cancel.cancel();
        assert!(rx.recv().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_cleaned_up() {
        let broker: Broker<u32> = Broker::new();
        let cancel = CancellationToken::new();
        let rx = broker.subscribe(&cancel);
        drop(rx);

        broker.publish(EventKind::Created, 1).await;
        tokio::task::yield_now().await;
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers() {
        let broker: Broker<u32> = Broker::new();
        let cancel = CancellationToken::new();
        let mut rx = broker.subscribe(&cancel);

        broker.shutdown();
        assert!(rx.recv().await.is_none());

        let mut late = broker.subscribe(&cancel);
        assert!(late.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_drops_only_its_events() {
        let broker: Broker<usize> = Broker::new();
        let cancel = CancellationToken::new();
        let mut slow = broker.subscribe(&cancel);
        let mut fast = broker.subscribe(&cancel);

        let drain = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = fast.recv().await {
                seen.push(event.payload);
                if seen.len() == SUBSCRIBER_BUFFER + 1 {
                    break;
                }
            }
            seen
        });

        for i in 0..=SUBSCRIBER_BUFFER {
            broker.publish(EventKind::Created, i).await;
        }

        let seen = drain.await.unwrap();
        assert_eq!(seen, (0..=SUBSCRIBER_BUFFER).collect::<Vec<_>>());

        let mut slow_seen = 0;
        while slow.try_recv().is_ok() {
            slow_seen += 1;
        }
        assert_eq!(slow_seen, SUBSCRIBER_BUFFER);
    }

    proptest::proptest! {
        #[test]
        fn prop_every_subscriber_sees_publish_order(
            payloads in proptest::collection::vec(proptest::prelude::any::<u16>(), 0..SUBSCRIBER_BUFFER),
            subscribers in 1usize..4,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let broker: Broker<u16> = Broker::new();
                let cancel = CancellationToken::new();
                let mut receivers: Vec<_> = (0..subscribers).map(|_| broker.subscribe(&cancel)).collect();
                for p in &payloads {
                    broker.publish(EventKind::Updated, *p).await;
                }
                broker.shutdown();
                for rx in receivers.iter_mut() {
                    let mut seen = Vec::new();
                    while let Some(event) = rx.recv().await {
                        seen.push(event.payload);
                    }
                    assert_eq!(seen, payloads);
                }
            });
        }
    }
}
