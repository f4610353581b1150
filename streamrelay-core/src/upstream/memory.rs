//! In-process pub/sub transport.
//!
//! Used for single-node runs without a broker and as the scripted upstream in
//! tests: publishers call [`MemoryTransport::publish`], failures and delays can
//! be injected, and every client operation is counted.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PubSubClient, PubSubTransport, TopicSubscription, UpstreamSink};
use crate::error::TransportError;

const TOPIC_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
enum MemoryFrame {
    Message(Value),
    Error(String),
}

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryTransportStats {
    pub connects: u64,
    pub subscribes: u64,
    pub subscribe_failures: u64,
    pub unsubscribes: u64,
    pub disposes: u64,
}

#[derive(Default)]
struct Shared {
    topics: HashMap<String, broadcast::Sender<MemoryFrame>>,
    failing_subscribes: u32,
    subscribe_delay: Option<Duration>,
    stats: MemoryTransportStats,
}

impl Shared {
    fn sender(&mut self, topic: &str) -> broadcast::Sender<MemoryFrame> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }
}

/// Broker-less transport; clones share the same topics.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish to every live subscription on `topic`. Returns how many received it.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        let tx = self.shared.lock().topics.get(topic).cloned();
        tx.and_then(|tx| tx.send(MemoryFrame::Message(payload)).ok())
            .unwrap_or(0)
    }

    /// Raise an asynchronous error on every live subscription on `topic`.
    pub fn inject_error(&self, topic: &str, message: &str) -> usize {
        let tx = self.shared.lock().topics.get(topic).cloned();
        tx.and_then(|tx| tx.send(MemoryFrame::Error(message.to_string())).ok())
            .unwrap_or(0)
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.shared.lock().failing_subscribes = count;
    }

    /// Delay every subscribe call before it resolves.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.shared.lock().subscribe_delay = Some(delay);
    }

    #[must_use]
    pub fn stats(&self) -> MemoryTransportStats {
        self.shared.lock().stats
    }

    /// Live subscriptions on `topic`
    #[must_use]
    pub fn active_subscriptions(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn connect(&self) -> Result<Arc<dyn PubSubClient>, TransportError> {
        self.shared.lock().stats.connects += 1;
        Ok(Arc::new(MemoryClient {
            shared: Arc::clone(&self.shared),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryClient {
    shared: Arc<Mutex<Shared>>,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait]
impl PubSubClient for MemoryClient {
    async fn subscribe(
        &self,
        topic: &str,
        sink: UpstreamSink,
    ) -> Result<Box<dyn TopicSubscription>, TransportError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Subscribe("client disposed".to_string()));
        }

        let delay = self.shared.lock().subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut receiver = {
            let mut shared = self.shared.lock();
            if shared.failing_subscribes > 0 {
                shared.failing_subscribes -= 1;
                shared.stats.subscribe_failures += 1;
                return Err(TransportError::Subscribe(format!(
                    "injected failure subscribing to {topic}"
                )));
            }
            shared.stats.subscribes += 1;
            shared.sender(topic).subscribe()
        };

        let cancel = self.cancel.child_token();
        let pump_cancel = cancel.clone();
        let topic_name = topic.to_string();
        let pump = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = pump_cancel.cancelled() => break,
                    frame = receiver.recv() => frame,
                };
                let delivery = async {
                    match frame {
                        Ok(MemoryFrame::Message(payload)) => sink.message(payload).await,
                        Ok(MemoryFrame::Error(message)) => {
                            sink.error(TransportError::Runtime(message)).await
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic_name, skipped, "Memory subscription lagged");
                            sink.error(TransportError::Runtime(format!(
                                "subscription lagged, {skipped} message(s) dropped"
                            )))
                            .await
                        }
                        Err(broadcast::error::RecvError::Closed) => false,
                    }
                };
                // A full coordinator queue must not hold off unsubscribe
                let delivered = tokio::select! {
                    () = pump_cancel.cancelled() => break,
                    delivered = delivery => delivered,
                };
                if !delivered {
                    break;
                }
            }
            debug!(topic = %topic_name, "Memory subscription pump stopped");
        });

        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            cancel,
            pump,
        }))
    }

    async fn dispose(&self) -> Result<(), TransportError> {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            self.shared.lock().stats.disposes += 1;
        }
        Ok(())
    }
}

struct MemorySubscription {
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

#[async_trait]
impl TopicSubscription for MemorySubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError> {
        self.cancel.cancel();
        self.pump
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))?;
        self.shared.lock().stats.unsubscribes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamEventKind;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let transport = MemoryTransport::new();
        let client = transport.connect().await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let subscription = client.subscribe("t", UpstreamSink::new(1, tx)).await.unwrap();
        assert_eq!(transport.active_subscriptions("t"), 1);
        assert_eq!(transport.publish("t", json!({"a": 1})), 1);
        assert_eq!(transport.publish("other", json!(0)), 0);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 1);
        assert!(matches!(event.kind, UpstreamEventKind::Message(ref v) if v == &json!({"a": 1})));

        subscription.unsubscribe().await.unwrap();
        assert_eq!(transport.active_subscriptions("t"), 0);
        assert_eq!(transport.stats().unsubscribes, 1);
    }

    #[tokio::test]
    async fn test_injected_failures_and_errors() {
        let transport = MemoryTransport::new();
        transport.fail_next_subscribes(1);
        let client = transport.connect().await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        assert!(client.subscribe("t", UpstreamSink::new(1, tx.clone())).await.is_err());
        let _subscription = client.subscribe("t", UpstreamSink::new(1, tx)).await.unwrap();

        transport.inject_error("t", "broker hiccup");
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, UpstreamEventKind::Error(TransportError::Runtime(_))));

        let stats = transport.stats();
        assert_eq!(stats.subscribe_failures, 1);
        assert_eq!(stats.subscribes, 1);
    }

    #[tokio::test]
    async fn test_dispose_stops_pumps_and_rejects_subscribe() {
        let transport = MemoryTransport::new();
        let client = transport.connect().await.unwrap();
        let (tx, _rx) = mpsc::channel(8);

        let subscription = client.subscribe("t", UpstreamSink::new(1, tx.clone())).await.unwrap();
        client.dispose().await.unwrap();
        client.dispose().await.unwrap();
        assert_eq!(transport.stats().disposes, 1);

        // Pump already stopped by dispose; unsubscribe still succeeds
        subscription.unsubscribe().await.unwrap();
        assert!(client.subscribe("t", UpstreamSink::new(1, tx)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_does_not_wait_on_full_queue() {
        let transport = MemoryTransport::new();
        let client = transport.connect().await.unwrap();
        let (tx, mut rx) = mpsc::channel(1);

        let subscription = client.subscribe("t", UpstreamSink::new(1, tx)).await.unwrap();
        for n in 0..3 {
            transport.publish("t", json!(n));
        }
        // Let the pump fill the queue and park on the next send
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::timeout(Duration::from_secs(1), subscription.unsubscribe())
            .await
            .expect("unsubscribe blocked behind a full queue")
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, UpstreamEventKind::Message(ref v) if v == &json!(0)));
        assert!(rx.recv().await.is_none());
    }
}
