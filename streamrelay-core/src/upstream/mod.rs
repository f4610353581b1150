// Upstream pub/sub capability
//
// The relay depends only on this narrow surface:
// - `PubSubTransport::connect`      create a client
// - `PubSubClient::subscribe`       subscribe one topic, delivering into a sink
// - `TopicSubscription::unsubscribe`
// - `PubSubClient::dispose`
//
// Messages and asynchronous errors flow back through `UpstreamSink` as
// `UpstreamEvent`s tagged with the activation generation, so the coordinator
// can discard anything produced by a subscription it has already replaced.

pub mod memory;
pub mod redis_pubsub;
pub mod subscription;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use memory::{MemoryTransport, MemoryTransportStats};
pub use redis_pubsub::RedisTransport;
pub use subscription::{
    ActivationJob, ActivationOutcome, RetryDelay, RetryPolicy, SubscriptionState, TokioDelay,
    UpstreamSubscription,
};

/// Factory for upstream clients
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Create a fresh client. Called lazily on activation and again after a
    /// failed attempt discarded the previous client.
    async fn connect(&self) -> Result<Arc<dyn PubSubClient>, TransportError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// A connected upstream client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Subscribe to `topic`. Messages and runtime errors are delivered into
    /// `sink` until the returned subscription is unsubscribed or the client
    /// is disposed.
    async fn subscribe(
        &self,
        topic: &str,
        sink: UpstreamSink,
    ) -> Result<Box<dyn TopicSubscription>, TransportError>;

    /// Release every upstream resource held by this client
    async fn dispose(&self) -> Result<(), TransportError>;
}

/// A live subscription handle
#[async_trait]
pub trait TopicSubscription: Send + Sync {
    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError>;
}

/// Something the upstream produced for the coordinator
#[derive(Debug, Clone)]
pub enum UpstreamEventKind {
    Message(Value),
    Error(TransportError),
}

#[derive(Debug, Clone)]
pub struct UpstreamEvent {
    pub generation: u64,
    pub kind: UpstreamEventKind,
}

/// Message callback plus error observer handed to `PubSubClient::subscribe`
#[derive(Debug, Clone)]
pub struct UpstreamSink {
    generation: u64,
    tx: mpsc::Sender<UpstreamEvent>,
}

impl UpstreamSink {
    #[must_use]
    pub const fn new(generation: u64, tx: mpsc::Sender<UpstreamEvent>) -> Self {
        Self { generation, tx }
    }

    /// Forward a message. Waits for queue space; returns `false` once the
    /// receiving side is gone and the caller should stop pumping.
    pub async fn message(&self, payload: Value) -> bool {
        self.deliver(UpstreamEventKind::Message(payload)).await
    }

    /// Report a runtime error on the subscription
    pub async fn error(&self, error: TransportError) -> bool {
        self.deliver(UpstreamEventKind::Error(error)).await
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    async fn deliver(&self, kind: UpstreamEventKind) -> bool {
        self.tx
            .send(UpstreamEvent {
                generation: self.generation,
                kind,
            })
            .await
            .is_ok()
    }
}

/// Decode a raw text payload: JSON when it parses, otherwise a JSON string.
#[must_use]
pub fn decode_payload(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload(r#"{"kwh":1.5}"#.to_string()), json!({"kwh": 1.5}));
        assert_eq!(decode_payload("42".to_string()), json!(42));
        assert_eq!(decode_payload("not json".to_string()), json!("not json"));
    }

    #[tokio::test]
    async fn test_sink_tags_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = UpstreamSink::new(7, tx);

        assert!(sink.message(json!("hello")).await);
        assert!(sink.error(TransportError::Runtime("boom".to_string())).await);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.generation, 7);
        assert!(matches!(first.kind, UpstreamEventKind::Message(ref v) if v == &json!("hello")));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.kind, UpstreamEventKind::Error(_)));

        drop(rx);
        assert!(!sink.message(json!(1)).await);
    }
}
