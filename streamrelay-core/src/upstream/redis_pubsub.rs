use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{decode_payload, PubSubClient, PubSubTransport, TopicSubscription, UpstreamSink};
use crate::error::TransportError;

/// Initial backoff delay before resubscribing after a dropped connection
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff delay between resubscribe attempts
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Redis Pub/Sub upstream.
///
/// Each subscription owns a dedicated pub/sub connection. When that
/// connection drops, the loss is reported to the sink as a runtime error
/// and the pump resubscribes with capped exponential backoff until it is
/// unsubscribed or the client is disposed.
#[derive(Debug, Clone)]
pub struct RedisTransport {
    url: String,
    operation_timeout: Duration,
}

impl RedisTransport {
    #[must_use]
    pub fn new(url: impl Into<String>, operation_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            operation_timeout,
        }
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn connect(&self) -> Result<Arc<dyn PubSubClient>, TransportError> {
        let client = redis::Client::open(self.url.as_str())?;
        debug!(url = %self.url, "Redis client created");
        Ok(Arc::new(RedisClient {
            client,
            operation_timeout: self.operation_timeout,
            cancel: CancellationToken::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct RedisClient {
    client: redis::Client,
    operation_timeout: Duration,
    cancel: CancellationToken,
}

#[async_trait]
impl PubSubClient for RedisClient {
    async fn subscribe(
        &self,
        topic: &str,
        sink: UpstreamSink,
    ) -> Result<Box<dyn TopicSubscription>, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Subscribe("client disposed".to_string()));
        }

        let pubsub = open_pubsub(&self.client, topic, self.operation_timeout).await?;
        info!(topic = %topic, "Redis subscriber connected");

        let cancel = self.cancel.child_token();
        let pump = tokio::spawn(run_pump(
            self.client.clone(),
            pubsub,
            topic.to_string(),
            self.operation_timeout,
            sink,
            cancel.clone(),
        ));

        Ok(Box::new(RedisSubscription { cancel, pump }))
    }

    async fn dispose(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Open a dedicated pub/sub connection and subscribe it to `topic`
async fn open_pubsub(
    client: &redis::Client,
    topic: &str,
    limit: Duration,
) -> Result<redis::aio::PubSub, TransportError> {
    let mut pubsub = match timeout(limit, client.get_async_pubsub()).await {
        Ok(Ok(ps)) => ps,
        Ok(Err(e)) => {
            return Err(TransportError::Connection(format!(
                "Failed to get Redis Pub/Sub connection: {e}"
            )));
        }
        Err(_) => {
            return Err(TransportError::Timeout(
                "Timed out getting Redis Pub/Sub connection".to_string(),
            ));
        }
    };

    match timeout(limit, pubsub.subscribe(topic)).await {
        Ok(Ok(())) => Ok(pubsub),
        Ok(Err(e)) => Err(TransportError::Subscribe(format!(
            "Failed to subscribe to {topic}: {e}"
        ))),
        Err(_) => Err(TransportError::Timeout(format!(
            "Timed out subscribing to {topic}"
        ))),
    }
}

/// Forward messages from the live connection, resubscribing whenever it drops.
async fn run_pump(
    client: redis::Client,
    pubsub: redis::aio::PubSub,
    channel: String,
    limit: Duration,
    sink: UpstreamSink,
    cancel: CancellationToken,
) {
    let mut connection = Some(pubsub);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if let Some(mut pubsub) = connection.take() {
            let payloads = std::pin::pin!(pubsub.on_message().filter_map(|msg| {
                let payload = match msg.get_payload::<String>() {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(error = %e, channel = %msg.get_channel_name(), "Invalid payload");
                        None
                    }
                };
                futures::future::ready(payload)
            }));

            match forward_messages(payloads, &sink, &cancel).await {
                PumpExit::Cancelled => {
                    debug!(channel = %channel, "Redis subscriber cancelled");
                    return;
                }
                PumpExit::SinkClosed => return,
                PumpExit::StreamEnded => {
                    warn!(channel = %channel, "Redis pub/sub stream ended, reconnecting");
                    let lost = TransportError::Runtime("pub/sub connection lost".to_string());
                    if !report(&sink, &cancel, lost).await {
                        return;
                    }
                }
            }
        }

        match resubscribe(&client, &channel, limit, &mut backoff, &sink, &cancel).await {
            Resubscribe::Connected(pubsub) => connection = Some(pubsub),
            Resubscribe::Retry => {}
            Resubscribe::Stop => return,
        }
    }
}

enum Resubscribe {
    Connected(redis::aio::PubSub),
    Retry,
    Stop,
}

/// Wait out `backoff`, then try to open a fresh subscription. Failures are
/// reported to the sink and grow the backoff; success resets it.
async fn resubscribe(
    client: &redis::Client,
    channel: &str,
    limit: Duration,
    backoff: &mut Duration,
    sink: &UpstreamSink,
    cancel: &CancellationToken,
) -> Resubscribe {
    tokio::select! {
        () = cancel.cancelled() => return Resubscribe::Stop,
        () = tokio::time::sleep(*backoff) => {}
    }

    let reopened = tokio::select! {
        () = cancel.cancelled() => return Resubscribe::Stop,
        reopened = open_pubsub(client, channel, limit) => reopened,
    };
    match reopened {
        Ok(pubsub) => {
            info!(channel = %channel, "Redis subscriber reconnected");
            *backoff = INITIAL_BACKOFF;
            Resubscribe::Connected(pubsub)
        }
        Err(e) => {
            warn!(channel = %channel, error = %e, backoff_secs = backoff.as_secs(), "Redis resubscribe failed");
            *backoff = next_backoff(*backoff);
            if report(sink, cancel, e).await {
                Resubscribe::Retry
            } else {
                Resubscribe::Stop
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    Cancelled,
    SinkClosed,
    StreamEnded,
}

async fn forward_messages<S>(mut payloads: S, sink: &UpstreamSink, cancel: &CancellationToken) -> PumpExit
where
    S: Stream<Item = String> + Unpin,
{
    loop {
        let payload = tokio::select! {
            () = cancel.cancelled() => return PumpExit::Cancelled,
            payload = payloads.next() => payload,
        };
        let Some(payload) = payload else {
            return PumpExit::StreamEnded;
        };

        // A full coordinator queue must not hold off unsubscribe
        let delivered = tokio::select! {
            () = cancel.cancelled() => return PumpExit::Cancelled,
            delivered = sink.message(decode_payload(payload)) => delivered,
        };
        if !delivered {
            return PumpExit::SinkClosed;
        }
    }
}

/// Report a runtime error; `false` when the pump should stop.
async fn report(sink: &UpstreamSink, cancel: &CancellationToken, error: TransportError) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        delivered = sink.error(error) => delivered,
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

struct RedisSubscription {
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

#[async_trait]
impl TopicSubscription for RedisSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError> {
        // Dropping the pub/sub connection with the pump releases the channel server-side
        self.cancel.cancel();
        self.pump
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_connection_error() {
        let transport = RedisTransport::new("not-a-redis-url", Duration::from_secs(1));
        let err = transport.connect().await.err().unwrap();
        assert!(matches!(err, TransportError::Connection(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_subscribe() {
        let transport = RedisTransport::new("redis://127.0.0.1:1", Duration::from_secs(2));
        let client = transport.connect().await.unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);

        let result = client.subscribe("t", UpstreamSink::new(1, tx)).await;
        assert!(matches!(
            result.err(),
            Some(TransportError::Connection(_) | TransportError::Timeout(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(INITIAL_BACKOFF), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(16)), MAX_BACKOFF);
        assert_eq!(next_backoff(MAX_BACKOFF), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_forward_messages_reports_stream_end() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let sink = UpstreamSink::new(3, tx);
        let payloads = futures::stream::iter(vec![r#"{"kwh":1}"#.to_string(), "plain".to_string()]);

        let exit = forward_messages(payloads, &sink, &CancellationToken::new()).await;
        assert_eq!(exit, PumpExit::StreamEnded);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.generation, 3);
        assert!(matches!(
            first.kind,
            crate::upstream::UpstreamEventKind::Message(ref v) if v == &serde_json::json!({"kwh": 1})
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second.kind,
            crate::upstream::UpstreamEventKind::Message(ref v) if v == &serde_json::json!("plain")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_messages_stops_on_cancel_with_full_queue() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let sink = UpstreamSink::new(1, tx);
        let cancel = CancellationToken::new();
        let payloads = futures::stream::iter(vec!["1".to_string(), "2".to_string()])
            .chain(futures::stream::pending());

        let forward = tokio::spawn({
            let cancel = cancel.clone();
            async move { forward_messages(payloads, &sink, &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(1), forward)
            .await
            .expect("pump ignored cancellation")
            .unwrap();
        assert_eq!(exit, PumpExit::Cancelled);
    }

    #[tokio::test]
    async fn test_forward_messages_stops_when_sink_closes() {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        drop(rx);
        let sink = UpstreamSink::new(1, tx);
        let payloads = futures::stream::iter(vec!["1".to_string()]).chain(futures::stream::pending());

        let exit = forward_messages(payloads, &sink, &CancellationToken::new()).await;
        assert_eq!(exit, PumpExit::SinkClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resubscribe_is_reported_and_backs_off() {
        // Nothing listens on port 1, so every attempt fails
        let client = redis::Client::open("redis://127.0.0.1:1").unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let sink = UpstreamSink::new(2, tx);
        let cancel = CancellationToken::new();
        let mut backoff = INITIAL_BACKOFF;

        let outcome = resubscribe(&client, "t", Duration::from_secs(1), &mut backoff, &sink, &cancel).await;
        assert!(matches!(outcome, Resubscribe::Retry));
        assert_eq!(backoff, Duration::from_secs(2));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 2);
        assert!(matches!(
            event.kind,
            crate::upstream::UpstreamEventKind::Error(TransportError::Connection(_) | TransportError::Timeout(_))
        ));

        cancel.cancel();
        let outcome = resubscribe(&client, "t", Duration::from_secs(1), &mut backoff, &sink, &cancel).await;
        assert!(matches!(outcome, Resubscribe::Stop));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    #[ignore = "requires Redis server"]
    async fn test_redis_roundtrip() {
        use redis::AsyncCommands;

        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let transport = RedisTransport::new(url.clone(), Duration::from_secs(5));
        let client = transport.connect().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let subscription = client
            .subscribe("streamrelay:test", UpstreamSink::new(1, tx))
            .await
            .unwrap();

        let publisher = redis::Client::open(url).unwrap();
        let mut conn = publisher.get_multiplexed_async_connection().await.unwrap();
        let _: i64 = conn.publish("streamrelay:test", r#"{"kwh":2}"#).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            crate::upstream::UpstreamEventKind::Message(ref v) if v == &serde_json::json!({"kwh": 2})
        ));
        subscription.unsubscribe().await.unwrap();
        client.dispose().await.unwrap();
    }
}
