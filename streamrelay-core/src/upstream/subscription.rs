use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{PubSubClient, PubSubTransport, TopicSubscription, UpstreamEvent, UpstreamSink};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, TransportError};

/// Lifecycle of the single upstream subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// No subscription (initial, after idle teardown, after shutdown)
    Detached,
    /// Client init and subscribe in flight
    Connecting,
    /// Subscription live, messages flowing into the coordinator
    Active,
    /// Last activation exhausted its retries; the next activation starts over
    Failed,
}

/// Bounded retry for one activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.retry_delay(),
        }
    }
}

/// Delay primitive used between subscribe attempts
#[async_trait]
pub trait RetryDelay: Send + Sync {
    async fn wait(&self, delay: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDelay;

#[async_trait]
impl RetryDelay for TokioDelay {
    async fn wait(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Result of one activation, reported back to the coordinator
pub enum ActivationOutcome {
    Subscribed {
        generation: u64,
        attempts: u32,
        client: Arc<dyn PubSubClient>,
        subscription: Box<dyn TopicSubscription>,
    },
    Exhausted {
        generation: u64,
        attempts: u32,
        error: TransportError,
    },
    Cancelled {
        generation: u64,
    },
}

impl ActivationOutcome {
    #[must_use]
    pub const fn generation(&self) -> u64 {
        match self {
            Self::Subscribed { generation, .. }
            | Self::Exhausted { generation, .. }
            | Self::Cancelled { generation } => *generation,
        }
    }
}

impl std::fmt::Debug for ActivationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribed { generation, attempts, .. } => f
                .debug_struct("Subscribed")
                .field("generation", generation)
                .field("attempts", attempts)
                .finish_non_exhaustive(),
            Self::Exhausted { generation, attempts, error } => f
                .debug_struct("Exhausted")
                .field("generation", generation)
                .field("attempts", attempts)
                .field("error", error)
                .finish(),
            Self::Cancelled { generation } => f
                .debug_struct("Cancelled")
                .field("generation", generation)
                .finish(),
        }
    }
}

/// One activation: connect (or reuse) a client and subscribe, retrying with
/// a fixed delay. Runs off the coordinator loop; the coordinator hands the
/// outcome back to [`UpstreamSubscription::complete_activation`].
pub struct ActivationJob {
    generation: u64,
    topic: String,
    transport: Arc<dyn PubSubTransport>,
    client: Option<Arc<dyn PubSubClient>>,
    sink: UpstreamSink,
    policy: RetryPolicy,
    delay: Arc<dyn RetryDelay>,
    operation_timeout: Duration,
    cancel: CancellationToken,
}

impl ActivationJob {
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn run(self) -> ActivationOutcome {
        let Self {
            generation,
            topic,
            transport,
            mut client,
            sink,
            policy,
            delay,
            operation_timeout,
            cancel,
        } = self;

        let mut last_error = TransportError::Subscribe("no attempt made".to_string());

        for attempt in 1..=policy.max_attempts {
            if cancel.is_cancelled() {
                discard_client(client.take(), operation_timeout).await;
                return ActivationOutcome::Cancelled { generation };
            }

            info!(
                topic = %topic,
                transport = transport.name(),
                attempt,
                max_attempts = policy.max_attempts,
                "Subscribing to upstream topic"
            );

            match subscribe_once(&*transport, &mut client, &topic, &sink, operation_timeout).await {
                Ok((subscribed_client, subscription)) => {
                    if cancel.is_cancelled() {
                        if let Err(e) = bounded(operation_timeout, "unsubscribe", subscription.unsubscribe()).await {
                            debug!(error = %e, "Unsubscribe after cancelled activation failed");
                        }
                        discard_client(Some(subscribed_client), operation_timeout).await;
                        return ActivationOutcome::Cancelled { generation };
                    }
                    info!(topic = %topic, attempt, "Successfully subscribed to upstream topic");
                    return ActivationOutcome::Subscribed {
                        generation,
                        attempts: attempt,
                        client: subscribed_client,
                        subscription,
                    };
                }
                Err(e) => {
                    error!(
                        topic = %topic,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Error subscribing to upstream topic"
                    );
                    // A client that failed mid-subscribe is not trusted again
                    discard_client(client.take(), operation_timeout).await;
                    last_error = e;
                }
            }

            if attempt < policy.max_attempts {
                info!(delay = ?policy.delay, "Retrying upstream subscribe");
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(topic = %topic, "Activation cancelled during retry delay");
                        return ActivationOutcome::Cancelled { generation };
                    }
                    () = delay.wait(policy.delay) => {}
                }
            }
        }

        ActivationOutcome::Exhausted {
            generation,
            attempts: policy.max_attempts,
            error: last_error,
        }
    }
}

async fn subscribe_once(
    transport: &dyn PubSubTransport,
    client: &mut Option<Arc<dyn PubSubClient>>,
    topic: &str,
    sink: &UpstreamSink,
    operation_timeout: Duration,
) -> Result<(Arc<dyn PubSubClient>, Box<dyn TopicSubscription>), TransportError> {
    let active_client = match client {
        Some(existing) => Arc::clone(existing),
        None => {
            debug!(transport = transport.name(), "Initializing upstream client");
            let created = bounded(operation_timeout, "connect", transport.connect()).await?;
            *client = Some(Arc::clone(&created));
            created
        }
    };

    let subscription = bounded(
        operation_timeout,
        "subscribe",
        active_client.subscribe(topic, sink.clone()),
    )
    .await?;

    Ok((active_client, subscription))
}

async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| TransportError::Timeout(format!("upstream {operation} exceeded {limit:?}")))?
}

/// Dispose a client, logging and swallowing any failure.
async fn discard_client(client: Option<Arc<dyn PubSubClient>>, limit: Duration) {
    if let Some(client) = client {
        if let Err(e) = bounded(limit, "dispose", client.dispose()).await {
            debug!(error = %e, "Ignoring dispose error for discarded client");
        }
    }
}

/// The single logical subscription to the relay's topic.
///
/// Owned by the coordinator. Activation is split in two so the retry loop
/// can run while the coordinator keeps serving events:
/// [`begin_activation`](Self::begin_activation) moves to `Connecting` and
/// returns the job; [`complete_activation`](Self::complete_activation)
/// applies its outcome.
pub struct UpstreamSubscription {
    topic: String,
    transport: Arc<dyn PubSubTransport>,
    delay: Arc<dyn RetryDelay>,
    policy: RetryPolicy,
    operation_timeout: Duration,
    dispose_client_on_deactivate: bool,
    upstream_tx: mpsc::Sender<UpstreamEvent>,

    state: SubscriptionState,
    generation: u64,
    client: Option<Arc<dyn PubSubClient>>,
    subscription: Option<Box<dyn TopicSubscription>>,
    in_flight: Option<CancellationToken>,
    activations_started: u64,
}

impl UpstreamSubscription {
    #[must_use]
    pub fn new(
        config: &UpstreamConfig,
        transport: Arc<dyn PubSubTransport>,
        delay: Arc<dyn RetryDelay>,
        upstream_tx: mpsc::Sender<UpstreamEvent>,
    ) -> Self {
        Self {
            topic: config.topic.clone(),
            transport,
            delay,
            policy: RetryPolicy::from_config(config),
            operation_timeout: config.operation_timeout(),
            dispose_client_on_deactivate: config.dispose_client_on_deactivate,
            upstream_tx,
            state: SubscriptionState::Detached,
            generation: 0,
            client: None,
            subscription: None,
            in_flight: None,
            activations_started: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether events tagged `generation` belong to the current subscription
    #[must_use]
    pub const fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    #[must_use]
    pub const fn activations_started(&self) -> u64 {
        self.activations_started
    }

    #[must_use]
    pub const fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Start an activation. Returns `None` (no-op) while `Connecting` or `Active`.
    pub fn begin_activation(&mut self) -> Option<ActivationJob> {
        if matches!(
            self.state,
            SubscriptionState::Connecting | SubscriptionState::Active
        ) {
            debug!(state = ?self.state, "Activation skipped, already subscribed or in flight");
            return None;
        }

        self.generation += 1;
        self.activations_started += 1;
        self.state = SubscriptionState::Connecting;

        let cancel = CancellationToken::new();
        self.in_flight = Some(cancel.clone());

        Some(ActivationJob {
            generation: self.generation,
            topic: self.topic.clone(),
            transport: Arc::clone(&self.transport),
            client: self.client.take(),
            sink: UpstreamSink::new(self.generation, self.upstream_tx.clone()),
            policy: self.policy,
            delay: Arc::clone(&self.delay),
            operation_timeout: self.operation_timeout,
            cancel,
        })
    }

    /// Apply an activation outcome.
    ///
    /// Returns `Ok(Some(attempts))` once subscribed, `Err(SubscribeFailure)`
    /// once retries are exhausted, and `Ok(None)` for an outcome that no
    /// longer matters: a superseded activation (its resources are released
    /// here) or a cancelled one.
    pub async fn complete_activation(
        &mut self,
        outcome: ActivationOutcome,
    ) -> Result<Option<u32>, RelayError> {
        if outcome.generation() != self.generation || self.state != SubscriptionState::Connecting {
            warn!(
                generation = outcome.generation(),
                current = self.generation,
                state = ?self.state,
                "Discarding stale activation outcome"
            );
            if let ActivationOutcome::Subscribed { client, subscription, .. } = outcome {
                release(
                    Some(subscription),
                    Some(client),
                    self.operation_timeout,
                    &self.topic,
                    self.transport.name(),
                )
                .await;
            }
            return Ok(None);
        }

        self.in_flight = None;
        match outcome {
            ActivationOutcome::Subscribed {
                attempts,
                client,
                subscription,
                ..
            } => {
                self.client = Some(client);
                self.subscription = Some(subscription);
                self.state = SubscriptionState::Active;
                Ok(Some(attempts))
            }
            ActivationOutcome::Exhausted { attempts, error, .. } => {
                self.client = None;
                self.state = SubscriptionState::Failed;
                Err(RelayError::SubscribeFailure {
                    topic: self.topic.clone(),
                    attempts,
                    source: error,
                })
            }
            ActivationOutcome::Cancelled { .. } => {
                self.client = None;
                self.state = SubscriptionState::Detached;
                Ok(None)
            }
        }
    }

    /// Unsubscribe. No-op (returns `false`) unless `Active`.
    ///
    /// Failures are logged; the state always ends `Detached`. The client is
    /// disposed too when `dispose_client_on_deactivate` is set.
    pub async fn deactivate(&mut self) -> bool {
        if self.state != SubscriptionState::Active {
            debug!(state = ?self.state, "Deactivate skipped, not active");
            return false;
        }

        info!(topic = %self.topic, "Unsubscribing from upstream topic");
        let subscription = self.subscription.take();
        let client = if self.dispose_client_on_deactivate {
            self.client.take()
        } else {
            None
        };
        release(
            subscription,
            client,
            self.operation_timeout,
            &self.topic,
            self.transport.name(),
        )
        .await;

        self.generation += 1;
        self.state = SubscriptionState::Detached;
        info!(topic = %self.topic, client_retained = self.client.is_some(), "Unsubscribed from upstream topic");
        true
    }

    /// Cancel any in-flight activation, unsubscribe, and always dispose the client.
    pub async fn shutdown(&mut self) {
        if let Some(cancel) = self.in_flight.take() {
            info!("Cancelling in-flight upstream activation");
            cancel.cancel();
        }

        let subscription = self.subscription.take();
        let client = self.client.take();
        release(
            subscription,
            client,
            self.operation_timeout,
            &self.topic,
            self.transport.name(),
        )
        .await;

        self.generation += 1;
        self.state = SubscriptionState::Detached;
    }
}

/// Unsubscribe and dispose, logging and swallowing failures.
async fn release(
    subscription: Option<Box<dyn TopicSubscription>>,
    client: Option<Arc<dyn PubSubClient>>,
    limit: Duration,
    topic: &str,
    transport: &'static str,
) {
    if let Some(subscription) = subscription {
        if let Err(e) = bounded(limit, "unsubscribe", subscription.unsubscribe()).await {
            let err = RelayError::Disposal(e);
            error!(topic = %topic, error = %err, "Failed to unsubscribe from upstream");
        }
    }
    if let Some(client) = client {
        match bounded(limit, "dispose", client.dispose()).await {
            Ok(()) => debug!(transport, "Upstream client disposed"),
            Err(e) => {
                let err = RelayError::Disposal(e);
                error!(transport, error = %err, "Error disposing upstream client");
            }
        }
    }
}
