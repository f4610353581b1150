//! Relay orchestration.
//!
//! One coordinator task owns every piece of mutable relay state (history,
//! viewers, the upstream subscription, the idle timer). Everything that
//! happens to the relay arrives as an event on its queue and is handled to
//! completion before the next one, so no locks guard the state.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::envelope::Envelope;
use crate::error::{RelayError, RelayResult};
use crate::history::HistoryBuffer;
use crate::idle::{IdleDeadline, IdleTimer};
use crate::upstream::{
    ActivationJob, ActivationOutcome, PubSubTransport, RetryDelay, SubscriptionState, TokioDelay,
    UpstreamEvent, UpstreamEventKind, UpstreamSubscription,
};
use crate::viewers::{Viewer, ViewerId, ViewerReceiver, ViewerRegistry, ViewerState};

/// Events consumed by the coordinator loop
pub enum RelayEvent {
    ViewerConnected(Viewer),
    ViewerDisconnected(ViewerId),
    ActivationFinished(ActivationOutcome),
    IdleDeadline(IdleDeadline),
    Status(oneshot::Sender<RelayStatus>),
    Shutdown(oneshot::Sender<()>),
}

impl std::fmt::Debug for RelayEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ViewerConnected(viewer) => f.debug_tuple("ViewerConnected").field(&viewer.id()).finish(),
            Self::ViewerDisconnected(id) => f.debug_tuple("ViewerDisconnected").field(id).finish(),
            Self::ActivationFinished(outcome) => f.debug_tuple("ActivationFinished").field(outcome).finish(),
            Self::IdleDeadline(deadline) => f.debug_tuple("IdleDeadline").field(deadline).finish(),
            Self::Status(_) => f.write_str("Status"),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

/// Snapshot of relay state, served by `/api/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub topic: String,
    pub transport: String,
    pub subscription: SubscriptionState,
    pub viewers: usize,
    pub buffered_messages: usize,
    pub buffer_capacity: usize,
    pub activations: u64,
    pub idle_teardown_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_teardown_in_ms: Option<u64>,
}

/// A registered viewer as seen by the socket layer
#[derive(Debug)]
pub struct ViewerSession {
    pub id: ViewerId,
    /// Outbound envelopes; yields `None` once the relay drops the viewer.
    pub receiver: ViewerReceiver,
}

/// Cloneable entry point into a running coordinator
#[derive(Debug, Clone)]
pub struct RelayHandle {
    events: mpsc::Sender<RelayEvent>,
    topic: Arc<str>,
    viewer_queue_capacity: usize,
}

impl RelayHandle {
    /// Register a new viewer. The join handshake (history, confirmation, or
    /// an error envelope) arrives on the returned session's receiver.
    pub async fn connect_viewer(&self) -> RelayResult<ViewerSession> {
        let (viewer, receiver) = Viewer::channel(self.viewer_queue_capacity);
        let id = viewer.id().to_string();
        self.send(RelayEvent::ViewerConnected(viewer)).await?;
        Ok(ViewerSession { id, receiver })
    }

    /// Remove a viewer. Unknown or already-removed ids are ignored.
    pub async fn disconnect_viewer(&self, viewer_id: &str) -> RelayResult<()> {
        self.send(RelayEvent::ViewerDisconnected(viewer_id.to_string()))
            .await
    }

    pub async fn status(&self) -> RelayResult<RelayStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayEvent::Status(tx)).await?;
        rx.await.map_err(|_| RelayError::CoordinatorStopped)
    }

    /// Close every viewer and release the upstream. Resolves once done.
    pub async fn shutdown(&self) -> RelayResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayEvent::Shutdown(tx)).await?;
        rx.await.map_err(|_| RelayError::CoordinatorStopped)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    async fn send(&self, event: RelayEvent) -> RelayResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| RelayError::CoordinatorStopped)
    }
}

pub struct RelayCoordinator {
    topic: String,
    transport_name: &'static str,
    history: HistoryBuffer,
    viewers: ViewerRegistry,
    upstream: UpstreamSubscription,
    idle: IdleTimer,
    idle_delay: Duration,
    /// Viewers whose join waits on the in-flight activation
    pending_joins: Vec<ViewerId>,

    events: mpsc::Receiver<RelayEvent>,
    // Weak so that background jobs do not keep the loop alive after every
    // handle is gone
    self_events: mpsc::WeakSender<RelayEvent>,
    upstream_events: mpsc::Receiver<UpstreamEvent>,
}

impl RelayCoordinator {
    #[must_use]
    pub fn new(config: &Config, transport: Arc<dyn PubSubTransport>) -> (Self, RelayHandle) {
        Self::with_retry_delay(config, transport, Arc::new(TokioDelay))
    }

    /// Like [`new`](Self::new) with a custom delay between subscribe attempts.
    #[must_use]
    pub fn with_retry_delay(
        config: &Config,
        transport: Arc<dyn PubSubTransport>,
        delay: Arc<dyn RetryDelay>,
    ) -> (Self, RelayHandle) {
        let queue_capacity = config.relay.event_queue_capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(queue_capacity);
        let (upstream_tx, upstream_rx) = mpsc::channel(queue_capacity);

        let transport_name = transport.name();
        let upstream = UpstreamSubscription::new(&config.upstream, transport, delay, upstream_tx);

        let coordinator = Self {
            topic: config.upstream.topic.clone(),
            transport_name,
            history: HistoryBuffer::new(config.relay.buffer_capacity),
            viewers: ViewerRegistry::new(),
            upstream,
            idle: IdleTimer::new(),
            idle_delay: config.relay.idle_teardown_delay(),
            pending_joins: Vec::new(),
            events: events_rx,
            self_events: events_tx.downgrade(),
            upstream_events: upstream_rx,
        };
        let handle = RelayHandle {
            events: events_tx,
            topic: Arc::from(config.upstream.topic.as_str()),
            viewer_queue_capacity: config.relay.viewer_queue_capacity,
        };
        (coordinator, handle)
    }

    /// Build a coordinator and run it on its own task.
    #[must_use]
    pub fn spawn(config: &Config, transport: Arc<dyn PubSubTransport>) -> (RelayHandle, JoinHandle<()>) {
        let (coordinator, handle) = Self::new(config, transport);
        let task = tokio::spawn(coordinator.run());
        (handle, task)
    }

    /// Process events until shutdown, or until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            topic = %self.topic,
            transport = self.transport_name,
            buffer_capacity = self.history.capacity(),
            idle_delay = ?self.idle_delay,
            "Relay coordinator started"
        );

        loop {
            tokio::select! {
                biased;

                event = self.events.recv() => {
                    let Some(event) = event else {
                        info!("All relay handles dropped, shutting down");
                        self.shutdown().await;
                        break;
                    };
                    match event {
                        RelayEvent::Shutdown(ack) => {
                            self.shutdown().await;
                            let _ = ack.send(());
                            break;
                        }
                        other => self.handle_event(other).await,
                    }
                }
                Some(event) = self.upstream_events.recv() => {
                    self.handle_upstream(event);
                }
            }
        }

        info!(topic = %self.topic, "Relay coordinator stopped");
    }

    async fn handle_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::ViewerConnected(viewer) => self.on_viewer_connected(viewer),
            RelayEvent::ViewerDisconnected(viewer_id) => self.on_viewer_disconnected(&viewer_id),
            RelayEvent::ActivationFinished(outcome) => self.on_activation_finished(outcome).await,
            RelayEvent::IdleDeadline(deadline) => self.on_idle_deadline(deadline).await,
            RelayEvent::Status(reply) => {
                let _ = reply.send(self.status());
            }
            // Handled by the run loop
            RelayEvent::Shutdown(_) => {}
        }
    }

    fn on_viewer_connected(&mut self, viewer: Viewer) {
        let viewer_id = viewer.id().to_string();
        self.viewers.add(viewer);
        self.idle.cancel();

        if let Some(job) = self.upstream.begin_activation() {
            info!(viewer_id = %viewer_id, topic = %self.topic, "First viewer, activating upstream");
            self.pending_joins.push(viewer_id);
            self.spawn_activation(job);
        } else {
            self.complete_join(&viewer_id, None);
        }
    }

    fn on_viewer_disconnected(&mut self, viewer_id: &str) {
        if self.viewers.remove(viewer_id) {
            self.pending_joins.retain(|id| id != viewer_id);
            self.schedule_idle_if_empty();
        }
    }

    async fn on_activation_finished(&mut self, outcome: ActivationOutcome) {
        let joins = match self.upstream.complete_activation(outcome).await {
            Ok(None) => return,
            Ok(Some(attempts)) => {
                info!(
                    topic = %self.topic,
                    attempts,
                    waiting_viewers = self.pending_joins.len(),
                    "Upstream subscription active"
                );
                std::mem::take(&mut self.pending_joins)
                    .into_iter()
                    .map(|id| (id, None))
                    .collect::<Vec<_>>()
            }
            Err(e) => {
                error!(topic = %self.topic, error = %e, "Upstream activation failed");
                std::mem::take(&mut self.pending_joins)
                    .into_iter()
                    .map(|id| (id, Some(Envelope::subscribe_failed())))
                    .collect()
            }
        };

        for (viewer_id, failure) in joins {
            self.complete_join(&viewer_id, failure);
        }

        // Every viewer left while the activation was in flight
        self.schedule_idle_if_empty();
    }

    async fn on_idle_deadline(&mut self, deadline: IdleDeadline) {
        if !self.idle.take_if_current(deadline) {
            debug!(?deadline, "Ignoring superseded idle deadline");
            return;
        }
        if !self.viewers.is_empty() {
            debug!(viewers = self.viewers.len(), "Idle deadline reached with viewers present");
            return;
        }

        info!(topic = %self.topic, "No viewers left, tearing down upstream subscription");
        self.upstream.deactivate().await;
    }

    fn handle_upstream(&mut self, event: UpstreamEvent) {
        if !self.upstream.is_current(event.generation) {
            debug!(generation = event.generation, "Dropping event from superseded subscription");
            return;
        }

        match event.kind {
            UpstreamEventKind::Message(payload) => {
                let envelope = Envelope::message(self.history.append(payload));
                let reached = self.viewers.broadcast(&envelope);
                debug!(reached, buffered = self.history.len(), "Relayed upstream message");
                self.schedule_idle_if_empty();
            }
            UpstreamEventKind::Error(e) => {
                let err = RelayError::TransportRuntime(e);
                error!(topic = %self.topic, error = %err, "Upstream subscription error");
            }
        }
    }

    /// Deliver the join handshake: error (if the activation failed), then
    /// history (if any), then the confirmation. The viewer is opened for
    /// broadcasts last so no live message can overtake its history.
    fn complete_join(&mut self, viewer_id: &str, failure: Option<Envelope>) {
        if self.viewers.state(viewer_id) != Some(ViewerState::Joining) {
            return;
        }

        let mut handshake = Vec::with_capacity(3);
        handshake.extend(failure);
        if !self.history.is_empty() {
            handshake.push(Envelope::History {
                data: self.history.snapshot(),
            });
        }
        handshake.push(Envelope::connected(&self.topic));

        for envelope in handshake {
            if let Err(e) = self.viewers.send_to(viewer_id, envelope) {
                warn!(error = %e, "Viewer dropped during join");
                self.schedule_idle_if_empty();
                return;
            }
        }
        self.viewers.mark_open(viewer_id);
        debug!(viewer_id = %viewer_id, "Viewer joined");
    }

    fn spawn_activation(&self, job: ActivationJob) {
        let events = self.self_events.clone();
        tokio::spawn(async move {
            let outcome = job.run().await;
            let Some(tx) = events.upgrade() else {
                debug!("Relay stopped before activation finished");
                return;
            };
            if tx.send(RelayEvent::ActivationFinished(outcome)).await.is_err() {
                debug!("Relay stopped before activation finished");
            }
        });
    }

    fn schedule_idle_if_empty(&mut self) {
        if !self.viewers.is_empty() || self.idle.is_pending() {
            return;
        }
        if matches!(
            self.upstream.state(),
            SubscriptionState::Detached | SubscriptionState::Failed
        ) {
            return;
        }

        info!(delay = ?self.idle_delay, "Last viewer gone, scheduling upstream teardown");
        let events = self.self_events.clone();
        self.idle.schedule(self.idle_delay, move |deadline| async move {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(RelayEvent::IdleDeadline(deadline)).await;
            }
        });
    }

    async fn shutdown(&mut self) {
        self.idle.cancel();
        self.pending_joins.clear();
        let closed = self.viewers.close_all();
        self.upstream.shutdown().await;
        info!(closed_viewers = closed, topic = %self.topic, "Relay shut down");
    }

    fn status(&self) -> RelayStatus {
        let remaining = self.idle.remaining();
        RelayStatus {
            topic: self.topic.clone(),
            transport: self.transport_name.to_string(),
            subscription: self.upstream.state(),
            viewers: self.viewers.len(),
            buffered_messages: self.history.len(),
            buffer_capacity: self.history.capacity(),
            activations: self.upstream.activations_started(),
            idle_teardown_pending: remaining.is_some(),
            idle_teardown_in_ms: remaining.and_then(|d| u64::try_from(d.as_millis()).ok()),
        }
    }
}
