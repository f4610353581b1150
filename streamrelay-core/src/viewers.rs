use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::{RelayError, RelayResult};

/// Identity of a connected viewer
pub type ViewerId = String;

/// Receiving half of a viewer channel, drained by the socket writer.
pub type ViewerReceiver = mpsc::Receiver<Envelope>;

/// Liveness of a registered viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    /// Registered, join handshake (history + confirmation) not delivered yet
    Joining,
    /// Receives broadcasts
    Open,
}

/// A downstream viewer channel as owned by the registry
#[derive(Debug)]
pub struct Viewer {
    id: ViewerId,
    sender: mpsc::Sender<Envelope>,
    state: ViewerState,
    connected_at: Instant,
}

impl Viewer {
    /// Create a viewer with a bounded outbound queue.
    #[must_use]
    pub fn channel(queue_capacity: usize) -> (Self, ViewerReceiver) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let viewer = Self {
            id: nanoid::nanoid!(12),
            sender,
            state: ViewerState::Joining,
            connected_at: Instant::now(),
        };
        (viewer, receiver)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn state(&self) -> ViewerState {
        self.state
    }

    fn try_send(&self, envelope: Envelope) -> Result<(), String> {
        self.sender.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => "channel full: viewer too slow to consume messages".to_string(),
            TrySendError::Closed(_) => "channel closed: viewer disconnected".to_string(),
        })
    }
}

/// Set of connected viewers used for fan-out and presence accounting.
///
/// Dropping a viewer's sender (on `remove`/`close_all`) closes its channel,
/// which ends the socket writer for that viewer.
#[derive(Debug, Default)]
pub struct ViewerRegistry {
    viewers: HashMap<ViewerId, Viewer>,
}

impl ViewerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, viewer: Viewer) {
        info!(viewer_id = %viewer.id, total = self.viewers.len() + 1, "Viewer registered");
        self.viewers.insert(viewer.id.clone(), viewer);
    }

    /// Remove a viewer. Returns `false` if it was not registered.
    pub fn remove(&mut self, viewer_id: &str) -> bool {
        match self.viewers.remove(viewer_id) {
            Some(viewer) => {
                info!(
                    viewer_id = %viewer_id,
                    connected_for = ?viewer.connected_at.elapsed(),
                    remaining = self.viewers.len(),
                    "Viewer removed"
                );
                true
            }
            None => {
                debug!(viewer_id = %viewer_id, "Viewer already removed");
                false
            }
        }
    }

    /// Promote a joining viewer so it receives broadcasts.
    pub fn mark_open(&mut self, viewer_id: &str) -> bool {
        self.viewers.get_mut(viewer_id).is_some_and(|viewer| {
            viewer.state = ViewerState::Open;
            true
        })
    }

    /// Send to one viewer regardless of its state. A failed send removes it.
    pub fn send_to(&mut self, viewer_id: &str, envelope: Envelope) -> RelayResult<()> {
        let Some(viewer) = self.viewers.get(viewer_id) else {
            return Err(RelayError::ViewerChannel {
                viewer_id: viewer_id.to_string(),
                reason: "not registered".to_string(),
            });
        };

        let envelope_type = envelope.envelope_type();
        if let Err(reason) = viewer.try_send(envelope) {
            warn!(
                viewer_id = %viewer_id,
                envelope_type,
                error = %reason,
                "Failed to send to viewer, removing"
            );
            self.remove(viewer_id);
            return Err(RelayError::ViewerChannel {
                viewer_id: viewer_id.to_string(),
                reason,
            });
        }
        Ok(())
    }

    /// Send to every open viewer. Viewers whose send fails are removed.
    /// Returns the number of viewers reached.
    pub fn broadcast(&mut self, envelope: &Envelope) -> usize {
        let mut sent_count = 0;
        let mut failed_viewers = Vec::new();

        for viewer in self.viewers.values() {
            if viewer.state != ViewerState::Open {
                continue;
            }
            match viewer.try_send(envelope.clone()) {
                Ok(()) => sent_count += 1,
                Err(reason) => {
                    warn!(
                        viewer_id = %viewer.id,
                        error = %reason,
                        "Failed to broadcast to viewer, marking for cleanup"
                    );
                    failed_viewers.push(viewer.id.clone());
                }
            }
        }

        for viewer_id in failed_viewers {
            self.remove(&viewer_id);
        }

        debug!(
            sent_count,
            envelope_type = envelope.envelope_type(),
            "Broadcast complete"
        );
        sent_count
    }

    /// Drop every viewer, closing their channels. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let count = self.viewers.len();
        self.viewers.clear();
        count
    }

    #[must_use]
    pub fn contains(&self, viewer_id: &str) -> bool {
        self.viewers.contains_key(viewer_id)
    }

    #[must_use]
    pub fn state(&self, viewer_id: &str) -> Option<ViewerState> {
        self.viewers.get(viewer_id).map(Viewer::state)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.viewers.len()
    }
}
