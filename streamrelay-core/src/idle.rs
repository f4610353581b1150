// Deferred idle teardown.
//
// The timer itself never tears anything down: when the delay elapses it hands
// an `IdleDeadline` token to the fire callback (the coordinator posts it back
// into its own event queue). The coordinator then asks `take_if_current`
// whether the token still names the pending deadline and re-checks the
// zero-viewer condition before acting.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Token identifying one scheduled deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleDeadline {
    generation: u64,
}

struct Pending {
    deadline: IdleDeadline,
    fires_at: Instant,
    handle: JoinHandle<()>,
}

/// At most one pending teardown at a time; scheduling replaces the previous one.
#[derive(Default)]
pub struct IdleTimer {
    pending: Option<Pending>,
    generation: u64,
}

impl IdleTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending deadline, then arm a new one.
    pub fn schedule<F, Fut>(&mut self, delay: Duration, on_fire: F) -> IdleDeadline
    where
        F: FnOnce(IdleDeadline) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        self.generation += 1;
        let deadline = IdleDeadline {
            generation: self.generation,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(deadline).await;
        });

        debug!(generation = deadline.generation, ?delay, "Idle teardown scheduled");
        self.pending = Some(Pending {
            deadline,
            fires_at: Instant::now() + delay,
            handle,
        });
        deadline
    }

    /// Clear the pending deadline. Returns `false` if nothing was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.handle.abort();
                debug!(generation = pending.deadline.generation, "Idle teardown cancelled");
                true
            }
            None => false,
        }
    }

    /// Consume the pending deadline if `deadline` is still the current one.
    ///
    /// A token that was cancelled or replaced after its task already fired
    /// returns `false` and leaves any newer deadline untouched.
    pub fn take_if_current(&mut self, deadline: IdleDeadline) -> bool {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.deadline == deadline)
        {
            self.pending = None;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Time left until the pending deadline fires
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.pending
            .as_ref()
            .map(|pending| pending.fires_at.saturating_duration_since(Instant::now()))
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
