//! Node lifecycle.
//!
//! ```text
//! Stopped ──start──▶ Starting ──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                        │
//!                        └── fatal start error ──▶ Stopped
//! ```
//!
//! The current state is published on a `watch` channel so callers can await
//! a transition instead of polling.

use std::fmt;
use std::future::Future;

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::overlay::{ReceivedMessage, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

impl LifecycleState {
    fn can_move_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Stopped);
        Self { tx }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Atomically moves to `next`, returning the state left behind.
    pub fn transition(&self, next: LifecycleState) -> Result<LifecycleState, LifecycleError> {
        let mut outcome = Ok(next);
        self.tx.send_if_modified(|state| {
            if state.can_move_to(next) {
                outcome = Ok(*state);
                *state = next;
                true
            } else {
                outcome = Err(LifecycleError::InvalidTransition { from: *state, to: next });
                false
            }
        });
        if let Ok(from) = outcome {
            info!(from = %from, to = %next, "lifecycle transition");
        }
        outcome
    }
}

/// Resolves on the first SIGINT or SIGTERM, naming the signal.
pub async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM; only SIGINT will stop the node");
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

/// Hands every delivered message to `on_message` until `shutdown` resolves.
///
/// `shutdown` is polled across iterations, so a signal raised while a
/// message is being handled is not lost. Returns the shutdown reason, or
/// `"delivery closed"` once the delivery queue is gone.
pub async fn deliver_until<S>(
    shutdown: S,
    messages: &mut Subscription,
    mut on_message: impl FnMut(ReceivedMessage),
) -> &'static str
where
    S: Future<Output = &'static str>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            reason = &mut shutdown => return reason,
            message = messages.recv() => match message {
                Some(message) => on_message(message),
                None => return "delivery closed",
            },
        }
    }
}
