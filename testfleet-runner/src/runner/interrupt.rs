// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::signal::ShutdownEvent;
use std::{fmt, sync::Arc};
use tokio::sync::watch;
use tracing::debug;

/// Why a run was cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelReason {
    /// A shutdown signal was received.
    Signal(ShutdownEvent),

    /// The sole worker exceeded the memory limit.
    MemoryLimit,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(event) => write!(f, "{event} signal"),
            Self::MemoryLimit => write!(f, "memory limit"),
        }
    }
}

/// Broadcasts cancellation to every dispatcher and the node-only runner.
///
/// Cancellation happens at most once; the first reason wins.
#[derive(Clone, Debug)]
pub struct InterruptController {
    sender: Arc<watch::Sender<Option<CancelReason>>>,
}

impl InterruptController {
    /// Creates a new controller that hasn't been cancelled.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Cancels the run. Returns false if the run was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        });
        if changed {
            debug!("run cancelled: {reason}");
        }
        changed
    }

    /// Returns the reason the run was cancelled, if it was.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.sender.borrow()
    }

    /// Returns a token that observes this controller.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes cancellation from an [`InterruptController`].
#[derive(Clone, Debug)]
pub struct CancelToken {
    receiver: watch::Receiver<Option<CancelReason>>,
}

impl CancelToken {
    /// Returns true if the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Waits until the run is cancelled, returning the reason.
    ///
    /// Returns immediately if the run was cancelled before this was called. Never returns if the
    /// controller is dropped without cancelling.
    pub async fn cancelled(&mut self) -> CancelReason {
        if let Ok(current) = self.receiver.wait_for(Option::is_some).await
            && let Some(reason) = *current
        {
            return reason;
        }
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_reason_wins() {
        let controller = InterruptController::new();
        let mut token = controller.token();
        assert!(!token.is_cancelled());

        assert!(controller.cancel(CancelReason::MemoryLimit));
        assert!(!controller.cancel(CancelReason::Signal(ShutdownEvent::Interrupt)));
        assert!(token.is_cancelled());
        assert_eq!(token.cancelled().await, CancelReason::MemoryLimit);

        // Tokens created after cancellation see it too.
        let mut late = controller.token();
        assert_eq!(late.cancelled().await, CancelReason::MemoryLimit);
        assert_eq!(controller.reason(), Some(CancelReason::MemoryLimit));
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let controller = InterruptController::new();
        let mut token = controller.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.cancel(CancelReason::Signal(ShutdownEvent::Interrupt));
        assert_eq!(
            waiter.await.unwrap(),
            CancelReason::Signal(ShutdownEvent::Interrupt)
        );
    }
}
