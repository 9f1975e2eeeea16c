//! Shutdown coordination for the server.

use tokio_util::sync::CancellationToken;

/// Coordinator for graceful shutdown.
///
/// Every long-running task subscribes; subscriptions are hierarchical, so a
/// connection can cancel its own exchanges without affecting its siblings.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Subscribe to the shutdown signal.
    ///
    /// The returned signal fires when the coordinator triggers or when the
    /// signal itself is cancelled; cancelling it does not affect the coordinator.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            token: self.token.child_token(),
        }
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A subscription to a [`Shutdown`] coordinator or to a parent signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Wait until the signal fires.
    pub async fn recv(&self) {
        self.token.cancelled().await;
    }

    /// Derive a signal that fires with this one but can also be fired alone.
    pub fn child(&self) -> ShutdownSignal {
        ShutdownSignal {
            token: self.token.child_token(),
        }
    }

    /// Fire this signal and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_reaches_every_subscriber() {
        let shutdown = Shutdown::new();
        let a = shutdown.subscribe();
        let b = a.child();

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), a.recv()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), b.recv()).await.unwrap();
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn child_cancel_is_local() {
        let shutdown = Shutdown::new();
        let connection = shutdown.subscribe();
        let exchange = connection.child();
        let sibling = connection.child();

        exchange.cancel();
        assert!(exchange.is_triggered());
        assert!(!sibling.is_triggered());
        assert!(!connection.is_triggered());
        assert!(!shutdown.is_triggered());
    }
}
