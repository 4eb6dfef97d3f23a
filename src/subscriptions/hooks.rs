//! Connection lifecycle hooks
//!
//! The protocol handler stays protocol-only: it never touches subscription
//! storage directly. The owning service supplies this interface to decide
//! what starting, stopping, and losing a connection actually mean.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::error::SubscriptionError;
use super::registry::{ConnectionId, Subscription, SubscriptionKey, SubscriptionRegistry};

#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// A client asked to start an operation. An error is reported back to the
    /// client; the connection stays open.
    async fn on_start(&self, subscription: Subscription) -> Result<(), SubscriptionError>;

    /// A client stopped one of its operations
    async fn on_stop(&self, connection: ConnectionId, operation_id: &str);

    /// The connection is going away, deliberately or not. Runs before the
    /// transport is closed.
    async fn on_close(&self, connection: ConnectionId);
}

/// Production hooks: wires the protocol handler to the subscription registry
pub struct RegistryHooks {
    registry: Arc<SubscriptionRegistry>,
    close_grace: Duration,
}

impl RegistryHooks {
    pub fn new(registry: Arc<SubscriptionRegistry>, close_grace: Duration) -> Self {
        Self {
            registry,
            close_grace,
        }
    }
}

#[async_trait]
impl ConnectionEvents for RegistryHooks {
    async fn on_start(&self, subscription: Subscription) -> Result<(), SubscriptionError> {
        self.registry.add_subscription(subscription)
    }

    async fn on_stop(&self, connection: ConnectionId, operation_id: &str) {
        self.registry.remove_subscription(&SubscriptionKey {
            connection,
            operation: operation_id.to_string(),
        });
    }

    async fn on_close(&self, connection: ConnectionId) {
        // Let in-flight deliveries drain before the teardown
        if !self.close_grace.is_zero() {
            tokio::time::sleep(self.close_grace).await;
        }
        let removed = self.registry.remove_connection(connection);
        if removed > 0 {
            tracing::debug!(%connection, removed, "connection subscriptions cleaned up");
        }
    }
}
