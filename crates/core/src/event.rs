//! Gateway event system — decoupled notification between subsystems.
//!
//! Events are published when something operationally interesting happens.
//! Subscribers (metrics, audit logging, the adaptive router) receive every
//! event over a broadcast channel and filter for what they care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All gateway events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GatewayEvent {
    /// A request finished, successfully or not.
    RequestCompleted {
        request_id: String,
        provider: String,
        model: String,
        success: bool,
        latency_ms: u64,
        cost: f64,
        timestamp: DateTime<Utc>,
    },

    /// A dispatch to a provider failed.
    ProviderFailed {
        provider: String,
        kind: String,
        timestamp: DateTime<Utc>,
    },

    /// A provider's circuit breaker opened.
    CircuitOpened {
        provider: String,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// A provider's circuit breaker closed after a successful probe.
    CircuitClosed {
        provider: String,
        timestamp: DateTime<Utc>,
    },

    /// A caller was denied by the rate limiter.
    RateLimitDenied {
        subject: String,
        bucket: String,
        retry_after_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An API key was issued.
    KeyIssued {
        key_id: String,
        owner: String,
        timestamp: DateTime<Utc>,
    },

    /// An API key was deactivated.
    KeyRevoked {
        key_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Traffic from a source looked anomalous. Advisory only.
    AnomalyFlagged {
        subject: String,
        rule: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },

    /// A local model finished loading.
    ModelLoaded {
        provider: String,
        model: String,
        timestamp: DateTime<Utc>,
    },

    /// A local model was unloaded.
    ModelUnloaded {
        provider: String,
        model: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Publishing
/// never blocks; slow subscribers lag and drop, they cannot stall the
/// request path.
pub struct EventBus {
    sender: broadcast::Sender<Arc<GatewayEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: GatewayEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GatewayEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(GatewayEvent::CircuitOpened {
            provider: "p_oai".into(),
            consecutive_failures: 5,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            GatewayEvent::CircuitOpened {
                provider,
                consecutive_failures,
                ..
            } => {
                assert_eq!(provider, "p_oai");
                assert_eq!(*consecutive_failures, 5);
            }
            _ => panic!("Expected CircuitOpened event"),
        }
    }

    #[test]
    fn publish_without_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(GatewayEvent::KeyRevoked {
            key_id: "llmr_abc".into(),
            timestamp: Utc::now(),
        });
    }
}
