//! Relay-Bus Abstraktion
//!
//! Ein Relay ist ein unabhängig erreichbarer Publish/Subscribe-Endpunkt
//! ohne Zustell- oder Reihenfolgegarantie. Der Signaling Channel spricht
//! ausschließlich über diese Traits mit dem Bus.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Invalid relay URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Relay connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Relay not connected")]
    NotConnected,

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// Ein vom Relay zugestelltes Ereignis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    /// URL des zustellenden Relays
    pub relay: String,
    pub topic: String,
    pub content: String,
}

/// Kennung eines Abonnements auf einem Relay
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Ein einzelner Relay-Endpunkt
#[async_trait]
pub trait Relay: Send + Sync {
    fn url(&self) -> &str;

    /// Abonniert ein Topic; Ereignisse landen im übergebenen Sink
    async fn subscribe(
        &self,
        topic: &str,
        sink: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<SubscriptionId, RelayError>;

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), RelayError>;

    /// Veröffentlicht ohne Zustellbestätigung
    async fn publish(&self, topic: &str, content: &str) -> Result<(), RelayError>;
}

/// Öffnet Relay-Endpunkte anhand ihrer URL
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Relay>, RelayError>;
}
