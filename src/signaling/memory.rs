//! In-Memory Relay-Bus
//!
//! Jede URL ist ein eigenständiges Relay mit eigenen Abonnenten. Wer auf
//! mehreren Relays abonniert, bekommt dieselbe Nachricht mehrfach, genau
//! wie auf dem echten Bus. Relays lassen sich offline schalten, um
//! Teilausfälle zu simulieren.

use super::relay::{Relay, RelayConnector, RelayError, RelayEvent, SubscriptionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct RelayState {
    subscriptions: HashMap<SubscriptionId, (String, mpsc::UnboundedSender<RelayEvent>)>,
    published: usize,
}

#[derive(Default)]
struct BusState {
    relays: HashMap<String, RelayState>,
    offline: HashSet<String>,
}

/// Geteilter Bus, von dem beliebig viele Teilnehmer Relays öffnen
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector für einen Teilnehmer
    pub fn connector(&self) -> Arc<dyn RelayConnector> {
        Arc::new(self.clone())
    }

    /// Schaltet ein Relay ab (connect/subscribe/publish schlagen fehl)
    pub fn set_offline(&self, url: &str, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline.insert(url.to_string());
        } else {
            state.offline.remove(url);
        }
    }

    /// Stellt rohen Inhalt direkt zu, ohne Signatur oder Prüfung
    pub fn inject(&self, url: &str, topic: &str, content: &str) -> usize {
        self.state.lock().deliver(url, topic, content)
    }

    /// Anzahl der über ein Relay veröffentlichten Nachrichten
    pub fn published_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .relays
            .get(url)
            .map(|r| r.published)
            .unwrap_or(0)
    }

    /// Anzahl aktiver Abonnements auf einem Relay
    pub fn subscription_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .relays
            .get(url)
            .map(|r| r.subscriptions.len())
            .unwrap_or(0)
    }
}

impl BusState {
    fn check_online(&self, url: &str) -> Result<(), RelayError> {
        if self.offline.contains(url) {
            return Err(RelayError::ConnectionFailed(format!("{url} is offline")));
        }
        Ok(())
    }

    fn deliver(&mut self, url: &str, topic: &str, content: &str) -> usize {
        let Some(relay) = self.relays.get_mut(url) else {
            return 0;
        };
        relay.subscriptions.retain(|_, (_, sink)| !sink.is_closed());

        let mut delivered = 0;
        for (sub_topic, sink) in relay.subscriptions.values() {
            if sub_topic == topic {
                let event = RelayEvent {
                    relay: url.to_string(),
                    topic: topic.to_string(),
                    content: content.to_string(),
                };
                if sink.send(event).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl RelayConnector for MemoryBus {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Relay>, RelayError> {
        let mut state = self.state.lock();
        state.check_online(url)?;
        state.relays.entry(url.to_string()).or_default();
        Ok(Arc::new(MemoryRelay {
            url: url.to_string(),
            bus: self.clone(),
        }))
    }
}

/// Sicht eines Teilnehmers auf ein Relay des Busses
pub struct MemoryRelay {
    url: String,
    bus: MemoryBus,
}

#[async_trait]
impl Relay for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn subscribe(
        &self,
        topic: &str,
        sink: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<SubscriptionId, RelayError> {
        let mut state = self.bus.state.lock();
        state
            .check_online(&self.url)
            .map_err(|e| RelayError::SubscribeFailed(e.to_string()))?;
        let id = SubscriptionId::random();
        state
            .relays
            .entry(self.url.clone())
            .or_default()
            .subscriptions
            .insert(id.clone(), (topic.to_string(), sink));
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), RelayError> {
        if let Some(relay) = self.bus.state.lock().relays.get_mut(&self.url) {
            relay.subscriptions.remove(id);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, content: &str) -> Result<(), RelayError> {
        let mut state = self.bus.state.lock();
        state
            .check_online(&self.url)
            .map_err(|e| RelayError::PublishFailed(e.to_string()))?;
        state.deliver(&self.url, topic, content);
        if let Some(relay) = state.relays.get_mut(&self.url) {
            relay.published += 1;
        }
        Ok(())
    }
}
