//! WebSocket Relay-Endpunkt
//!
//! Spricht ein schlichtes JSON-Array-Protokoll:
//! - Client → Relay: `["REQ", subId, {"topics": [topic]}]`,
//!   `["EVENT", {"topic": .., "content": ..}]`, `["CLOSE", subId]`
//! - Relay → Client: `["EVENT", subId, {"topic": .., "content": ..}]`,
//!   `["NOTICE", text]`
//!
//! Eine Verbindung pro Relay, ein Read-Task und ein Write-Task.

use super::relay::{Relay, RelayConnector, RelayError, RelayEvent, SubscriptionId};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Abstand der WebSocket-Pings auf einer Relay-Verbindung
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type Subscriptions = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<RelayEvent>>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEvent {
    topic: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct WireFilter<'a> {
    topics: [&'a str; 1],
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Öffnet `ws://` und `wss://` Relays
#[derive(Debug, Default, Clone, Copy)]
pub struct WsRelayConnector;

#[async_trait]
impl RelayConnector for WsRelayConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Relay>, RelayError> {
        let relay = WsRelay::connect(url).await?;
        Ok(Arc::new(relay))
    }
}

// ============================================================================
// RELAY
// ============================================================================

pub struct WsRelay {
    url: String,
    tx: mpsc::Sender<String>,
    subscriptions: Subscriptions,
    connected: Arc<AtomicBool>,
}

impl WsRelay {
    /// Baut die WebSocket-Verbindung auf und startet Read/Write-Tasks
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        Self::connect_with_heartbeat(url, HEARTBEAT_INTERVAL).await
    }

    async fn connect_with_heartbeat(url: &str, heartbeat: Duration) -> Result<Self, RelayError> {
        let parsed = url::Url::parse(url).map_err(|e| RelayError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RelayError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        tracing::info!("Connecting to relay: {}", url);

        let (ws_stream, _) = connect_async(parsed.as_str())
            .await
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);
        let subscriptions: Subscriptions = Arc::new(RwLock::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Read-Task
        let subs = Arc::clone(&subscriptions);
        let connected_clone = Arc::clone(&connected);
        let relay_url = url.to_string();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => Self::handle_frame(&relay_url, &text, &subs),
                    Ok(Message::Close(_)) => {
                        tracing::info!("Relay {} closed the connection", relay_url);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Relay {} error: {}", relay_url, e);
                        break;
                    }
                    _ => {}
                }
            }
            connected_clone.store(false, Ordering::SeqCst);
            subs.write().clear();
        });

        // Write-Task mit Heartbeat
        let relay_url = url.to_string();
        let connected_clone = Arc::clone(&connected);
        let period = heartbeat.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(text) => Message::Text(text),
                        None => break,
                    },
                    _ = ticker.tick() => {
                        tracing::trace!("Heartbeat to relay {}", relay_url);
                        Message::Ping(Vec::new())
                    }
                };
                if let Err(e) = write.send(msg).await {
                    tracing::warn!("Failed to write to relay {}: {}", relay_url, e);
                    break;
                }
            }
            connected_clone.store(false, Ordering::SeqCst);
            let _ = write.close().await;
        });

        Ok(Self {
            url: url.to_string(),
            tx,
            subscriptions,
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Verarbeitet einen eingehenden Frame; alles Unbekannte wird verworfen
    fn handle_frame(relay: &str, text: &str, subscriptions: &Subscriptions) {
        let Ok(frame) = serde_json::from_str::<Vec<serde_json::Value>>(text) else {
            tracing::debug!("Dropping non-frame message from {}", relay);
            return;
        };

        match frame.first().and_then(|v| v.as_str()) {
            Some("EVENT") if frame.len() >= 3 => {
                let Some(sub_id) = frame[1].as_str() else {
                    return;
                };
                let Ok(event) = serde_json::from_value::<WireEvent>(frame[2].clone()) else {
                    tracing::debug!("Dropping malformed event from {}", relay);
                    return;
                };
                if let Some(sink) = subscriptions.read().get(sub_id) {
                    let _ = sink.send(RelayEvent {
                        relay: relay.to_string(),
                        topic: event.topic,
                        content: event.content,
                    });
                }
            }
            Some("NOTICE") => {
                tracing::info!("Relay {} notice: {:?}", relay, frame.get(1));
            }
            _ => {}
        }
    }

    async fn send_frame(&self, frame: serde_json::Value) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        self.tx
            .send(frame.to_string())
            .await
            .map_err(|_| RelayError::NotConnected)
    }
}

#[async_trait]
impl Relay for WsRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn subscribe(
        &self,
        topic: &str,
        sink: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<SubscriptionId, RelayError> {
        let id = SubscriptionId::random();
        self.subscriptions.write().insert(id.0.clone(), sink);

        let filter = WireFilter { topics: [topic] };
        let frame = serde_json::json!(["REQ", id.0, filter]);
        if let Err(e) = self.send_frame(frame).await {
            self.subscriptions.write().remove(&id.0);
            return Err(RelayError::SubscribeFailed(e.to_string()));
        }
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), RelayError> {
        self.subscriptions.write().remove(&id.0);
        self.send_frame(serde_json::json!(["CLOSE", id.0])).await
    }

    async fn publish(&self, topic: &str, content: &str) -> Result<(), RelayError> {
        let event = WireEvent {
            topic: topic.to_string(),
            content: content.to_string(),
        };
        self.send_frame(serde_json::json!(["EVENT", event]))
            .await
            .map_err(|e| RelayError::PublishFailed(e.to_string()))
    }
}

impl std::fmt::Debug for WsRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRelay")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}
