//! Signaling Module - Pseudonymer Pub/Sub über Relays
//!
//! Dieses Modul verwaltet die Signalisierung zwischen zwei Ghost IDs:
//! - Relay-Abstraktion mit WebSocket- und In-Memory-Implementierung
//! - Nachrichten signieren, an alle Relays verteilen
//! - Eingehende Nachrichten filtern, deduplizieren und weiterleiten
//!

mod channel;
mod memory;
mod messages;
mod relay;
mod ws_relay;

pub use channel::{
    ChannelOptions, ChannelState, DropReason, PublishReport, SignalHandlers, SignalingChannel,
    SignalingError,
};
pub use memory::{MemoryBus, MemoryRelay};
pub use messages::*;
pub use relay::{Relay, RelayConnector, RelayError, RelayEvent, SubscriptionId};
pub use ws_relay::{WsRelay, WsRelayConnector};
