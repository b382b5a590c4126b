//! Transport-Abstraktion
//!
//! Alles, was die Call Engine von einer Peer Connection braucht:
//! Offer/Answer, ICE Candidates, Tracks, Statistiken und Zustandsereignisse.
//! Die Produktionsimplementierung liegt in `webrtc_transport`.

use super::media::{MediaTrack, TrackKind};
use crate::config::IceServerConfig;
use crate::sdp::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// ICE Connection State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Gesamtzustand der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Ein vom Peer empfangener Track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    /// Candidate-Sammlung abgeschlossen
    GatheringComplete,
    IceConnectionState(IceConnectionState),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrack),
}

pub type TransportEventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Rohwerte für den Quality Monitor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    /// Round-Trip-Time des nominierten Candidate Pairs
    pub rtt_ms: Option<f64>,
    /// Vom Transport gemeldeter Jitter, falls verfügbar
    pub jitter_ms: Option<f64>,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait Transport: Send + Sync {
    /// Ersetzt den Event-Handler; `None` entfernt ihn
    fn set_event_handler(&self, handler: Option<TransportEventHandler>);

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    /// Tauscht den ausgehenden Track einer Art aus
    ///
    /// Gibt `false` zurück, wenn es keinen Sender dieser Art gibt.
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<&MediaTrack>,
    ) -> Result<bool, TransportError>;

    async fn stats(&self) -> Result<TransportStats, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erzeugt pro Anruf einen neuen Transport
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
