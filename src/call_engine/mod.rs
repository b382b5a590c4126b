//! Call Engine Module - WebRTC Anrufe zwischen zwei Ghost IDs
//!
//! Dieses Modul verwaltet:
//! - Den Zustandsautomaten eines Anrufs inkl. ICE-Restart
//! - Lokale Medien (Mikrofon, Kamera, Bildschirm)
//! - Puffern und Anwenden von ICE Candidates
//! - Die Bewertung der Netzwerkqualität

mod candidates;
mod engine;
#[cfg(test)]
mod fakes;
mod media;
mod quality;
mod session;
mod transport;
mod webrtc_transport;

pub use candidates::CandidateManager;
pub use engine::{
    CallEngine, CallEngineError, CallEvent, CallState, CallStats, EngineDeps, MediaState,
    REJECT_REASON,
};
pub use media::{
    synthetic_track, MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack,
    QualityHint, SyntheticMedia, TrackKind, SAMPLE_RATE,
};
pub use quality::{classify, NetworkQuality, QualityMonitor, QualitySample};
pub use transport::{
    ConnectionState, IceConnectionState, RemoteTrack, Transport, TransportError, TransportEvent,
    TransportEventHandler, TransportFactory, TransportStats,
};
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};
