//! Ghostline - Pseudonymer P2P Anrufaufbau über nicht vertrauenswürdige Relays
//!
//! Zwei Teilnehmer, die sich auf eine gemeinsame Session-ID geeinigt haben,
//! bauen einen WebRTC-Anruf auf, ohne einander ihre Identität zu zeigen:
//! - Ephemere Ed25519 "Ghost IDs" pro Anrufversuch
//! - Signalisierung über mehrere öffentliche Relays gleichzeitig
//! - Automatischer ICE-Restart bei Verbindungsabbrüchen

pub mod call_engine;
pub mod config;
pub mod crypto;
pub mod sdp;
pub mod signaling;

pub use call_engine::{
    CallEngine, CallEngineError, CallEvent, CallState, CallStats, EngineDeps, MediaState,
    NetworkQuality,
};
pub use config::{CallConfig, IceServerConfig};
pub use crypto::{GhostId, GhostIdentity};
pub use sdp::{IceCandidate, SdpKind, SessionDescription};
pub use signaling::{CallType, SignalingChannel, SignalingError};

// ============================================================================
// LOGGING
// ============================================================================

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "ghostline=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// Mehrfache Aufrufe sind harmlos; ein bereits installierter Subscriber
/// bleibt aktiv.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::info!("Ghostline {} logging initialized", env!("CARGO_PKG_VERSION"));
    }
}
