//! WebRTC Transport
//!
//! Peer Connection auf Basis von webrtc-rs. Callbacks der Peer Connection
//! werden in [`TransportEvent`]s übersetzt und an den registrierten Handler
//! weitergegeben.

use super::media::{MediaTrack, TrackKind};
use super::transport::{
    ConnectionState, IceConnectionState, RemoteTrack, Transport, TransportError, TransportEvent,
    TransportEventHandler, TransportFactory, TransportStats,
};
use crate::config::IceServerConfig;
use crate::sdp::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::stats::StatsReportType;

type HandlerSlot = Arc<RwLock<Option<TransportEventHandler>>>;

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

fn emit(slot: &HandlerSlot, event: TransportEvent) {
    let handler = slot.read().clone();
    if let Some(handler) = handler {
        handler(event);
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt Peer Connections mit Standard-Codecs und Interceptors
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = WebRtcTransport::new(ice_servers).await?;
        Ok(Arc::new(transport))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    handler: HandlerSlot,
}

impl WebRtcTransport {
    /// Erstellt eine neue Peer Connection
    pub async fn new(ice_servers: &[IceServerConfig]) -> Result<Self, TransportError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);
        let handler: HandlerSlot = Arc::new(RwLock::new(None));
        Self::setup_handlers(&pc, &handler);

        Ok(Self { pc, handler })
    }

    /// Registriert die Callbacks der Peer Connection
    fn setup_handlers(pc: &Arc<RTCPeerConnection>, handler: &HandlerSlot) {
        let slot = Arc::clone(handler);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate {
                Some(c) => match c.to_json() {
                    Ok(init) => emit(
                        &slot,
                        TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                    ),
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                },
                None => emit(&slot, TransportEvent::GatheringComplete),
            }
            Box::pin(async {})
        }));

        let slot = Arc::clone(handler);
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let state = match s {
                RTCIceConnectionState::Checking => IceConnectionState::Checking,
                RTCIceConnectionState::Connected => IceConnectionState::Connected,
                RTCIceConnectionState::Completed => IceConnectionState::Completed,
                RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
                RTCIceConnectionState::Failed => IceConnectionState::Failed,
                RTCIceConnectionState::Closed => IceConnectionState::Closed,
                _ => IceConnectionState::New,
            };
            emit(&slot, TransportEvent::IceConnectionState(state));
            Box::pin(async {})
        }));

        let slot = Arc::clone(handler);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = match s {
                RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                RTCPeerConnectionState::Connected => ConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
                _ => ConnectionState::New,
            };
            emit(&slot, TransportEvent::ConnectionState(state));
            Box::pin(async {})
        }));

        let slot = Arc::clone(handler);
        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            emit(
                &slot,
                TransportEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }),
            );
            Box::pin(async {})
        }));
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let result = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        result.map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn set_event_handler(&self, handler: Option<TransportEventHandler>) {
        *self.handler.write() = handler;
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(webrtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(webrtc_err)
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        self.pc.add_track(track.local()).await.map_err(webrtc_err)?;
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<&MediaTrack>,
    ) -> Result<bool, TransportError> {
        let wanted = codec_type(kind);
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() != wanted {
                continue;
            }
            let sender = transceiver.sender().await;
            sender
                .replace_track(track.map(MediaTrack::local))
                .await
                .map_err(webrtc_err)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();

        for entry in report.reports.values() {
            match entry {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    stats.rtt_ms = Some(pair.current_round_trip_time * 1000.0);
                    stats.bytes_sent = pair.bytes_sent;
                    stats.bytes_received = pair.bytes_received;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.packets_received += remote.packets_received;
                    stats.packets_lost += u64::try_from(remote.packets_lost).unwrap_or(0);
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<(), TransportError> {
        *self.handler.write() = None;
        self.pc.close().await.map_err(webrtc_err)
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("connection_state", &self.pc.connection_state())
            .field("ice_connection_state", &self.pc.ice_connection_state())
            .finish()
    }
}
