//! Call Engine
//!
//! Zustandsautomat für genau einen Anruf:
//! `idle → connecting → ringing → connected ⇄ reconnecting → ended|failed`.
//!
//! Transport-Callbacks, eingehende Signale und Timer landen in der Queue
//! der aktiven Session und werden von einer Loop nacheinander verarbeitet.
//! Die öffentlichen Operationen teilen sich mit dieser Loop den Session-Slot,
//! dadurch gibt es keine konkurrierenden Zustandsänderungen.

use super::media::{
    MediaConstraints, MediaDevices, MediaError, MediaStream, QualityHint, SyntheticMedia,
    TrackKind,
};
use super::quality::{NetworkQuality, QualitySample};
use super::session::{signal_handlers, Session, SessionEvent};
use super::transport::{
    ConnectionState, IceConnectionState, RemoteTrack, TransportError, TransportEvent,
    TransportFactory, TransportStats,
};
use super::webrtc_transport::WebRtcTransportFactory;
use crate::config::CallConfig;
use crate::crypto::{GhostId, IdentityGenerator, OsIdentityGenerator};
use crate::sdp::{IceCandidate, SessionDescription};
use crate::signaling::{
    AnswerPayload, CallType, ChannelOptions, HangupPayload, OfferPayload, RelayConnector,
    SignalingChannel, SignalingError, WsRelayConnector,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

/// Hangup-Grund beim Ablehnen eines Anrufs
pub const REJECT_REASON: &str = "rejected";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call from this peer")]
    NoIncomingCall,

    #[error("Connection lost after {0} reconnection attempts")]
    ReconnectExhausted(u32),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Medien und Transport werden aufgebaut
    Connecting,
    /// Offer veröffentlicht bzw. eingehender Anruf wartet auf Antwort
    Ringing,
    /// Anruf aktiv
    Connected,
    /// ICE-Restart läuft
    Reconnecting,
    /// Anruf beendet
    Ended,
    /// Aufbau oder Wiederverbindung gescheitert
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub audio_muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    /// Seit dem ersten `connected`
    pub duration: Duration,
    pub network_quality: Option<NetworkQuality>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Events die vom CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    LocalStream(MediaStream),
    RemoteTrack(RemoteTrack),
    NetworkQuality(QualitySample),
    IncomingCall {
        remote: GhostId,
        call_type: CallType,
        offer: SessionDescription,
    },
    CallEnded {
        reason: Option<String>,
    },
    Error(String),
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Externe Bausteine der Engine
#[derive(Clone)]
pub struct EngineDeps {
    pub media: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub relays: Arc<dyn RelayConnector>,
    pub identities: Arc<dyn IdentityGenerator>,
}

impl EngineDeps {
    /// webrtc-rs Transport, WebSocket-Relays, synthetische Medien
    pub fn webrtc() -> Self {
        Self {
            media: Arc::new(SyntheticMedia),
            transports: Arc::new(WebRtcTransportFactory),
            relays: Arc::new(WsRelayConnector),
            identities: Arc::new(OsIdentityGenerator),
        }
    }
}

#[derive(Debug, Default)]
struct Metrics {
    connected_at: Option<Instant>,
    quality: Option<NetworkQuality>,
    bytes_received: u64,
    bytes_sent: u64,
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct Shared {
    config: CallConfig,
    deps: EngineDeps,
    state: Mutex<CallState>,
    media_state: Mutex<MediaState>,
    metrics: Mutex<Metrics>,
    session: tokio::sync::Mutex<Option<Session>>,
    event_tx: broadcast::Sender<CallEvent>,
    next_session: AtomicU64,
}

type Slot = Option<Session>;

impl Shared {
    fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// Aktualisiert den State und sendet Event
    fn set_state(&self, new_state: CallState) {
        {
            let mut state = self.state.lock();
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        tracing::info!("Call state: {:?}", new_state);
        let _ = self.event_tx.send(CallEvent::StateChanged(new_state));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Öffnet den Signaling Channel einer neuen Session und startet deren Loop
    async fn open_session(self: &Arc<Self>, session_id: &str) -> Result<Session, SignalingError> {
        let channel = Arc::new(SignalingChannel::new(
            session_id,
            Arc::clone(&self.deps.relays),
            self.deps.identities.as_ref(),
            ChannelOptions {
                expiry: self.config.signal_expiry,
                publish_concurrency: self.config.publish_concurrency,
            },
        ));
        let (events, rx) = mpsc::unbounded_channel();
        channel.set_handlers(signal_handlers(&events));
        channel.connect(&self.config.relays).await?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(Self::run_session(Arc::downgrade(self), id, rx, shutdown_rx));

        Ok(Session::new(id, session_id, channel, events, shutdown))
    }

    /// Verarbeitet die Queue einer Session, bis diese verworfen wird
    async fn run_session(
        shared: Weak<Self>,
        id: u64,
        mut rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            let event = tokio::select! {
                _ = &mut shutdown => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let mut slot = shared.session.lock().await;
            if !slot.as_ref().is_some_and(|s| s.id == id) {
                break;
            }
            shared.handle_event(&mut slot, event).await;
        }
        tracing::trace!("Session loop {} finished", id);
    }

    async fn handle_event(self: &Arc<Self>, slot: &mut Slot, event: SessionEvent) {
        match event {
            SessionEvent::Transport(event) => self.on_transport_event(slot, event).await,
            SessionEvent::Offer(from, offer) => self.on_offer(slot, from, offer).await,
            SessionEvent::Answer(from, answer) => self.on_answer(slot, from, answer).await,
            SessionEvent::RemoteCandidate(from, candidate) => {
                self.on_remote_candidate(slot, from, candidate).await
            }
            SessionEvent::Hangup(from, hangup) => self.on_hangup(slot, from, hangup).await,
            SessionEvent::Stats(stats) => self.on_stats(slot, &stats),
            SessionEvent::ScreenTrackEnded(track_id) => {
                if let Some(session) = slot.as_mut() {
                    let sharing = session
                        .screen_stream
                        .as_ref()
                        .is_some_and(|s| s.tracks.iter().any(|t| t.id() == track_id));
                    if sharing {
                        tracing::info!("Screen share ended by source");
                        self.restore_camera(session).await;
                    }
                }
            }
        }
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    async fn on_transport_event(self: &Arc<Self>, slot: &mut Slot, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let Some(session) = slot.as_ref() else {
                    return;
                };
                let channel = Arc::clone(&session.channel);
                let target = session.remote.clone();
                tokio::spawn(async move {
                    if let Err(e) = channel.send_ice_candidate(candidate, target.as_ref()).await {
                        tracing::debug!("Local candidate not published: {}", e);
                    }
                });
            }
            TransportEvent::GatheringComplete => {}
            TransportEvent::IceConnectionState(state) => {
                if let Some(session) = slot.as_mut() {
                    session.last_ice_state = Some(state);
                }
                match state {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        self.on_link_up(slot)
                    }
                    IceConnectionState::Failed | IceConnectionState::Disconnected => {
                        self.on_link_failure(slot).await
                    }
                    _ => {}
                }
            }
            TransportEvent::ConnectionState(ConnectionState::Connected) => self.on_link_up(slot),
            TransportEvent::ConnectionState(ConnectionState::Failed) => {
                // Spiegelt meist nur ein bereits gemeldetes ICE-Failed
                let mirrored = slot
                    .as_ref()
                    .is_some_and(|s| s.last_ice_state == Some(IceConnectionState::Failed));
                if !mirrored {
                    self.on_link_failure(slot).await;
                }
            }
            TransportEvent::ConnectionState(_) => {}
            TransportEvent::RemoteTrack(track) => self.emit(CallEvent::RemoteTrack(track)),
        }
    }

    fn on_link_up(&self, slot: &mut Slot) {
        let Some(session) = slot.as_mut() else {
            return;
        };
        if session.transport.is_none() {
            return;
        }
        match self.state() {
            CallState::Connecting | CallState::Ringing | CallState::Reconnecting => {
                session.reconnect_attempts = 0;
                self.metrics
                    .lock()
                    .connected_at
                    .get_or_insert_with(Instant::now);
                self.set_state(CallState::Connected);
                session.start_monitor(self.config.quality_interval);
            }
            CallState::Connected => session.reconnect_attempts = 0,
            _ => {}
        }
    }

    async fn on_link_failure(self: &Arc<Self>, slot: &mut Slot) {
        let state = self.state();
        let (attempts, remote_known) = {
            let Some(session) = slot.as_mut() else {
                return;
            };
            if session.transport.is_none()
                || !matches!(
                    state,
                    CallState::Connecting
                        | CallState::Ringing
                        | CallState::Connected
                        | CallState::Reconnecting
                )
            {
                return;
            }
            session.stop_monitor();
            session.reconnect_attempts += 1;
            (session.reconnect_attempts, session.remote.is_some())
        };

        let max = self.config.max_reconnect_attempts;
        if attempts >= max {
            let error = CallEngineError::ReconnectExhausted(attempts);
            self.fail(slot, &error).await;
            return;
        }
        if !remote_known {
            let error = CallEngineError::Transport(TransportError::WebRTC(
                "connection failed before the call was answered".into(),
            ));
            self.fail(slot, &error).await;
            return;
        }

        tracing::warn!("Link failed, reconnecting (attempt {}/{})", attempts, max);
        self.set_state(CallState::Reconnecting);
        let Some(session) = slot.as_mut() else {
            return;
        };
        if session.owns_restart() {
            Self::restart_ice(session).await;
        } else {
            tracing::debug!("Waiting for restart offer from remote");
        }
    }

    /// Erzeugt ein ICE-Restart-Offer mit neuer Epoche und verschickt es
    async fn restart_ice(session: &mut Session) {
        let (Some(transport), Some(remote)) = (session.transport.clone(), session.remote.clone())
        else {
            return;
        };
        let epoch = session.epoch + 1;

        let offer = match transport.create_offer(true).await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!("ICE restart offer failed: {}", e);
                return;
            }
        };
        if let Err(e) = transport.set_local_description(offer.clone()).await {
            tracing::warn!("ICE restart offer rejected locally: {}", e);
            return;
        }
        session.epoch = epoch;
        session.pending_offer = Some(epoch);

        let channel = Arc::clone(&session.channel);
        let payload = OfferPayload {
            description: offer,
            call_type: session.call_type,
            restart_epoch: epoch,
        };
        tokio::spawn(async move {
            match channel.send_offer(payload, Some(&remote)).await {
                Ok(report) => tracing::debug!(
                    "Restart offer {} published to {} relays",
                    epoch,
                    report.delivered.len()
                ),
                Err(e) => tracing::warn!("Restart offer {} not published: {}", epoch, e),
            }
        });
    }

    fn on_stats(&self, slot: &mut Slot, stats: &TransportStats) {
        if self.state() != CallState::Connected {
            return;
        }
        let Some(session) = slot.as_mut() else {
            return;
        };
        let sample = session.quality.sample(stats);
        {
            let mut metrics = self.metrics.lock();
            metrics.quality = Some(sample.quality);
            metrics.bytes_received = stats.bytes_received;
            metrics.bytes_sent = stats.bytes_sent;
        }
        tracing::debug!(
            "Quality {:?} (rtt {:.0}ms, jitter {:.0}ms, loss {:.1}%)",
            sample.quality,
            sample.rtt_ms,
            sample.jitter_ms,
            sample.packet_loss_pct
        );
        self.emit(CallEvent::NetworkQuality(sample));
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    async fn on_offer(self: &Arc<Self>, slot: &mut Slot, from: GhostId, offer: OfferPayload) {
        let Some(session) = slot.as_mut() else {
            return;
        };

        // Noch kein Transport: eingehender Anruf
        let Some(transport) = session.transport.clone() else {
            let state = self.state();
            if offer.restart_epoch != 0 || state != CallState::Idle {
                tracing::debug!("Ignoring offer from {} while {:?}", from.short(), state);
                return;
            }
            tracing::info!("Incoming {:?} call from {}", offer.call_type, from.short());
            session.remote = Some(from.clone());
            session.call_type = offer.call_type;
            self.set_state(CallState::Ringing);
            self.emit(CallEvent::IncomingCall {
                remote: from,
                call_type: offer.call_type,
                offer: offer.description,
            });
            return;
        };

        if session.remote.as_ref() != Some(&from) {
            tracing::debug!("Ignoring offer from unknown peer {}", from.short());
            return;
        }
        let epoch = offer.restart_epoch;
        if epoch == 0 || session.answered_epoch.is_some_and(|answered| epoch <= answered) {
            tracing::debug!("Ignoring stale offer (epoch {})", epoch);
            return;
        }

        // Ein eigenes Offer ist offen; webrtc-rs kann es nicht zurückrollen
        if let Some(mine) = session.pending_offer {
            tracing::info!(
                "Ignoring restart offer {} while local offer {} is pending",
                epoch,
                mine
            );
            return;
        }

        let answer = async {
            transport.set_remote_description(offer.description).await?;
            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            Ok::<_, TransportError>(answer)
        }
        .await;

        match answer {
            Ok(answer) => {
                session.answered_epoch = Some(epoch);
                session.epoch = session.epoch.max(epoch);
                session.candidates.on_ice_restart();
                let channel = Arc::clone(&session.channel);
                let payload = AnswerPayload {
                    description: answer,
                    restart_epoch: epoch,
                };
                tokio::spawn(async move {
                    if let Err(e) = channel.send_answer(payload, Some(&from)).await {
                        tracing::warn!("Restart answer {} not published: {}", epoch, e);
                    }
                });
            }
            Err(e) => tracing::warn!("Failed to apply restart offer {}: {}", epoch, e),
        }
    }

    async fn on_answer(self: &Arc<Self>, slot: &mut Slot, from: GhostId, answer: AnswerPayload) {
        let result = {
            let Some(session) = slot.as_mut() else {
                return;
            };
            let Some(transport) = session.transport.clone() else {
                return;
            };
            if session.remote.as_ref().is_some_and(|remote| remote != &from) {
                tracing::debug!("Ignoring answer from unknown peer {}", from.short());
                return;
            }
            if session.pending_offer != Some(answer.restart_epoch) {
                tracing::debug!("Ignoring answer for epoch {}", answer.restart_epoch);
                return;
            }

            let result = transport.set_remote_description(answer.description).await;
            if result.is_ok() {
                session.pending_offer = None;
                if answer.restart_epoch > 0 {
                    session.candidates.on_ice_restart();
                }
                if session.remote.is_none() {
                    tracing::info!("Call answered by {}", from.short());
                    session.remote = Some(from);
                }
                session.candidates.on_remote_description_set().await;
                for candidate in session.take_early_candidates() {
                    session.candidates.add_remote_candidate(candidate).await;
                }
            }
            result
        };

        match result {
            Ok(()) => {}
            Err(e) if answer.restart_epoch == 0 => {
                self.fail(slot, &CallEngineError::Transport(e)).await;
            }
            Err(e) => tracing::warn!("Failed to apply restart answer: {}", e),
        }
    }

    async fn on_remote_candidate(&self, slot: &mut Slot, from: GhostId, candidate: IceCandidate) {
        let Some(session) = slot.as_mut() else {
            return;
        };
        if session.remote.as_ref().is_some_and(|remote| remote != &from) {
            tracing::trace!("Ignoring candidate from unknown peer {}", from.short());
            return;
        }
        // Absender erst nach Offer bzw. Answer zuordenbar
        if session.transport.is_none() || session.remote.is_none() {
            session.hold_early_candidate(from, candidate);
            return;
        }
        session.candidates.add_remote_candidate(candidate).await;
    }

    async fn on_hangup(self: &Arc<Self>, slot: &mut Slot, from: GhostId, hangup: HangupPayload) {
        let from_remote = slot
            .as_ref()
            .is_some_and(|s| s.remote.as_ref() == Some(&from));
        if !from_remote {
            tracing::debug!("Ignoring hangup from {}", from.short());
            return;
        }
        tracing::info!("Remote {} hung up ({:?})", from.short(), hangup.reason);
        self.teardown(slot, CallState::Ended, None, hangup.reason).await;
    }

    // ========================================================================
    // SETUP
    // ========================================================================

    async fn setup_outbound(&self, session: &mut Session) -> Result<(), CallEngineError> {
        let transport = self.deps.transports.create(&self.config.ice_servers).await?;
        session.attach_transport(Arc::clone(&transport));

        if let Some(stream) = &session.local_stream {
            for track in &stream.tracks {
                transport.add_track(track).await?;
            }
        }

        let offer = transport.create_offer(false).await?;
        transport.set_local_description(offer.clone()).await?;
        session.pending_offer = Some(0);

        let report = session
            .channel
            .send_offer(
                OfferPayload {
                    description: offer,
                    call_type: session.call_type,
                    restart_epoch: 0,
                },
                None,
            )
            .await?;
        tracing::info!(
            "Offer for session {} published to {} relays",
            session.session_id,
            report.delivered.len()
        );
        Ok(())
    }

    async fn setup_inbound(
        &self,
        session: &mut Session,
        offer: SessionDescription,
    ) -> Result<(), CallEngineError> {
        let transport = self.deps.transports.create(&self.config.ice_servers).await?;
        session.attach_transport(Arc::clone(&transport));

        for candidate in session.take_early_candidates() {
            session.candidates.add_remote_candidate(candidate).await;
        }

        transport.set_remote_description(offer).await?;
        session.candidates.on_remote_description_set().await;

        if let Some(stream) = &session.local_stream {
            for track in &stream.tracks {
                transport.add_track(track).await?;
            }
        }

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        session.answered_epoch = Some(0);

        session
            .channel
            .send_answer(
                AnswerPayload {
                    description: answer,
                    restart_epoch: 0,
                },
                session.remote.as_ref(),
            )
            .await?;
        Ok(())
    }

    async fn acquire_media(
        &self,
        call_type: CallType,
        quality: QualityHint,
    ) -> Result<MediaStream, MediaError> {
        let constraints = MediaConstraints {
            audio: true,
            video: call_type == CallType::Video,
            quality,
        };
        let stream = self.deps.media.get_user_media(&constraints).await?;
        *self.media_state.lock() = MediaState {
            audio_muted: false,
            video_enabled: stream.video_tracks().next().is_some(),
            screen_sharing: false,
        };
        Ok(stream)
    }

    async fn restore_camera(&self, session: &mut Session) {
        if let Some(watch) = session.screen_watch.take() {
            watch.abort();
        }
        let Some(screen) = session.screen_stream.take() else {
            return;
        };
        screen.stop();

        if let Some(transport) = session.transport.clone() {
            let camera = session
                .local_stream
                .as_ref()
                .and_then(|s| s.video_tracks().next().cloned());
            if let Err(e) = transport.replace_track(TrackKind::Video, camera.as_ref()).await {
                tracing::warn!("Restoring camera track failed: {}", e);
            }
        }
        self.media_state.lock().screen_sharing = false;
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Meldet einen Fehler und beendet den Anruf mit `failed`
    async fn fail(self: &Arc<Self>, slot: &mut Slot, error: &CallEngineError) {
        tracing::error!("Call failed: {}", error);
        self.emit(CallEvent::Error(error.to_string()));
        self.teardown(
            slot,
            CallState::Failed,
            Some(HangupPayload::default()),
            Some(error.to_string()),
        )
        .await;
    }

    /// Gibt die Session frei; idempotent
    ///
    /// `hangup` wird vorher best-effort an den Remote-Peer geschickt.
    async fn teardown(
        self: &Arc<Self>,
        slot: &mut Slot,
        final_state: CallState,
        hangup: Option<HangupPayload>,
        reason: Option<String>,
    ) {
        let state = self.state();
        let session = slot.take();
        // Ohne Session gibt es nur noch Fehler vor dem Aufbau zu melden
        if session.is_none()
            && (state.is_terminal() || (state == CallState::Idle && final_state != CallState::Failed))
        {
            return;
        }
        let listening_only = state == CallState::Idle && final_state == CallState::Ended;

        if let Some(session) = session {
            if let (Some(hangup), false) = (hangup, listening_only) {
                if let Err(e) = session
                    .channel
                    .send_hangup(hangup, session.remote.as_ref())
                    .await
                {
                    tracing::debug!("Hangup not delivered: {}", e);
                }
            }
            session.release().await;
        }
        *self.media_state.lock() = MediaState::default();
        *self.metrics.lock() = Metrics::default();

        if listening_only {
            return;
        }
        self.emit(CallEvent::CallEnded { reason });
        self.set_state(final_state);
        self.schedule_idle_reset();
    }

    fn schedule_idle_reset(self: &Arc<Self>) {
        let delay = self.config.idle_reset_delay;
        if delay.is_zero() {
            self.set_state(CallState::Idle);
            return;
        }
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.state().is_terminal() {
                shared.set_state(CallState::Idle);
            }
        });
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// P2P Call Engine
pub struct CallEngine {
    shared: Arc<Shared>,
}

impl CallEngine {
    /// Erstellt eine CallEngine mit webrtc-rs und WebSocket-Relays
    pub fn new(config: CallConfig) -> Self {
        Self::with_deps(config, EngineDeps::webrtc())
    }

    pub fn with_deps(config: CallConfig, deps: EngineDeps) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let config = config.normalized();

        Self {
            shared: Arc::new(Shared {
                config,
                deps,
                state: Mutex::new(CallState::Idle),
                media_state: Mutex::new(MediaState::default()),
                metrics: Mutex::new(Metrics::default()),
                session: tokio::sync::Mutex::new(None),
                event_tx,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn config(&self) -> &CallConfig {
        &self.shared.config
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        self.shared.state()
    }

    pub fn media_state(&self) -> MediaState {
        *self.shared.media_state.lock()
    }

    pub fn stats(&self) -> CallStats {
        let metrics = self.shared.metrics.lock();
        CallStats {
            duration: metrics
                .connected_at
                .map(|t| t.elapsed())
                .unwrap_or_default(),
            network_quality: metrics.quality,
            bytes_received: metrics.bytes_received,
            bytes_sent: metrics.bytes_sent,
        }
    }

    /// Eigene Ghost ID der aktiven Session
    pub async fn ghost_id(&self) -> Option<GhostId> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.own_id().clone())
    }

    pub async fn remote_ghost_id(&self) -> Option<GhostId> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.remote.clone())
    }

    /// Lokale und angewendete Remote Candidates (Diagnose)
    pub async fn candidates(&self) -> (Vec<IceCandidate>, Vec<IceCandidate>) {
        match self.shared.session.lock().await.as_ref() {
            Some(s) => (s.candidates.local_candidates(), s.candidates.remote_candidates()),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Lauscht auf eingehende Anrufe einer Session
    pub async fn listen(&self, session_id: &str) -> Result<(), CallEngineError> {
        let shared = &self.shared;
        let mut slot = shared.session.lock().await;

        if let Some(session) = slot.as_ref() {
            if session.session_id == session_id && shared.state() == CallState::Idle {
                return Ok(());
            }
            return Err(CallEngineError::AlreadyInCall);
        }
        if shared.state() != CallState::Idle {
            return Err(CallEngineError::AlreadyInCall);
        }

        let session = shared.open_session(session_id).await?;
        tracing::info!(
            "Listening for calls on session {} as {}",
            session_id,
            session.own_id().short()
        );
        *slot = Some(session);
        Ok(())
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Das Offer geht an alle Teilnehmer der Session; der Antwortende ist
    /// erst mit seiner Answer bekannt.
    pub async fn start_call(
        &self,
        session_id: &str,
        call_type: CallType,
        quality: QualityHint,
    ) -> Result<(), CallEngineError> {
        let shared = &self.shared;
        let mut slot = shared.session.lock().await;

        // Prüfen ob bereits ein Anruf aktiv ist
        if shared.state() != CallState::Idle {
            return Err(CallEngineError::AlreadyInCall);
        }
        if slot.as_ref().is_some_and(|s| s.session_id != session_id) {
            if let Some(listener) = slot.take() {
                listener.release().await;
            }
        }

        let stream = match shared.acquire_media(call_type, quality).await {
            Ok(stream) => stream,
            Err(e) => {
                let error = CallEngineError::from(e);
                shared.fail(&mut slot, &error).await;
                return Err(error);
            }
        };
        shared.set_state(CallState::Connecting);
        shared.emit(CallEvent::LocalStream(stream.clone()));

        let mut session = match slot.take() {
            Some(session) => session,
            None => match shared.open_session(session_id).await {
                Ok(session) => session,
                Err(e) => {
                    stream.stop();
                    let error = CallEngineError::from(e);
                    shared.fail(&mut slot, &error).await;
                    return Err(error);
                }
            },
        };
        session.call_type = call_type;
        session.local_stream = Some(stream);

        let result = shared.setup_outbound(&mut session).await;
        *slot = Some(session);
        match result {
            Ok(()) => {
                shared.set_state(CallState::Ringing);
                Ok(())
            }
            Err(error) => {
                shared.fail(&mut slot, &error).await;
                Err(error)
            }
        }
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn answer_call(
        &self,
        remote: GhostId,
        offer: SessionDescription,
        call_type: CallType,
    ) -> Result<(), CallEngineError> {
        let shared = &self.shared;
        let mut slot = shared.session.lock().await;

        if !matches!(shared.state(), CallState::Idle | CallState::Ringing) {
            return Err(CallEngineError::AlreadyInCall);
        }
        match slot.as_ref() {
            None => return Err(CallEngineError::NoIncomingCall),
            Some(session) if session.transport.is_some() => {
                return Err(CallEngineError::AlreadyInCall)
            }
            Some(session) if session.remote.as_ref().is_some_and(|r| r != &remote) => {
                return Err(CallEngineError::NoIncomingCall)
            }
            Some(_) => {}
        }

        let stream = match shared.acquire_media(call_type, QualityHint::default()).await {
            Ok(stream) => stream,
            Err(e) => {
                let error = CallEngineError::from(e);
                shared.fail(&mut slot, &error).await;
                return Err(error);
            }
        };
        shared.set_state(CallState::Connecting);
        shared.emit(CallEvent::LocalStream(stream.clone()));

        let result = match slot.as_mut() {
            Some(session) => {
                session.remote = Some(remote);
                session.call_type = call_type;
                session.local_stream = Some(stream);
                shared.setup_inbound(session, offer).await
            }
            None => Err(CallEngineError::NoIncomingCall),
        };
        if let Err(error) = result {
            shared.fail(&mut slot, &error).await;
            return Err(error);
        }
        tracing::info!("Answered call");
        Ok(())
    }

    /// Beendet den aktuellen Anruf; idempotent
    pub async fn end_call(&self) -> Result<(), CallEngineError> {
        let mut slot = self.shared.session.lock().await;
        self.shared
            .teardown(&mut slot, CallState::Ended, Some(HangupPayload::default()), None)
            .await;
        Ok(())
    }

    /// Lehnt einen eingehenden Anruf ab
    pub async fn reject_call(&self) -> Result<(), CallEngineError> {
        let mut slot = self.shared.session.lock().await;
        let hangup = HangupPayload {
            reason: Some(REJECT_REASON.to_string()),
        };
        self.shared
            .teardown(
                &mut slot,
                CallState::Ended,
                Some(hangup),
                Some(REJECT_REASON.to_string()),
            )
            .await;
        Ok(())
    }

    /// Schaltet das Mikrofon stumm bzw. wieder an; gibt den neuen Mute-Status zurück
    pub async fn toggle_audio_mute(&self) -> Result<bool, CallEngineError> {
        let slot = self.shared.session.lock().await;
        let stream = slot
            .as_ref()
            .and_then(|s| s.local_stream.as_ref())
            .ok_or(CallEngineError::NoActiveCall)?;

        let mut media = self.shared.media_state.lock();
        media.audio_muted = !media.audio_muted;
        for track in stream.audio_tracks() {
            track.set_enabled(!media.audio_muted);
        }
        Ok(media.audio_muted)
    }

    /// Schaltet die Kamera an/aus; gibt zurück, ob Video gesendet wird
    pub async fn toggle_video(&self) -> Result<bool, CallEngineError> {
        let slot = self.shared.session.lock().await;
        let stream = slot
            .as_ref()
            .and_then(|s| s.local_stream.as_ref())
            .ok_or(CallEngineError::NoActiveCall)?;

        let mut media = self.shared.media_state.lock();
        if stream.video_tracks().next().is_none() {
            return Ok(false);
        }
        media.video_enabled = !media.video_enabled;
        for track in stream.video_tracks() {
            track.set_enabled(media.video_enabled);
        }
        Ok(media.video_enabled)
    }

    /// Ersetzt das ausgehende Video durch eine Bildschirmaufnahme
    pub async fn start_screen_share(&self) -> Result<(), CallEngineError> {
        let mut slot = self.shared.session.lock().await;
        let session = slot.as_mut().ok_or(CallEngineError::NoActiveCall)?;
        let transport = session
            .transport
            .clone()
            .ok_or(CallEngineError::NoActiveCall)?;
        if session.screen_stream.is_some() {
            return Ok(());
        }

        let screen = self.shared.deps.media.get_display_media().await?;
        let Some(track) = screen.video_tracks().next().cloned() else {
            screen.stop();
            return Err(MediaError::NoDevice("screen").into());
        };

        // Ohne Video-Sender wird der Track neu hinzugefügt
        let swapped = async {
            if !transport.replace_track(TrackKind::Video, Some(&track)).await? {
                transport.add_track(&track).await?;
            }
            Ok::<_, TransportError>(())
        }
        .await;
        if let Err(e) = swapped {
            screen.stop();
            return Err(e.into());
        }

        let events = session.events.clone();
        let watched = track.clone();
        session.screen_watch = Some(tokio::spawn(async move {
            watched.ended().await;
            let _ = events.send(SessionEvent::ScreenTrackEnded(watched.id().to_string()));
        }));
        session.screen_stream = Some(screen);
        self.shared.media_state.lock().screen_sharing = true;
        tracing::info!("Screen share started");
        Ok(())
    }

    /// Stellt die Kamera wieder her
    pub async fn stop_screen_share(&self) -> Result<(), CallEngineError> {
        let mut slot = self.shared.session.lock().await;
        if let Some(session) = slot.as_mut() {
            self.shared.restore_camera(session).await;
        }
        Ok(())
    }
}

impl Default for CallEngine {
    fn default() -> Self {
        Self::new(CallConfig::from_env())
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("media", &self.media_state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
