//! Call Session
//!
//! Alles, was zu genau einem Anrufversuch gehört: Signaling Channel,
//! Transport mit Candidate Manager, Medien, Timer und Zähler. Eine Session
//! wird als Ganzes freigegeben; nichts davon überlebt sie.

use super::candidates::CandidateManager;
use super::media::MediaStream;
use super::quality::QualityMonitor;
use super::transport::{IceConnectionState, Transport, TransportEvent, TransportStats};
use crate::crypto::GhostId;
use crate::sdp::IceCandidate;
use crate::signaling::{
    AnswerPayload, CallType, HangupPayload, OfferPayload, SignalHandlers, SignalingChannel,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Obergrenze für Candidates, die vor dem Transport eintreffen
const MAX_EARLY_CANDIDATES: usize = 64;

/// Alles, was den Zustandsautomaten einer Session antreibt
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Transport(TransportEvent),
    Offer(GhostId, OfferPayload),
    Answer(GhostId, AnswerPayload),
    RemoteCandidate(GhostId, IceCandidate),
    Hangup(GhostId, HangupPayload),
    Stats(TransportStats),
    ScreenTrackEnded(String),
}

/// Leitet eingehende Signale in die Queue der Session
pub(crate) fn signal_handlers(events: &mpsc::UnboundedSender<SessionEvent>) -> SignalHandlers {
    let offers = events.clone();
    let answers = events.clone();
    let candidates = events.clone();
    let hangups = events.clone();

    SignalHandlers::default()
        .on_offer(move |from, offer| {
            let _ = offers.send(SessionEvent::Offer(from, offer));
        })
        .on_answer(move |from, answer| {
            let _ = answers.send(SessionEvent::Answer(from, answer));
        })
        .on_ice_candidate(move |from, candidate| {
            let _ = candidates.send(SessionEvent::RemoteCandidate(from, candidate));
        })
        .on_hangup(move |from, hangup| {
            let _ = hangups.send(SessionEvent::Hangup(from, hangup));
        })
}

pub(crate) struct Session {
    /// Generation; die Session-Loop endet, sobald eine andere aktiv ist
    pub id: u64,
    pub session_id: String,
    pub call_type: CallType,
    pub channel: Arc<SignalingChannel>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    /// Wird mit der Session verworfen und beendet damit die Loop
    _shutdown: oneshot::Sender<()>,

    pub remote: Option<GhostId>,
    pub early_candidates: Vec<(GhostId, IceCandidate)>,
    pub transport: Option<Arc<dyn Transport>>,
    pub candidates: CandidateManager,
    pub last_ice_state: Option<IceConnectionState>,

    pub local_stream: Option<MediaStream>,
    pub screen_stream: Option<MediaStream>,
    pub screen_watch: Option<JoinHandle<()>>,

    monitor: Option<JoinHandle<()>>,
    pub quality: QualityMonitor,
    pub reconnect_attempts: u32,

    /// Höchste bekannte Restart-Epoche (beide Richtungen)
    pub epoch: u32,
    /// Epoche des eigenen, noch unbeantworteten Offers
    pub pending_offer: Option<u32>,
    /// Höchste Epoche eines beantworteten Remote-Offers
    pub answered_epoch: Option<u32>,
}

impl Session {
    pub fn new(
        id: u64,
        session_id: &str,
        channel: Arc<SignalingChannel>,
        events: mpsc::UnboundedSender<SessionEvent>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            session_id: session_id.to_string(),
            call_type: CallType::default(),
            channel,
            events,
            _shutdown: shutdown,
            remote: None,
            early_candidates: Vec::new(),
            transport: None,
            candidates: CandidateManager::new(),
            last_ice_state: None,
            local_stream: None,
            screen_stream: None,
            screen_watch: None,
            monitor: None,
            quality: QualityMonitor::new(),
            reconnect_attempts: 0,
            epoch: 0,
            pending_offer: None,
            answered_epoch: None,
        }
    }

    pub fn own_id(&self) -> &GhostId {
        self.channel.ghost_id()
    }

    /// Nur die kleinere Ghost ID initiiert ICE-Restarts
    pub fn owns_restart(&self) -> bool {
        self.remote.as_ref().is_some_and(|remote| self.own_id() < remote)
    }

    /// Bindet einen frischen Transport samt Candidate Manager
    pub fn attach_transport(&mut self, transport: Arc<dyn Transport>) {
        let events = self.events.clone();
        self.candidates.attach(Arc::clone(&transport), move |event| {
            let _ = events.send(SessionEvent::Transport(event));
        });
        self.transport = Some(transport);
    }

    /// Merkt sich einen Candidate, der vor dem Transport ankommt
    pub fn hold_early_candidate(&mut self, from: GhostId, candidate: IceCandidate) {
        if self.early_candidates.len() >= MAX_EARLY_CANDIDATES {
            tracing::debug!("Dropping early candidate from {}: buffer full", from.short());
            return;
        }
        self.early_candidates.push((from, candidate));
    }

    /// Gepufferte Candidates des Remote-Peers in Ankunftsreihenfolge
    pub fn take_early_candidates(&mut self) -> Vec<IceCandidate> {
        let early = std::mem::take(&mut self.early_candidates);
        match &self.remote {
            Some(remote) => early
                .into_iter()
                .filter(|(from, _)| from == remote)
                .map(|(_, c)| c)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Startet den periodischen Statistik-Sampler
    pub fn start_monitor(&mut self, period: Duration) {
        if self.monitor.is_some() {
            return;
        }
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let events = self.events.clone();

        self.monitor = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match transport.stats().await {
                    Ok(stats) => {
                        if events.send(SessionEvent::Stats(stats)).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!("Stats sampling failed: {}", e),
                }
            }
        }));
    }

    pub fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_some()
    }

    /// Gibt alle Ressourcen in fester Reihenfolge frei
    ///
    /// Jeder Schritt toleriert bereits freigegebene Vorgänger.
    pub async fn release(mut self) {
        self.stop_monitor();
        if let Some(watch) = self.screen_watch.take() {
            watch.abort();
        }
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
        if let Some(stream) = self.screen_stream.take() {
            stream.stop();
        }
        self.candidates.detach();
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!("Closing transport failed: {}", e);
            }
        }
        self.channel.disconnect().await;
        tracing::debug!("Session {} released", self.session_id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("remote", &self.remote)
            .field("has_transport", &self.transport.is_some())
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("epoch", &self.epoch)
            .finish()
    }
}
