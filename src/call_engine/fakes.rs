//! Deterministische Test-Doubles für Transport und Medien

use super::media::{MediaConstraints, MediaDevices, MediaError, MediaStream, SyntheticMedia, TrackKind};
use super::transport::{
    Transport, TransportError, TransportEvent, TransportEventHandler, TransportFactory,
    TransportStats,
};
use crate::config::IceServerConfig;
use crate::sdp::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// TRANSPORT
// ============================================================================

/// Protokolliert jeden Aufruf; Ereignisse werden per `emit` ausgelöst
#[derive(Default)]
pub struct FakeTransport {
    handler: RwLock<Option<TransportEventHandler>>,
    ops: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
    rejected: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<&'static str>>,
    remote_ready: AtomicBool,
    has_video_sender: AtomicBool,
    stats: Mutex<TransportStats>,
    offers: AtomicUsize,
}

impl FakeTransport {
    pub fn emit(&self, event: TransportEvent) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops.lock().iter().filter(|o| o.as_str() == op).count()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn set_remote_ready(&self) {
        self.remote_ready.store(true, Ordering::SeqCst);
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.rejected.lock().insert(candidate.to_string());
    }

    /// Lässt die genannte Operation ab sofort fehlschlagen
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }

    fn record(&self, op: impl Into<String>) -> Result<(), TransportError> {
        let op = op.into();
        let failing = self.failing.lock().contains(op.as_str());
        self.ops.lock().push(op.clone());
        if failing {
            return Err(TransportError::WebRTC(format!("{op} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn set_event_handler(&self, handler: Option<TransportEventHandler>) {
        *self.handler.write() = handler;
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        self.record(if ice_restart { "create_offer:restart" } else { "create_offer" })?;
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("v=0 fake-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record("create_answer")?;
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(format!("set_local:{:?}", desc.kind).to_lowercase())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(format!("set_remote:{:?}", desc.kind).to_lowercase())?;
        self.set_remote_ready();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record("add_candidate")?;
        if !self.remote_ready.load(Ordering::SeqCst) {
            return Err(TransportError::WebRTC("remote description not set".into()));
        }
        if self.rejected.lock().contains(&candidate.candidate) {
            return Err(TransportError::WebRTC("invalid candidate".into()));
        }
        self.applied.lock().push(candidate.candidate);
        Ok(())
    }

    async fn add_track(&self, track: &super::media::MediaTrack) -> Result<(), TransportError> {
        self.record(format!("add_track:{}", track.kind().as_str()))?;
        if track.kind() == TrackKind::Video {
            self.has_video_sender.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<&super::media::MediaTrack>,
    ) -> Result<bool, TransportError> {
        if kind == TrackKind::Video && !self.has_video_sender.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let id = track.map(|t| t.id().to_string()).unwrap_or_else(|| "none".into());
        self.record(format!("replace_track:{}:{}", kind.as_str(), id))?;
        Ok(true)
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.record("stats")?;
        Ok(self.stats.lock().clone())
    }

    async fn close(&self) -> Result<(), TransportError> {
        *self.handler.write() = None;
        self.record("close")
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    fail: AtomicBool,
    failing_ops: Mutex<Vec<&'static str>>,
}

impl FakeTransportFactory {
    pub fn created(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Jeder künftig erzeugte Transport lässt `op` fehlschlagen
    pub fn fail_on(&self, op: &'static str) {
        self.failing_ops.lock().push(op);
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::WebRTC("factory failure".into()));
        }
        let transport = Arc::new(FakeTransport::default());
        for op in self.failing_ops.lock().iter() {
            transport.fail(op);
        }
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ============================================================================
// MEDIA
// ============================================================================

/// Synthetische Medien mit Zählern und abschaltbarer Berechtigung
#[derive(Default)]
pub struct FakeMedia {
    acquisitions: AtomicUsize,
    denied: AtomicBool,
    user_streams: Mutex<Vec<MediaStream>>,
    display_streams: Mutex<Vec<MediaStream>>,
}

impl FakeMedia {
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn deny(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub fn user_streams(&self) -> Vec<MediaStream> {
        self.user_streams.lock().clone()
    }

    pub fn display_streams(&self) -> Vec<MediaStream> {
        self.display_streams.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("microphone"));
        }
        let stream = SyntheticMedia.get_user_media(constraints).await?;
        self.user_streams.lock().push(stream.clone());
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("screen"));
        }
        let stream = SyntheticMedia.get_display_media().await?;
        self.display_streams.lock().push(stream.clone());
        Ok(stream)
    }
}
