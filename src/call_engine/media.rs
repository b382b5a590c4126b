//! Medien-Abstraktion
//!
//! Die Call Engine erzeugt keine Medien selbst, sondern fordert Streams
//! über [`MediaDevices`] an und startet, stoppt oder tauscht deren Tracks.
//! [`SyntheticMedia`] liefert webrtc-rs Sample-Tracks ohne Hardware.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// RTP Clock Rate für Video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Permission to capture {0} was denied")]
    PermissionDenied(&'static str),

    #[error("No {0} device found")]
    NoDevice(&'static str),

    #[error("Capture failed: {0}")]
    Capture(String),
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Gewünschte Videoqualität für ausgehende Anrufe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityHint {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityHint {
    /// (Breite, Höhe, FPS)
    pub fn resolution(&self) -> (u32, u32, u32) {
        match self {
            QualityHint::Low => (320, 240, 15),
            QualityHint::Medium => (640, 480, 30),
            QualityHint::High => (1280, 720, 30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub quality: QualityHint,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    local: Arc<dyn TrackLocal + Send + Sync>,
}

/// Lokaler Track; Klone teilen Enabled- und Ended-Status
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(
        kind: TrackKind,
        label: impl Into<String>,
        local: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: local.id().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
                local,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Beendet den Track endgültig
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Wartet, bis der Track beendet wurde (lokal oder durch die Quelle)
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Der webrtc-rs Track für den Transport
    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.inner.local)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Ein Bündel lokaler Tracks (Kamera+Mikrofon oder Bildschirm)
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Quelle für lokale Kamera/Mikrofon- und Bildschirm-Streams
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError>;

    async fn get_display_media(&self) -> Result<MediaStream, MediaError>;
}

/// Erzeugt einen Sample-Track mit Opus (Audio) oder VP8 (Video)
pub fn synthetic_track(kind: TrackKind, stream_id: &str) -> MediaTrack {
    let capability = match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: VIDEO_CLOCK_RATE,
            ..Default::default()
        },
    };
    let track_id = format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4().simple());
    let local = Arc::new(TrackLocalStaticSample::new(
        capability,
        track_id,
        stream_id.to_string(),
    ));
    MediaTrack::new(kind, format!("synthetic {}", kind.as_str()), local)
}

/// Medienquelle ohne Hardware, z.B. für Headless-Peers
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticMedia;

#[async_trait]
impl MediaDevices for SyntheticMedia {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(synthetic_track(TrackKind::Audio, &id));
        }
        if constraints.video {
            tracks.push(synthetic_track(TrackKind::Video, &id));
        }
        Ok(MediaStream { id, tracks })
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaError> {
        let id = uuid::Uuid::new_v4().to_string();
        Ok(MediaStream {
            tracks: vec![synthetic_track(TrackKind::Video, &id)],
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_media_honours_constraints() {
        let stream = SyntheticMedia
            .get_user_media(&MediaConstraints {
                audio: true,
                video: false,
                quality: QualityHint::Low,
            })
            .await
            .unwrap();
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 0);
    }

    #[tokio::test]
    async fn test_stop_wakes_ended_waiters() {
        let track = synthetic_track(TrackKind::Video, "s");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        assert!(!track.is_ended());
        track.stop();
        waiter.await.unwrap();
        assert!(track.is_ended());
    }

    #[test]
    fn test_enabled_is_shared_between_clones() {
        let track = synthetic_track(TrackKind::Audio, "s");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.id().starts_with("audio-"));
    }
}
