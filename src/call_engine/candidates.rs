//! Candidate Manager
//!
//! Hängt sich an genau einen Transport. Remote Candidates, die vor der
//! Remote Description eintreffen, werden in Ankunftsreihenfolge gepuffert
//! und beim Setzen der Description einmalig abgearbeitet. Lokale Candidates
//! werden protokolliert und an die Engine weitergereicht.

use super::transport::{Transport, TransportEvent};
use crate::sdp::IceCandidate;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

#[derive(Default)]
pub struct CandidateManager {
    transport: Option<Arc<dyn Transport>>,
    remote_description_set: bool,
    pending: VecDeque<IceCandidate>,
    applied: HashSet<IceCandidate>,
    local: Arc<Mutex<Vec<IceCandidate>>>,
    remote: Vec<IceCandidate>,
}

impl CandidateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindet den Manager an einen Transport und setzt allen Zustand zurück
    ///
    /// Jedes Transport-Ereignis geht nach der Protokollierung an `forward`.
    pub fn attach(
        &mut self,
        transport: Arc<dyn Transport>,
        forward: impl Fn(TransportEvent) + Send + Sync + 'static,
    ) {
        self.detach();
        self.remote_description_set = false;
        self.pending.clear();
        self.applied.clear();
        self.remote.clear();
        self.local = Arc::new(Mutex::new(Vec::new()));

        let local = Arc::clone(&self.local);
        transport.set_event_handler(Some(Arc::new(move |event: TransportEvent| {
            match &event {
                TransportEvent::LocalCandidate(candidate) => {
                    tracing::trace!("Local candidate: {}", candidate.candidate);
                    local.lock().push(candidate.clone());
                }
                TransportEvent::GatheringComplete => {
                    tracing::debug!("ICE gathering complete ({} candidates)", local.lock().len());
                }
                TransportEvent::IceConnectionState(state) => {
                    tracing::info!("ICE connection state: {:?}", state);
                }
                TransportEvent::ConnectionState(state) => {
                    tracing::info!("Peer connection state: {:?}", state);
                }
                TransportEvent::RemoteTrack(track) => {
                    tracing::info!("Received {} track {}", track.kind.as_str(), track.id);
                }
            }
            forward(event);
        })));
        self.transport = Some(transport);
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Anzahl gepufferter Remote Candidates
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Markiert die Remote Description als gesetzt und leert den Puffer
    ///
    /// Wirkt nur beim ersten Aufruf nach `attach`.
    pub async fn on_remote_description_set(&mut self) {
        if self.remote_description_set {
            return;
        }
        self.remote_description_set = true;

        if !self.pending.is_empty() {
            tracing::debug!("Applying {} queued remote candidates", self.pending.len());
        }
        while let Some(candidate) = self.pending.pop_front() {
            self.apply(candidate).await;
        }
    }

    /// Wendet einen Remote Candidate an oder puffert ihn
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            self.pending.push_back(candidate);
            return;
        }
        self.apply(candidate).await;
    }

    async fn apply(&mut self, candidate: IceCandidate) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        if self.applied.contains(&candidate) {
            tracing::trace!("Skipping duplicate remote candidate");
            return;
        }

        match transport.add_ice_candidate(candidate.clone()).await {
            Ok(()) => {
                self.applied.insert(candidate.clone());
                self.remote.push(candidate);
            }
            // Einzelne ungültige Candidates sind kein Abbruchgrund
            Err(e) => tracing::warn!("Failed to add remote candidate: {}", e),
        }
    }

    /// Beginnt eine neue ICE-Generation
    ///
    /// Nach einem Restart dürfen bereits angewendete Candidates erneut
    /// angewendet werden. Die Diagnose-Listen bleiben erhalten.
    pub fn on_ice_restart(&mut self) {
        self.applied.clear();
    }

    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote.clone()
    }

    /// Löst die Bindung an den Transport; idempotent
    pub fn detach(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.set_event_handler(None);
        }
    }
}

impl std::fmt::Debug for CandidateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateManager")
            .field("attached", &self.is_attached())
            .field("remote_description_set", &self.remote_description_set)
            .field("pending", &self.pending.len())
            .field("local", &self.local.lock().len())
            .field("remote", &self.remote.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::fakes::FakeTransport;

    fn attached(transport: &Arc<FakeTransport>) -> (CandidateManager, Arc<Mutex<Vec<TransportEvent>>>) {
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&forwarded);
        let mut manager = CandidateManager::new();
        manager.attach(transport.clone(), move |e| sink.lock().push(e));
        (manager, forwarded)
    }

    #[tokio::test]
    async fn test_early_candidates_apply_in_arrival_order() {
        let transport = Arc::new(FakeTransport::default());
        let (mut manager, _) = attached(&transport);

        for c in ["c1", "c2", "c3"] {
            manager.add_remote_candidate(IceCandidate::new(c)).await;
        }
        assert_eq!(manager.pending_count(), 3);
        assert!(transport.applied_candidates().is_empty());

        transport.set_remote_ready();
        manager.on_remote_description_set().await;

        assert_eq!(transport.applied_candidates(), vec!["c1", "c2", "c3"]);
        assert_eq!(manager.pending_count(), 0);

        manager.add_remote_candidate(IceCandidate::new("c4")).await;
        assert_eq!(transport.applied_candidates(), vec!["c1", "c2", "c3", "c4"]);
        assert_eq!(manager.remote_candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_remote_description_signal_is_one_shot() {
        let transport = Arc::new(FakeTransport::default());
        let (mut manager, _) = attached(&transport);
        transport.set_remote_ready();

        manager.add_remote_candidate(IceCandidate::new("c1")).await;
        manager.on_remote_description_set().await;
        manager.on_remote_description_set().await;

        assert_eq!(transport.applied_candidates(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_failed_and_duplicate_candidates_are_skipped() {
        let transport = Arc::new(FakeTransport::default());
        let (mut manager, _) = attached(&transport);
        transport.set_remote_ready();
        transport.reject_candidate("bad");
        manager.on_remote_description_set().await;

        manager.add_remote_candidate(IceCandidate::new("bad")).await;
        manager.add_remote_candidate(IceCandidate::new("good")).await;
        manager.add_remote_candidate(IceCandidate::new("good")).await;

        assert_eq!(transport.applied_candidates(), vec!["good"]);
        assert_eq!(manager.remote_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_ice_restart_allows_reapplying_candidates() {
        let transport = Arc::new(FakeTransport::default());
        let (mut manager, _) = attached(&transport);
        transport.set_remote_ready();
        manager.on_remote_description_set().await;

        manager.add_remote_candidate(IceCandidate::new("host-1")).await;
        manager.add_remote_candidate(IceCandidate::new("host-1")).await;
        assert_eq!(transport.applied_candidates(), vec!["host-1"]);

        manager.on_ice_restart();
        manager.add_remote_candidate(IceCandidate::new("host-1")).await;

        assert_eq!(transport.applied_candidates(), vec!["host-1", "host-1"]);
        assert!(manager.remote_description_set());
        assert_eq!(manager.remote_candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_local_candidates_recorded_and_forwarded() {
        let transport = Arc::new(FakeTransport::default());
        let (manager, forwarded) = attached(&transport);

        transport.emit(TransportEvent::LocalCandidate(IceCandidate::new("l1")));
        transport.emit(TransportEvent::GatheringComplete);

        assert_eq!(manager.local_candidates(), vec![IceCandidate::new("l1")]);
        assert_eq!(forwarded.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent_and_silences_events() {
        let transport = Arc::new(FakeTransport::default());
        let (mut manager, forwarded) = attached(&transport);

        manager.detach();
        manager.detach();
        transport.emit(TransportEvent::GatheringComplete);

        assert!(!manager.is_attached());
        assert!(forwarded.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reattach_resets_sequences() {
        let first = Arc::new(FakeTransport::default());
        let (mut manager, _) = attached(&first);
        first.emit(TransportEvent::LocalCandidate(IceCandidate::new("old")));
        manager.add_remote_candidate(IceCandidate::new("queued")).await;

        let second = Arc::new(FakeTransport::default());
        manager.attach(second.clone(), |_| {});

        assert!(manager.local_candidates().is_empty());
        assert_eq!(manager.pending_count(), 0);
        assert!(!manager.remote_description_set());
    }
}
