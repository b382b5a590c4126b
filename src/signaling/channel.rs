//! Signaling Channel
//!
//! Pseudonyme Publish/Subscribe-Schicht über mehrere, nicht
//! vertrauenswürdige Relays. Jede eingehende Nachricht durchläuft den
//! Filter (eigene Nachricht, Session, Adressat, Ablauf, Duplikat), bevor sie
//! an einen Handler geht. Alles, was durchfällt, wird still verworfen.

use super::messages::{
    session_topic, AnswerPayload, HangupPayload, OfferPayload, SignalBody, SignalMessage,
};
use super::relay::{Relay, RelayConnector, RelayError, RelayEvent, SubscriptionId};
use crate::crypto::{GhostId, GhostIdentity, IdentityGenerator};
use crate::sdp::IceCandidate;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Anzahl gemerkter Nachrichten für die Duplikaterkennung
const DEDUP_CAPACITY: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("No relays configured")]
    NoRelays,

    #[error("Subscribing failed on every relay: {0}")]
    SubscribeFailed(String),

    #[error("Signaling channel is not connected")]
    NotConnected,

    #[error("Failed to encode signal message: {0}")]
    Encode(String),

    #[error("Publish failed on all {} relays", .0.failed.len())]
    PublishFailed(PublishReport),
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Ergebnis eines Fan-Outs an alle Relays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Grund, aus dem eine eingehende Nachricht verworfen wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    OwnMessage,
    WrongSession,
    NotAddressed,
    Expired,
    /// Zeitstempel liegt weiter als das Ablauffenster in der Zukunft
    FutureDated,
    Duplicate,
}

pub type OfferHandler = Arc<dyn Fn(GhostId, OfferPayload) + Send + Sync>;
pub type AnswerHandler = Arc<dyn Fn(GhostId, AnswerPayload) + Send + Sync>;
pub type IceHandler = Arc<dyn Fn(GhostId, IceCandidate) + Send + Sync>;
pub type HangupHandler = Arc<dyn Fn(GhostId, HangupPayload) + Send + Sync>;

/// Registrierte Handler pro Nachrichtentyp
#[derive(Clone, Default)]
pub struct SignalHandlers {
    on_offer: Option<OfferHandler>,
    on_answer: Option<AnswerHandler>,
    on_ice_candidate: Option<IceHandler>,
    on_hangup: Option<HangupHandler>,
}

impl SignalHandlers {
    pub fn on_offer(mut self, f: impl Fn(GhostId, OfferPayload) + Send + Sync + 'static) -> Self {
        self.on_offer = Some(Arc::new(f));
        self
    }

    pub fn on_answer(mut self, f: impl Fn(GhostId, AnswerPayload) + Send + Sync + 'static) -> Self {
        self.on_answer = Some(Arc::new(f));
        self
    }

    pub fn on_ice_candidate(
        mut self,
        f: impl Fn(GhostId, IceCandidate) + Send + Sync + 'static,
    ) -> Self {
        self.on_ice_candidate = Some(Arc::new(f));
        self
    }

    pub fn on_hangup(mut self, f: impl Fn(GhostId, HangupPayload) + Send + Sync + 'static) -> Self {
        self.on_hangup = Some(Arc::new(f));
        self
    }
}

// ============================================================================
// INBOUND DISPATCH
// ============================================================================

#[derive(Default)]
struct SeenMessages {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenMessages {
    /// true, wenn die Nachricht neu ist
    fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        if self.order.len() >= DEDUP_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.to_string());
        self.order.push_back(key.to_string());
        true
    }
}

struct Dispatcher {
    own_id: GhostId,
    session_id: String,
    expiry_ms: i64,
    handlers: RwLock<SignalHandlers>,
    seen: Mutex<SeenMessages>,
}

impl Dispatcher {
    /// Session-, Adressaten- und Ablaufprüfung
    fn check(&self, message: &SignalMessage, now_ms: i64) -> Result<(), DropReason> {
        if message.sender_ghost_id == self.own_id {
            return Err(DropReason::OwnMessage);
        }
        if message.session_id != self.session_id {
            return Err(DropReason::WrongSession);
        }
        if !message.target_ghost_id.is_empty() && message.target_ghost_id != self.own_id {
            return Err(DropReason::NotAddressed);
        }
        let age = now_ms.saturating_sub(message.timestamp);
        if age > self.expiry_ms {
            return Err(DropReason::Expired);
        }
        if age < self.expiry_ms.saturating_neg() {
            return Err(DropReason::FutureDated);
        }
        Ok(())
    }

    fn handle(&self, event: RelayEvent) {
        let message = match SignalMessage::decode(&event.content) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Dropping undecodable event from {}: {}", event.relay, e);
                return;
            }
        };

        if let Err(reason) = self.check(&message, Utc::now().timestamp_millis()) {
            tracing::trace!("Dropping {} from {}: {:?}", message.body.kind(), event.relay, reason);
            return;
        }
        if !self.seen.lock().insert(message.dedup_key()) {
            tracing::trace!("Dropping duplicate {} from {}", message.body.kind(), event.relay);
            return;
        }

        tracing::debug!(
            "Signal {} from {} via {}",
            message.body.kind(),
            message.sender_ghost_id.short(),
            event.relay
        );

        let handlers = self.handlers.read().clone();
        let sender = message.sender_ghost_id;
        match message.body {
            SignalBody::Offer(offer) => {
                if let Some(h) = handlers.on_offer {
                    h(sender, offer);
                }
            }
            SignalBody::Answer(answer) => {
                if let Some(h) = handlers.on_answer {
                    h(sender, answer);
                }
            }
            SignalBody::Ice(candidate) => {
                if let Some(h) = handlers.on_ice_candidate {
                    h(sender, candidate);
                }
            }
            SignalBody::Hangup(hangup) => {
                if let Some(h) = handlers.on_hangup {
                    h(sender, hangup);
                }
            }
            SignalBody::Ping => {}
        }
    }
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// Optionen für einen Signaling Channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub expiry: Duration,
    pub publish_concurrency: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(30),
            publish_concurrency: 8,
        }
    }
}

pub struct SignalingChannel {
    session_id: String,
    topic: String,
    identity: GhostIdentity,
    connector: Arc<dyn RelayConnector>,
    publish_concurrency: usize,
    state: RwLock<ChannelState>,
    relays: RwLock<Vec<(Arc<dyn Relay>, SubscriptionId)>>,
    dispatcher: Arc<Dispatcher>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Erstellt einen Channel mit frischer Ghost-Identität
    pub fn new(
        session_id: impl Into<String>,
        connector: Arc<dyn RelayConnector>,
        identities: &dyn IdentityGenerator,
        options: ChannelOptions,
    ) -> Self {
        let session_id = session_id.into();
        let identity = identities.generate();
        let dispatcher = Arc::new(Dispatcher {
            own_id: identity.id().clone(),
            session_id: session_id.clone(),
            expiry_ms: i64::try_from(options.expiry.as_millis()).unwrap_or(i64::MAX),
            handlers: RwLock::new(SignalHandlers::default()),
            seen: Mutex::new(SeenMessages::default()),
        });

        Self {
            topic: session_topic(&session_id),
            session_id,
            identity,
            connector,
            publish_concurrency: options.publish_concurrency.max(1),
            state: RwLock::new(ChannelState::Disconnected),
            relays: RwLock::new(Vec::new()),
            dispatcher,
            pump: Mutex::new(None),
        }
    }

    pub fn ghost_id(&self) -> &GhostId {
        self.identity.id()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    /// Anzahl der Relays mit aktivem Abonnement
    pub fn relay_count(&self) -> usize {
        self.relays.read().len()
    }

    pub fn set_handlers(&self, handlers: SignalHandlers) {
        *self.dispatcher.handlers.write() = handlers;
    }

    /// Abonniert das Session-Topic auf allen Relays parallel
    ///
    /// No-op, wenn bereits verbunden oder im Verbindungsaufbau. Schlägt nur
    /// fehl, wenn kein einziges Relay das Abonnement annimmt.
    pub async fn connect(&self, relay_urls: &[String]) -> Result<(), SignalingError> {
        {
            let mut state = self.state.write();
            if matches!(*state, ChannelState::Connecting | ChannelState::Connected) {
                return Ok(());
            }
            *state = ChannelState::Connecting;
        }

        if relay_urls.is_empty() {
            *self.state.write() = ChannelState::Error;
            return Err(SignalingError::NoRelays);
        }

        let (tx, rx) = mpsc::unbounded_channel::<RelayEvent>();
        let attempts = relay_urls.iter().map(|url| {
            let tx = tx.clone();
            async move {
                let relay = self.connector.connect(url).await?;
                let id = relay.subscribe(&self.topic, tx).await?;
                Ok::<_, RelayError>((relay, id))
            }
        });
        let results = futures::future::join_all(attempts).await;
        drop(tx);

        let mut subscribed = Vec::new();
        let mut errors = Vec::new();
        for (url, result) in relay_urls.iter().zip(results) {
            match result {
                Ok(entry) => subscribed.push(entry),
                Err(e) => {
                    tracing::warn!("Relay {} unavailable: {}", url, e);
                    errors.push(format!("{url}: {e}"));
                }
            }
        }

        if subscribed.is_empty() {
            *self.state.write() = ChannelState::Error;
            return Err(SignalingError::SubscribeFailed(errors.join("; ")));
        }

        tracing::info!(
            "Signaling for session {} as {} on {}/{} relays",
            self.session_id,
            self.ghost_id().short(),
            subscribed.len(),
            relay_urls.len()
        );

        *self.relays.write() = subscribed;
        *self.pump.lock() = Some(Self::spawn_pump(Arc::clone(&self.dispatcher), rx));
        *self.state.write() = ChannelState::Connected;
        Ok(())
    }

    fn spawn_pump(
        dispatcher: Arc<Dispatcher>,
        mut rx: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatcher.handle(event);
            }
        })
    }

    pub async fn send_offer(
        &self,
        offer: OfferPayload,
        target: Option<&GhostId>,
    ) -> Result<PublishReport, SignalingError> {
        self.publish(SignalBody::Offer(offer), target).await
    }

    pub async fn send_answer(
        &self,
        answer: AnswerPayload,
        target: Option<&GhostId>,
    ) -> Result<PublishReport, SignalingError> {
        self.publish(SignalBody::Answer(answer), target).await
    }

    pub async fn send_ice_candidate(
        &self,
        candidate: IceCandidate,
        target: Option<&GhostId>,
    ) -> Result<PublishReport, SignalingError> {
        self.publish(SignalBody::Ice(candidate), target).await
    }

    pub async fn send_hangup(
        &self,
        hangup: HangupPayload,
        target: Option<&GhostId>,
    ) -> Result<PublishReport, SignalingError> {
        self.publish(SignalBody::Hangup(hangup), target).await
    }

    /// Signiert eine Nachricht und veröffentlicht sie auf jedem Relay
    async fn publish(
        &self,
        body: SignalBody,
        target: Option<&GhostId>,
    ) -> Result<PublishReport, SignalingError> {
        if self.state() != ChannelState::Connected {
            return Err(SignalingError::NotConnected);
        }

        let kind = body.kind();
        let message = SignalMessage::signed(
            &self.identity,
            &self.session_id,
            target,
            body,
            Utc::now().timestamp_millis(),
        )
        .map_err(|e| SignalingError::Encode(e.to_string()))?;
        let content = message
            .encode()
            .map_err(|e| SignalingError::Encode(e.to_string()))?;

        let relays: Vec<Arc<dyn Relay>> =
            self.relays.read().iter().map(|(r, _)| Arc::clone(r)).collect();
        let content: Arc<str> = content.into();
        let topic: Arc<str> = self.topic.as_str().into();
        let attempts: Vec<BoxFuture<'static, (String, Result<(), RelayError>)>> = relays
            .into_iter()
            .map(|relay| {
                let topic = Arc::clone(&topic);
                let content = Arc::clone(&content);
                async move {
                    let result = relay.publish(&topic, &content).await;
                    (relay.url().to_string(), result)
                }
                .boxed()
            })
            .collect();
        let outcomes: Vec<(String, Result<(), RelayError>)> = futures::stream::iter(attempts)
            .buffer_unordered(self.publish_concurrency)
            .collect()
            .await;

        let mut report = PublishReport::default();
        for (url, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered.push(url),
                Err(e) => {
                    tracing::warn!("Publishing {} to {} failed: {}", kind, url, e);
                    report.failed.push((url, e.to_string()));
                }
            }
        }

        if report.delivered.is_empty() {
            return Err(SignalingError::PublishFailed(report));
        }
        Ok(report)
    }

    /// Beendet alle Abonnements; idempotent
    pub async fn disconnect(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let relays = std::mem::take(&mut *self.relays.write());
        for (relay, id) in relays {
            if let Err(e) = relay.unsubscribe(&id).await {
                tracing::debug!("Unsubscribe from {} failed: {}", relay.url(), e);
            }
        }
        *self.state.write() = ChannelState::Disconnected;
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("session_id", &self.session_id)
            .field("ghost_id", self.ghost_id())
            .field("state", &self.state())
            .field("relays", &self.relay_count())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OsIdentityGenerator;
    use crate::sdp::SessionDescription;
    use crate::signaling::messages::CallType;
    use crate::signaling::MemoryBus;

    const RELAY_A: &str = "mem://a";
    const RELAY_B: &str = "mem://b";

    fn relays() -> Vec<String> {
        vec![RELAY_A.to_string(), RELAY_B.to_string()]
    }

    fn channel(bus: &MemoryBus, session: &str) -> SignalingChannel {
        SignalingChannel::new(
            session,
            bus.connector(),
            &OsIdentityGenerator,
            ChannelOptions::default(),
        )
    }

    fn offer() -> OfferPayload {
        OfferPayload {
            description: SessionDescription::offer("v=0"),
            call_type: CallType::Audio,
            restart_epoch: 0,
        }
    }

    fn dispatcher(own: &GhostId) -> Dispatcher {
        Dispatcher {
            own_id: own.clone(),
            session_id: "pact-1".into(),
            expiry_ms: 30_000,
            handlers: RwLock::new(SignalHandlers::default()),
            seen: Mutex::new(SeenMessages::default()),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_filter_clauses() {
        let me = GhostIdentity::generate();
        let peer = GhostIdentity::generate();
        let d = dispatcher(me.id());
        let now = 1_000_000;

        let msg = |from: &GhostIdentity, session: &str, target: Option<&GhostId>, ts: i64| {
            SignalMessage::signed(from, session, target, SignalBody::Ping, ts).unwrap()
        };

        assert_eq!(d.check(&msg(&peer, "pact-1", None, now), now), Ok(()));
        assert_eq!(d.check(&msg(&peer, "pact-1", Some(me.id()), now), now), Ok(()));
        assert_eq!(
            d.check(&msg(&me, "pact-1", None, now), now),
            Err(DropReason::OwnMessage)
        );
        assert_eq!(
            d.check(&msg(&peer, "pact-2", None, now), now),
            Err(DropReason::WrongSession)
        );
        assert_eq!(
            d.check(&msg(&peer, "pact-1", Some(peer.id()), now), now),
            Err(DropReason::NotAddressed)
        );
        assert_eq!(
            d.check(&msg(&peer, "pact-1", None, now - 30_001), now),
            Err(DropReason::Expired)
        );
        assert_eq!(d.check(&msg(&peer, "pact-1", None, now - 30_000), now), Ok(()));
    }

    #[test]
    fn test_extreme_timestamps_are_dropped() {
        let me = GhostIdentity::generate();
        let peer = GhostIdentity::generate();
        let d = dispatcher(me.id());
        let now = 1_000_000;

        let msg =
            |ts: i64| SignalMessage::signed(&peer, "pact-1", None, SignalBody::Ping, ts).unwrap();

        assert_eq!(d.check(&msg(i64::MIN), now), Err(DropReason::Expired));
        assert_eq!(d.check(&msg(i64::MAX), now), Err(DropReason::FutureDated));
        assert_eq!(d.check(&msg(now + 30_001), now), Err(DropReason::FutureDated));
        assert_eq!(d.check(&msg(now + 30_000), now), Ok(()));
        assert_eq!(d.check(&msg(i64::MIN), i64::MAX), Err(DropReason::Expired));
    }

    #[test]
    fn test_seen_messages_evicts_oldest() {
        let mut seen = SeenMessages::default();
        assert!(seen.insert("first"));
        assert!(!seen.insert("first"));
        for i in 0..DEDUP_CAPACITY {
            assert!(seen.insert(&format!("k{i}")));
        }
        assert!(seen.insert("first"));
    }

    #[tokio::test]
    async fn test_offer_dispatched_once_across_relays() {
        let bus = MemoryBus::new();
        let caller = channel(&bus, "pact-1");
        let callee = channel(&bus, "pact-1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        callee.set_handlers(SignalHandlers::default().on_offer(move |from, offer| {
            let _ = tx.send((from, offer));
        }));
        let (own_tx, mut own_rx) = mpsc::unbounded_channel();
        caller.set_handlers(SignalHandlers::default().on_offer(move |from, _| {
            let _ = own_tx.send(from);
        }));

        caller.connect(&relays()).await.unwrap();
        callee.connect(&relays()).await.unwrap();

        let report = caller.send_offer(offer(), None).await.unwrap();
        assert_eq!(report.delivered.len(), 2);
        settle().await;

        let (from, received) = rx.try_recv().unwrap();
        assert_eq!(&from, caller.ghost_id());
        assert_eq!(received, offer());
        assert!(rx.try_recv().is_err(), "duplicate from second relay");
        assert!(own_rx.try_recv().is_err(), "own message must be filtered");
    }

    #[tokio::test]
    async fn test_targeted_message_reaches_only_addressee() {
        let bus = MemoryBus::new();
        let a = channel(&bus, "pact-1");
        let b = channel(&bus, "pact-1");
        let c = channel(&bus, "pact-1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        for (name, ch) in [("b", &b), ("c", &c)] {
            let tx = tx.clone();
            ch.set_handlers(SignalHandlers::default().on_hangup(move |_, _| {
                let _ = tx.send(name);
            }));
        }
        for ch in [&a, &b, &c] {
            ch.connect(&relays()).await.unwrap();
        }

        a.send_hangup(HangupPayload::default(), Some(b.ghost_id()))
            .await
            .unwrap();
        settle().await;

        assert_eq!(rx.try_recv().unwrap(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_and_stale_events_are_dropped() {
        let bus = MemoryBus::new();
        let a = GhostIdentity::generate();
        let b = channel(&bus, "pact-1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_handlers(SignalHandlers::default().on_ice_candidate(move |_, c| {
            let _ = tx.send(c);
        }));
        b.connect(&relays()).await.unwrap();

        let topic = session_topic("pact-1");
        bus.inject(RELAY_A, &topic, "{not json");
        bus.inject(RELAY_A, &topic, r#"{"type":"ice","payload":42}"#);

        let stale = SignalMessage::signed(
            &a,
            "pact-1",
            None,
            SignalBody::Ice(IceCandidate::new("stale")),
            Utc::now().timestamp_millis() - 60_000,
        )
        .unwrap();
        bus.inject(RELAY_A, &topic, &stale.encode().unwrap());

        let wrong_session = SignalMessage::signed(
            &a,
            "pact-9",
            None,
            SignalBody::Ice(IceCandidate::new("other")),
            Utc::now().timestamp_millis(),
        )
        .unwrap();
        bus.inject(RELAY_A, &topic, &wrong_session.encode().unwrap());

        let fresh = SignalMessage::signed(
            &a,
            "pact-1",
            None,
            SignalBody::Ice(IceCandidate::new("fresh")),
            Utc::now().timestamp_millis(),
        )
        .unwrap();
        bus.inject(RELAY_B, &topic, &fresh.encode().unwrap());
        settle().await;

        assert_eq!(rx.try_recv().unwrap().candidate, "fresh");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pump_survives_out_of_range_timestamps() {
        let bus = MemoryBus::new();
        let a = GhostIdentity::generate();
        let b = channel(&bus, "pact-1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_handlers(SignalHandlers::default().on_ice_candidate(move |_, c| {
            let _ = tx.send(c);
        }));
        b.connect(&relays()).await.unwrap();

        let topic = session_topic("pact-1");
        for (name, ts) in [("ancient", i64::MIN), ("future", i64::MAX)] {
            let message = SignalMessage::signed(
                &a,
                "pact-1",
                None,
                SignalBody::Ice(IceCandidate::new(name)),
                ts,
            )
            .unwrap();
            bus.inject(RELAY_A, &topic, &message.encode().unwrap());
        }

        let fresh = SignalMessage::signed(
            &a,
            "pact-1",
            None,
            SignalBody::Ice(IceCandidate::new("fresh")),
            Utc::now().timestamp_millis(),
        )
        .unwrap();
        bus.inject(RELAY_A, &topic, &fresh.encode().unwrap());
        settle().await;

        assert_eq!(rx.try_recv().unwrap().candidate, "fresh");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_publish_failure_is_reported() {
        let bus = MemoryBus::new();
        let a = channel(&bus, "pact-1");
        a.connect(&relays()).await.unwrap();

        bus.set_offline(RELAY_B, true);
        let report = a.send_ice_candidate(IceCandidate::new("c"), None).await.unwrap();
        assert_eq!(report.delivered, vec![RELAY_A.to_string()]);
        assert_eq!(report.failed.len(), 1);

        bus.set_offline(RELAY_A, true);
        assert!(matches!(
            a.send_ice_candidate(IceCandidate::new("c"), None).await,
            Err(SignalingError::PublishFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_and_tolerates_partial_outage() {
        let bus = MemoryBus::new();
        bus.set_offline(RELAY_B, true);
        let a = channel(&bus, "pact-1");

        a.connect(&relays()).await.unwrap();
        a.connect(&relays()).await.unwrap();
        assert_eq!(a.state(), ChannelState::Connected);
        assert_eq!(a.relay_count(), 1);
        assert_eq!(bus.subscription_count(RELAY_A), 1);
    }

    #[tokio::test]
    async fn test_connect_fails_when_every_relay_is_down() {
        let bus = MemoryBus::new();
        bus.set_offline(RELAY_A, true);
        bus.set_offline(RELAY_B, true);
        let a = channel(&bus, "pact-1");

        assert!(matches!(
            a.connect(&relays()).await,
            Err(SignalingError::SubscribeFailed(_))
        ));
        assert_eq!(a.state(), ChannelState::Error);
        assert!(matches!(
            a.send_offer(offer(), None).await,
            Err(SignalingError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let bus = MemoryBus::new();
        let a = channel(&bus, "pact-1");
        a.disconnect().await;
        a.connect(&relays()).await.unwrap();

        a.disconnect().await;
        a.disconnect().await;
        assert_eq!(a.state(), ChannelState::Disconnected);
        assert_eq!(bus.subscription_count(RELAY_A), 0);
        assert_eq!(bus.subscription_count(RELAY_B), 0);
    }
}
