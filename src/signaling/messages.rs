//! Message Types für das Signaling-Protokoll
//!
//! Geschlossenes Wire-Schema `{offer, answer, ice, ping, hangup}`. Jede
//! Nachricht ist an eine Session gebunden, trägt einen Zeitstempel und
//! ist mit der Ghost-Identität des Absenders signiert.

use crate::crypto::{GhostId, GhostIdError, GhostIdentity};
use crate::sdp::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Präfix für session-gebundene Relay-Topics
pub const TOPIC_PREFIX: &str = "ghostline/";

/// Relay-Topic einer Session
pub fn session_topic(session_id: &str) -> String {
    format!("{TOPIC_PREFIX}{session_id}")
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[default]
    Audio,
    Video,
}

/// SDP Offer, initial (Epoche 0) oder als ICE-Restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub description: SessionDescription,
    pub call_type: CallType,
    #[serde(default)]
    pub restart_epoch: u32,
}

/// SDP Answer zu einem Offer derselben Epoche
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub description: SessionDescription,
    #[serde(default)]
    pub restart_epoch: u32,
}

/// Anruf beenden oder ablehnen
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangupPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Alle Nachrichtentypen auf dem Relay-Bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalBody {
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Ice(IceCandidate),
    /// Reserviert
    Ping,
    Hangup(HangupPayload),
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::Ice(_) => "ice",
            SignalBody::Ping => "ping",
            SignalBody::Hangup(_) => "hangup",
        }
    }
}

// ============================================================================
// SIGNAL MESSAGE
// ============================================================================

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed signal payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid signature: {0}")]
    Signature(#[from] GhostIdError),
}

/// Adressierte, signierte Signal-Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(flatten)]
    pub body: SignalBody,
    pub sender_ghost_id: GhostId,
    /// Leer = an alle Teilnehmer der Session
    #[serde(default)]
    pub target_ghost_id: GhostId,
    pub session_id: String,
    /// Unix-Zeit in Millisekunden
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
}

impl SignalMessage {
    /// Erstellt und signiert eine Nachricht
    pub fn signed(
        identity: &GhostIdentity,
        session_id: &str,
        target: Option<&GhostId>,
        body: SignalBody,
        timestamp: i64,
    ) -> Result<Self, serde_json::Error> {
        let mut message = Self {
            body,
            sender_ghost_id: identity.id().clone(),
            target_ghost_id: target.cloned().unwrap_or_default(),
            session_id: session_id.to_string(),
            timestamp,
            signature: String::new(),
        };
        let value = serde_json::to_value(&message)?;
        message.signature = identity.sign_message(&value);
        Ok(message)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parst eine Nachricht und prüft die Signatur gegen das rohe JSON
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let message: SignalMessage = serde_json::from_value(raw.clone())?;
        GhostIdentity::verify_message(&message.sender_ghost_id, &raw, &message.signature)?;
        Ok(message)
    }

    /// Eindeutige Kennung zur Duplikaterkennung
    pub fn dedup_key(&self) -> &str {
        &self.signature
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_body() -> SignalBody {
        SignalBody::Offer(OfferPayload {
            description: SessionDescription::offer("v=0"),
            call_type: CallType::Video,
            restart_epoch: 0,
        })
    }

    #[test]
    fn test_wire_shape() {
        let ghost = GhostIdentity::generate();
        let msg = SignalMessage::signed(&ghost, "pact-1", None, offer_body(), 42).unwrap();
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "offer");
        assert_eq!(value["payload"]["callType"], "video");
        assert_eq!(value["payload"]["description"]["type"], "offer");
        assert_eq!(value["sessionId"], "pact-1");
        assert_eq!(value["targetGhostId"], "");
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn test_decode_verifies_signature() {
        let ghost = GhostIdentity::generate();
        let target = GhostId::new("someone");
        let msg =
            SignalMessage::signed(&ghost, "pact-1", Some(&target), SignalBody::Ping, 7).unwrap();

        let decoded = SignalMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.target_ghost_id, target);
    }

    #[test]
    fn test_forged_sender_is_rejected() {
        let ghost = GhostIdentity::generate();
        let impostor = GhostIdentity::generate();
        let mut msg = SignalMessage::signed(
            &ghost,
            "pact-1",
            None,
            SignalBody::Hangup(HangupPayload::default()),
            7,
        )
        .unwrap();
        msg.sender_ghost_id = impostor.id().clone();

        assert!(matches!(
            SignalMessage::decode(&msg.encode().unwrap()),
            Err(DecodeError::Signature(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let text = r#"{"type":"subscribe","payload":{},"senderGhostId":"x","sessionId":"s","timestamp":1}"#;
        assert!(matches!(
            SignalMessage::decode(text),
            Err(DecodeError::Malformed(_))
        ));
        assert!(SignalMessage::decode("not json").is_err());
    }
}
