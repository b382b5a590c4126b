//! Ephemere Ghost-Identitäten
//!
//! Eine Ghost ID ist der Base64-kodierte Ed25519 Public Key eines
//! Schlüsselpaars, das pro Anrufversuch frisch erzeugt wird. Sie dient nur
//! der Adressierung auf dem Relay-Bus und hat keinerlei Bezug zur
//! dauerhaften Identität des Benutzers.
//!
//! ## Verwendung
//! ```rust
//! use ghostline::crypto::GhostIdentity;
//!
//! let ghost = GhostIdentity::generate();
//! let payload = serde_json::json!({ "type": "ping", "timestamp": 1 });
//! let signature = ghost.sign_message(&payload);
//! assert!(GhostIdentity::verify_message(ghost.id(), &payload, &signature).is_ok());
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{CryptoRng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum GhostIdError {
    #[error("Failed to decode base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid public key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid signature length: expected 64, got {0}")]
    InvalidSignatureLength(usize),

    #[error("Ghost ID is not a valid Ed25519 public key")]
    InvalidKey,

    #[error("Signature does not match the sender's ghost ID")]
    BadSignature,
}

// ============================================================================
// GHOST ID
// ============================================================================

/// Öffentliche, kurzlebige Adresse eines Teilnehmers (Base64 Public Key)
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GhostId(String);

impl GhostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Kurzform für Logs
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }

    fn verifying_key(&self) -> Result<VerifyingKey, GhostIdError> {
        let bytes = BASE64.decode(&self.0)?;
        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| GhostIdError::InvalidKeyLength(bytes.len()))?;
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| GhostIdError::InvalidKey)
    }
}

impl fmt::Display for GhostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// GHOST IDENTITY
// ============================================================================

/// Ed25519 Schlüsselpaar eines einzelnen Anrufversuchs
///
/// Wird nie auf die Platte geschrieben. Beim Drop wird der Secret Key
/// von `ed25519-dalek` genullt.
pub struct GhostIdentity {
    signing_key: SigningKey,
    id: GhostId,
}

impl GhostIdentity {
    /// Generiert eine neue Identität aus dem Betriebssystem-Zufall
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    /// Generiert eine neue Identität aus einer beliebigen CSPRNG
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        let id = GhostId(BASE64.encode(signing_key.verifying_key().to_bytes()));
        Self { signing_key, id }
    }

    /// Gibt die öffentliche Ghost ID zurück
    pub fn id(&self) -> &GhostId {
        &self.id
    }

    /// Signiert Daten mit dem Secret Key
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Signiert Daten und gibt die Signatur als Base64 zurück
    pub fn sign_base64(&self, message: &[u8]) -> String {
        BASE64.encode(self.sign(message).to_bytes())
    }

    /// Signiert eine Signal-Nachricht
    ///
    /// Die Signatur wird über den JSON-String aller Felder (außer signature)
    /// in alphabetischer Sortierung berechnet.
    pub fn sign_message(&self, payload: &serde_json::Value) -> String {
        self.sign_base64(&canonical_bytes(payload))
    }

    /// Prüft die Signatur einer Nachricht gegen die Ghost ID des Absenders
    pub fn verify_message(
        sender: &GhostId,
        payload: &serde_json::Value,
        signature_base64: &str,
    ) -> Result<(), GhostIdError> {
        let key = sender.verifying_key()?;
        let bytes = BASE64.decode(signature_base64)?;
        let sig_bytes: [u8; 64] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| GhostIdError::InvalidSignatureLength(bytes.len()))?;
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify(&canonical_bytes(payload), &signature)
            .map_err(|_| GhostIdError::BadSignature)
    }
}

impl fmt::Debug for GhostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GhostIdentity")
            .field("id", &self.id)
            .finish()
    }
}

fn canonical_bytes(payload: &serde_json::Value) -> Vec<u8> {
    let sorted = sort_json_object(payload);
    serde_json::to_vec(&sorted).unwrap_or_default()
}

/// Sortiert ein JSON-Objekt alphabetisch nach Keys und entfernt `signature`
fn sort_json_object(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted_map = serde_json::Map::new();
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            for key in keys {
                if key != "signature" {
                    if let Some(v) = map.get(key) {
                        sorted_map.insert(key.clone(), sort_json_object(v));
                    }
                }
            }
            serde_json::Value::Object(sorted_map)
        }
        other => other.clone(),
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

/// Quelle für frische Ghost-Identitäten
///
/// Wird in den Signaling Channel injiziert, damit Tests deterministische
/// Identitäten verwenden können.
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self) -> GhostIdentity;
}

/// Erzeugt Identitäten aus `OsRng`
#[derive(Debug, Default, Clone, Copy)]
pub struct OsIdentityGenerator;

impl IdentityGenerator for OsIdentityGenerator {
    fn generate(&self) -> GhostIdentity {
        GhostIdentity::generate()
    }
}

/// Deterministische Identitäten aus einem festen Seed
pub struct SeededIdentityGenerator {
    rng: Mutex<StdRng>,
}

impl SeededIdentityGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl IdentityGenerator for SeededIdentityGenerator {
    fn generate(&self) -> GhostIdentity {
        GhostIdentity::generate_with(&mut *self.rng.lock())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ghost_id_is_base64_public_key() {
        let ghost = GhostIdentity::generate();

        // 32 bytes = 44 chars Base64
        assert_eq!(ghost.id().as_str().len(), 44);
        assert_eq!(
            BASE64.decode(ghost.id().as_str()).unwrap(),
            ghost.signing_key.verifying_key().to_bytes()
        );
    }

    #[test]
    fn test_fresh_identity_per_generation() {
        let generator = OsIdentityGenerator;
        assert_ne!(generator.generate().id(), generator.generate().id());
    }

    #[test]
    fn test_seeded_generator_is_deterministic() {
        let a = SeededIdentityGenerator::new(7);
        let b = SeededIdentityGenerator::new(7);
        assert_eq!(a.generate().id(), b.generate().id());
        assert_eq!(a.generate().id(), b.generate().id());
    }

    #[test]
    fn test_signature_ignores_field_order_and_signature_field() {
        let ghost = GhostIdentity::generate();
        let payload = serde_json::json!({
            "type": "offer",
            "sessionId": "pact-1",
            "timestamp": 1234567890
        });
        let signature = ghost.sign_message(&payload);

        let mut signed = payload.clone();
        signed["signature"] = serde_json::Value::String(signature.clone());

        assert!(GhostIdentity::verify_message(ghost.id(), &signed, &signature).is_ok());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let ghost = GhostIdentity::generate();
        let payload = serde_json::json!({ "type": "hangup", "timestamp": 1 });
        let signature = ghost.sign_message(&payload);

        let tampered = serde_json::json!({ "type": "hangup", "timestamp": 2 });
        assert!(matches!(
            GhostIdentity::verify_message(ghost.id(), &tampered, &signature),
            Err(GhostIdError::BadSignature)
        ));
    }

    #[test]
    fn test_foreign_ghost_id_is_rejected() {
        let ghost = GhostIdentity::generate();
        let other = GhostIdentity::generate();
        let payload = serde_json::json!({ "type": "ping" });
        let signature = ghost.sign_message(&payload);

        assert!(GhostIdentity::verify_message(other.id(), &payload, &signature).is_err());
        assert!(matches!(
            GhostIdentity::verify_message(&GhostId::new("not-a-key"), &payload, &signature),
            Err(GhostIdError::Base64Decode(_)) | Err(GhostIdError::InvalidKeyLength(_))
        ));
    }
}
