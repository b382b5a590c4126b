//! Crypto Module - Ephemere Ed25519 Identitäten ("Ghost IDs")
//!
//! Dieses Modul verwaltet die kurzlebigen Signalisierungs-Identitäten:
//! - Frisches Ed25519 Schlüsselpaar pro Anrufversuch, niemals persistiert
//! - Signierung ausgehender Signal-Nachrichten
//! - Verifikation eingehender Signaturen gegen die Ghost ID des Absenders
//!

mod ghost;

pub use ghost::{
    GhostId, GhostIdError, GhostIdentity, IdentityGenerator, OsIdentityGenerator,
    SeededIdentityGenerator,
};
