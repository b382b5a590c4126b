//! Konfiguration für Call Engine und Signaling
//!
//! Standardwerte entsprechen dem Referenzverhalten (3 Reconnect-Versuche,
//! 5 Sekunden Qualitäts-Intervall). Über Umgebungsvariablen lassen sich
//! Relays und ein TURN-Server setzen.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relays, falls `GHOSTLINE_RELAYS` nicht gesetzt ist
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol"];

/// Kleinstes zulässiges Intervall des Quality Monitors
pub const MIN_QUALITY_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: String::new(),
            credential: String::new(),
        },
    ]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub relays: Vec<String>,
    pub ice_servers: Vec<IceServerConfig>,
    /// Aufeinanderfolgende Link-Fehler bis `failed`
    pub max_reconnect_attempts: u32,
    pub quality_interval: Duration,
    /// Maximales Alter eingehender Signal-Nachrichten
    pub signal_expiry: Duration,
    /// Wie lange `ended`/`failed` angezeigt wird, bevor wieder `idle` gilt
    pub idle_reset_delay: Duration,
    /// Obergrenze gleichzeitiger Relay-Publishes
    pub publish_concurrency: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            ice_servers: default_ice_servers(),
            max_reconnect_attempts: 3,
            quality_interval: Duration::from_secs(5),
            signal_expiry: Duration::from_secs(30),
            idle_reset_delay: Duration::from_millis(500),
            publish_concurrency: 8,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus Umgebungsvariablen
    ///
    /// - `GHOSTLINE_RELAYS`: kommagetrennte Relay-URLs
    /// - `GHOSTLINE_TURN_URL`, `GHOSTLINE_TURN_USERNAME`, `GHOSTLINE_TURN_CREDENTIAL`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(relays) = lookup("GHOSTLINE_RELAYS") {
            let relays: Vec<String> = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if !relays.is_empty() {
                config.relays = relays;
            }
        }

        if let Some(url) = lookup("GHOSTLINE_TURN_URL") {
            config = config.with_turn_server(
                url,
                lookup("GHOSTLINE_TURN_USERNAME").unwrap_or_default(),
                lookup("GHOSTLINE_TURN_CREDENTIAL").unwrap_or_default(),
            );
        }

        config
    }

    /// Zieht Werte, mit denen die Engine nicht arbeiten kann, auf ihr Minimum
    pub fn normalized(mut self) -> Self {
        if self.quality_interval < MIN_QUALITY_INTERVAL {
            tracing::warn!(
                "quality_interval {:?} too small, using {:?}",
                self.quality_interval,
                MIN_QUALITY_INTERVAL
            );
            self.quality_interval = MIN_QUALITY_INTERVAL;
        }
        self.publish_concurrency = self.publish_concurrency.max(1);
        self
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_reference_behaviour() {
        let config = CallConfig::default();
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.quality_interval, Duration::from_secs(5));
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_env_overrides_relays_and_turn() {
        let env: HashMap<&str, &str> = [
            ("GHOSTLINE_RELAYS", "wss://a.example, wss://b.example,"),
            ("GHOSTLINE_TURN_URL", "turn:turn.example:3478"),
            ("GHOSTLINE_TURN_USERNAME", "ghost"),
        ]
        .into_iter()
        .collect();

        let config = CallConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.relays, vec!["wss://a.example", "wss://b.example"]);
        let turn = config.ice_servers.last().unwrap();
        assert_eq!(turn.urls, vec!["turn:turn.example:3478"]);
        assert_eq!(turn.username, "ghost");
        assert_eq!(turn.credential, "");
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = CallConfig {
            quality_interval: Duration::ZERO,
            publish_concurrency: 0,
            ..CallConfig::default()
        }
        .normalized();
        assert_eq!(config.quality_interval, MIN_QUALITY_INTERVAL);
        assert_eq!(config.publish_concurrency, 1);

        let untouched = CallConfig::default().normalized();
        assert_eq!(untouched.quality_interval, Duration::from_secs(5));
        assert_eq!(untouched.publish_concurrency, 8);
    }

    #[test]
    fn test_deserialized_zero_interval_is_clamped() {
        let config: CallConfig =
            serde_json::from_str(r#"{"quality_interval":{"secs":0,"nanos":0}}"#).unwrap();
        assert_eq!(config.quality_interval, Duration::ZERO);
        assert_eq!(config.normalized().quality_interval, MIN_QUALITY_INTERVAL);
    }

    #[test]
    fn test_empty_relay_list_keeps_defaults() {
        let config = CallConfig::from_lookup(|k| (k == "GHOSTLINE_RELAYS").then(|| " , ".into()));
        assert_eq!(config.relays.len(), DEFAULT_RELAYS.len());
    }
}
