//! Konfiguration für Signaling, ICE, Qualitätsmessung und Circuit Breaker

use crate::call_engine::QualityThresholds;
use crate::resilience::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Standard-Adresse des Realtime-Dienstes
pub const DEFAULT_SIGNALING_URL: &str = "http://127.0.0.1:54321";

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// STUN/TURN Server und Candidate Pool, fest ab Erstellung der Engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IceConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub candidate_pool_size: u8,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            candidate_pool_size: 10,
        }
    }
}

impl IceConfig {
    /// Nur Host-Candidates (Loopback, Tests)
    pub fn host_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            candidate_pool_size: 0,
        }
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn with_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        });
        self
    }
}

// ============================================================================
// SIGNALING CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignalingConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub join_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Wartezeit nach einem Reconnect, bevor Peers ohne Presence geschlossen werden
    pub presence_grace_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
            api_key: None,
            join_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            presence_grace_ms: 5_000,
        }
    }
}

impl SignalingConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn presence_grace(&self) -> Duration {
        Duration::from_millis(self.presence_grace_ms)
    }
}

// ============================================================================
// MESH CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub quality: QualityThresholds,
    pub stats_interval_ms: u64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice: IceConfig::default(),
            quality: QualityThresholds::default(),
            stats_interval_ms: 2_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Liest die Konfiguration aus Umgebungsvariablen
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Wie `from_env`, aber mit beliebiger Quelle für die Variablen
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling.url = url;
        }
        config.signaling.api_key = lookup("SIGNALING_API_KEY").filter(|k| !k.is_empty());

        if let Some(url) = lookup("TURN_URL").filter(|u| !u.is_empty()) {
            let username = lookup("TURN_USERNAME").unwrap_or_default();
            let credential = lookup("TURN_CREDENTIAL").unwrap_or_default();
            config.ice = config.ice.with_turn_server(url, username, credential);
        }

        config
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}
