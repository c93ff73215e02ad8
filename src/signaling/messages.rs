//! Message Types für das Signaling-Protokoll
//!
//! Alle Nachrichten laufen als Broadcast-Events über den Meeting-Channel
//! (`meeting:<id>`). Die Feldnamen entsprechen dem JSON-Format der
//! Web-Clients (camelCase), damit beide Seiten denselben Raum teilen können.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// EVENT NAMES
// ============================================================================

pub const EVENT_OFFER: &str = "offer";
pub const EVENT_ANSWER: &str = "answer";
pub const EVENT_ICE_CANDIDATE: &str = "ice-candidate";

// ============================================================================
// SDP / ICE
// ============================================================================

/// Typ einer Session Description (entspricht `RTCSdpType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Entspricht `RTCSessionDescriptionInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Entspricht `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// BROADCAST PAYLOADS
// ============================================================================

/// Payload von `offer` und `answer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionPayload {
    pub sdp: SessionDescription,
    pub user_id: String,
    pub timestamp: i64,
    /// Adressat innerhalb des Raums; fehlt bei Clients ohne Mesh-Adressierung
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
}

/// Payload von `ice-candidate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: IceCandidate,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
}

/// Presence-Metadaten, die beim Beitritt getrackt werden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMeta {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub timestamp: i64,
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Eine Signaling-Nachricht auf dem Draht. Wird nie persistiert.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    Offer(DescriptionPayload),
    Answer(DescriptionPayload),
    IceCandidate(IceCandidatePayload),
}

impl SignalingMessage {
    /// Broadcast-Event-Name
    pub fn event(&self) -> &'static str {
        match self {
            SignalingMessage::Offer(_) => EVENT_OFFER,
            SignalingMessage::Answer(_) => EVENT_ANSWER,
            SignalingMessage::IceCandidate(_) => EVENT_ICE_CANDIDATE,
        }
    }

    /// Absender-ID
    pub fn sender(&self) -> &str {
        match self {
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => &p.user_id,
            SignalingMessage::IceCandidate(p) => &p.user_id,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => {
                p.target_user_id.as_deref()
            }
            SignalingMessage::IceCandidate(p) => p.target_user_id.as_deref(),
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => serde_json::to_value(p),
            SignalingMessage::IceCandidate(p) => serde_json::to_value(p),
        }
    }

    /// Parst einen eingehenden Broadcast. Unbekannte Events ergeben `None`.
    pub fn from_broadcast(event: &str, payload: Value) -> Result<Option<Self>, serde_json::Error> {
        let msg = match event {
            EVENT_OFFER => Some(SignalingMessage::Offer(serde_json::from_value(payload)?)),
            EVENT_ANSWER => Some(SignalingMessage::Answer(serde_json::from_value(payload)?)),
            EVENT_ICE_CANDIDATE => Some(SignalingMessage::IceCandidate(
                serde_json::from_value(payload)?,
            )),
            _ => None,
        };
        Ok(msg)
    }
}

// ============================================================================
// PRESENCE
// ============================================================================

/// Teilnehmer im Meeting-Channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub user_name: String,
    pub joined_at: i64,
}

impl PresenceRecord {
    /// Baut einen Record aus Presence-Metadaten; fehlt der Name, wird ein
    /// Platzhalter aus der ID abgeleitet.
    pub fn from_meta(meta: &PresenceMeta) -> Self {
        let user_name = match meta.user_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => fallback_display_name(&meta.user_id),
        };

        Self {
            user_id: meta.user_id.clone(),
            user_name,
            joined_at: meta.timestamp,
        }
    }
}

/// Platzhalter-Name: "User " + die ersten 6 Zeichen der ID
pub fn fallback_display_name(user_id: &str) -> String {
    let short: String = user_id.chars().take(6).collect();
    format!("User {}", short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_format() {
        let msg = SignalingMessage::Offer(DescriptionPayload {
            sdp: SessionDescription::offer("v=0"),
            user_id: "alice".to_string(),
            timestamp: 1700000000000,
            target_user_id: None,
        });

        let payload = msg.to_payload().unwrap();
        assert_eq!(msg.event(), "offer");
        assert_eq!(
            payload,
            json!({
                "sdp": { "type": "offer", "sdp": "v=0" },
                "userId": "alice",
                "timestamp": 1700000000000i64
            })
        );
    }

    #[test]
    fn test_ice_candidate_from_browser_payload() {
        let payload = json!({
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            },
            "userId": "bob",
            "targetUserId": "alice"
        });

        let msg = SignalingMessage::from_broadcast("ice-candidate", payload)
            .unwrap()
            .unwrap();
        assert_eq!(msg.sender(), "bob");
        assert_eq!(msg.target(), Some("alice"));
        match msg {
            SignalingMessage::IceCandidate(p) => {
                assert_eq!(p.candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(p.candidate.sdp_mline_index, Some(0));
                assert_eq!(p.candidate.username_fragment, None);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let msg = SignalingMessage::from_broadcast("chat", json!({ "text": "hi" })).unwrap();
        assert!(msg.is_none());
    }

    #[test]
    fn test_malformed_answer_is_an_error() {
        let result = SignalingMessage::from_broadcast("answer", json!({ "userId": "bob" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_presence_name_fallback() {
        let named = PresenceRecord::from_meta(&PresenceMeta {
            user_id: "u-123456789".to_string(),
            user_name: Some("Alice".to_string()),
            timestamp: 5,
        });
        assert_eq!(named.user_name, "Alice");
        assert_eq!(named.joined_at, 5);

        let anonymous = PresenceRecord::from_meta(&PresenceMeta {
            user_id: "u-123456789".to_string(),
            user_name: Some("   ".to_string()),
            timestamp: 5,
        });
        assert_eq!(anonymous.user_name, "User u-1234");
    }
}
