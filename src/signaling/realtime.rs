//! Realtime-Backend Abstraktion
//!
//! Der SignalingClient spricht nicht direkt mit einem bestimmten Dienst,
//! sondern mit einem `RealtimeBackend`, das pro Topic einen Channel mit
//! Broadcast und Presence liefert. Implementierungen:
//! - `PhoenixBackend` (WebSocket, gehostete Realtime-Dienste)
//! - `MemoryHub` (In-Process, für Loopback und Tests)

use super::SignalingError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// CHANNEL EVENTS
// ============================================================================

/// Subscription-Status eines Channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Rohe Events eines Channels, noch ohne Signaling-Semantik
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Broadcast { event: String, payload: Value },
    PresenceJoin { key: String, metas: Vec<Value> },
    PresenceLeave { key: String, metas: Vec<Value> },
}

/// Parameter für den Channel-Beitritt
#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub topic: String,
    pub presence_key: String,
    /// Eigene Broadcasts zurückbekommen (für Signaling immer `false`)
    pub broadcast_self: bool,
}

/// Ergebnis eines Beitritts: Channel-Handle plus Event-Strom
pub struct Subscription {
    pub channel: Arc<dyn RealtimeChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    /// Tritt einem Topic bei. Der Subscription-Status kommt asynchron als
    /// `ChannelEvent::Status` über `Subscription::events`.
    async fn join(&self, options: JoinOptions) -> Result<Subscription, SignalingError>;
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), SignalingError>;

    async fn track(&self, meta: Value) -> Result<(), SignalingError>;

    async fn untrack(&self) -> Result<(), SignalingError>;

    /// Aktueller Presence-Zustand: Key → Metas
    fn presence_state(&self) -> HashMap<String, Vec<Value>>;

    async fn unsubscribe(&self) -> Result<(), SignalingError>;
}

// ============================================================================
// PRESENCE STATE
// ============================================================================

/// Presence-Buchhaltung auf Key-Ebene.
///
/// Ein Key gilt als beigetreten, sobald er mindestens eine Meta hat, und als
/// gegangen, wenn seine letzte Meta entfernt wurde. Nur diese Übergänge
/// erzeugen Events.
#[derive(Debug, Default, Clone)]
pub struct PresenceState {
    entries: HashMap<String, Vec<Value>>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ersetzt den kompletten Zustand (`presence_state`)
    pub fn sync(&mut self, next: HashMap<String, Vec<Value>>) -> Vec<ChannelEvent> {
        let mut events = Vec::new();

        for (key, metas) in &self.entries {
            if !next.contains_key(key) {
                events.push(ChannelEvent::PresenceLeave {
                    key: key.clone(),
                    metas: metas.clone(),
                });
            }
        }
        for (key, metas) in &next {
            if !self.entries.contains_key(key) && !metas.is_empty() {
                events.push(ChannelEvent::PresenceJoin {
                    key: key.clone(),
                    metas: metas.clone(),
                });
            }
        }

        self.entries = next.into_iter().filter(|(_, m)| !m.is_empty()).collect();
        events
    }

    /// Wendet ein Delta an (`presence_diff`)
    pub fn diff(
        &mut self,
        joins: HashMap<String, Vec<Value>>,
        leaves: HashMap<String, Vec<Value>>,
    ) -> Vec<ChannelEvent> {
        let mut events = Vec::new();

        for (key, metas) in joins {
            if metas.is_empty() {
                continue;
            }
            let entry = self.entries.entry(key.clone()).or_default();
            let is_new = entry.is_empty();
            entry.extend(metas.iter().cloned());
            if is_new {
                events.push(ChannelEvent::PresenceJoin { key, metas });
            }
        }

        for (key, metas) in leaves {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            entry.retain(|m| !metas.iter().any(|left| same_meta(m, left)));
            if entry.is_empty() {
                self.entries.remove(&key);
                events.push(ChannelEvent::PresenceLeave { key, metas });
            }
        }

        events
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<Value>> {
        self.entries.clone()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Metas werden über `phx_ref` verglichen, sonst über den ganzen Wert
fn same_meta(a: &Value, b: &Value) -> bool {
    match (a.get("phx_ref"), b.get("phx_ref")) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Parst `{ key: { metas: [...] } }`
pub fn parse_presence_map(value: &Value) -> HashMap<String, Vec<Value>> {
    let mut map = HashMap::new();
    if let Some(obj) = value.as_object() {
        for (key, entry) in obj {
            let metas = entry
                .get("metas")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            map.insert(key.clone(), metas);
        }
    }
    map
}
