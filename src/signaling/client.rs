//! Signaling Client für Meeting-Channels
//!
//! Verwaltet die Mitgliedschaft in einem Meeting-Channel:
//! - Beitritt mit Timeout-Erkennung
//! - Presence (Join/Leave) der Teilnehmer
//! - Geordnetes Senden von Offer/Answer/ICE
//! - Event-basierte Kommunikation

use super::messages::*;
use super::realtime::{ChannelEvent, ChannelStatus, JoinOptions, RealtimeBackend, RealtimeChannel};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling channel")]
    NotConnected,

    #[error("Timed out waiting for channel subscription")]
    ConnectionTimeout,

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Channel beigetreten
    Connected { meeting_id: String },

    /// Verbindung sauber getrennt
    Disconnected,

    /// Channel nach dem Beitritt verloren (Fehler, Timeout, Close)
    ConnectionLost { reason: String },

    /// SDP Offer erhalten
    Offer {
        from_user_id: String,
        target_user_id: Option<String>,
        sdp: SessionDescription,
        timestamp: i64,
    },

    /// SDP Answer erhalten
    Answer {
        from_user_id: String,
        target_user_id: Option<String>,
        sdp: SessionDescription,
        timestamp: i64,
    },

    /// ICE Candidate erhalten
    IceCandidate {
        from_user_id: String,
        target_user_id: Option<String>,
        candidate: IceCandidate,
    },

    /// Teilnehmer beigetreten
    ParticipantJoined(PresenceRecord),

    /// Teilnehmer gegangen
    ParticipantLeft { user_id: String },

    /// Fehler beim Senden oder Empfangen
    Error(SignalingError),
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    meeting_id: Option<String>,
    user_id: Option<String>,
    user_name: Option<String>,
}

/// Beitrittszeit der Presence, bleibt über Reconnects derselben Teilnahme gleich
#[derive(Debug, Clone)]
struct PresenceSince {
    meeting_id: String,
    user_id: String,
    timestamp: i64,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// Client für einen Meeting-Channel
pub struct SignalingClient {
    backend: Arc<dyn RealtimeBackend>,
    join_timeout: Duration,
    state: Arc<RwLock<ClientState>>,
    channel: Mutex<Option<Arc<dyn RealtimeChannel>>>,
    tx: RwLock<Option<mpsc::UnboundedSender<SignalingMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    presence_since: Mutex<Option<PresenceSince>>,
    lifecycle: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(backend: Arc<dyn RealtimeBackend>, join_timeout: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            backend,
            join_timeout,
            state: Arc::new(RwLock::new(ClientState::default())),
            channel: Mutex::new(None),
            tx: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            presence_since: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.read().user_id.clone()
    }

    pub fn meeting_id(&self) -> Option<String> {
        self.state.read().meeting_id.clone()
    }

    /// Tritt dem Meeting-Channel bei und registriert Presence.
    ///
    /// Ist der Client bereits verbunden, wird nur gewarnt.
    pub async fn connect(
        &self,
        meeting_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<(), SignalingError> {
        let _guard = self.lifecycle.lock().await;

        if self.is_connected() {
            tracing::warn!(
                "Already connected to meeting {:?}, ignoring connect",
                self.meeting_id()
            );
            return Ok(());
        }

        // Reste einer verlorenen Verbindung aufräumen
        if self.channel.lock().is_some() {
            self.teardown().await;
        }

        let topic = format!("meeting:{}", meeting_id);
        tracing::info!("Joining signaling channel {} as {}", topic, user_id);

        let subscription = self
            .backend
            .join(JoinOptions {
                topic,
                presence_key: user_id.to_string(),
                broadcast_self: false,
            })
            .await?;
        let channel = subscription.channel;
        let mut events = subscription.events;

        // Auf Subscribe warten
        let early_events =
            match tokio::time::timeout(self.join_timeout, wait_for_subscription(&mut events)).await
            {
                Ok(Ok(early)) => early,
                Ok(Err(e)) => {
                    tracing::error!("Channel subscription failed: {}", e);
                    discard_channel(&channel).await;
                    return Err(e);
                }
                Err(_) => {
                    tracing::error!("Channel subscription timed out after {:?}", self.join_timeout);
                    discard_channel(&channel).await;
                    return Err(SignalingError::ConnectionTimeout);
                }
            };

        // Presence registrieren
        let meta = PresenceMeta {
            user_id: user_id.to_string(),
            user_name: Some(user_name.trim().to_string()).filter(|n| !n.is_empty()),
            timestamp: self.presence_timestamp(meeting_id, user_id),
        };
        let meta_json = serde_json::to_value(&meta)
            .map_err(|e| SignalingError::InvalidMessage(e.to_string()))?;
        if let Err(e) = channel.track(meta_json).await {
            discard_channel(&channel).await;
            return Err(e);
        }

        // Write-Task: eine Queue, damit Nachrichten in Aufrufreihenfolge rausgehen
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let write_channel = Arc::clone(&channel);
        let write_events = self.event_tx.clone();
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let payload = match msg.to_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!("Failed to encode {} message: {}", msg.event(), e);
                        continue;
                    }
                };
                if let Err(e) = write_channel.broadcast(msg.event(), payload).await {
                    tracing::error!("Failed to broadcast {}: {}", msg.event(), e);
                    let _ = write_events.send(SignalingEvent::Error(e));
                }
            }
        });

        // Writer und Channel stehen bereit, bevor `send_*` den Client als verbunden sieht
        *self.tx.write() = Some(tx);
        *self.channel.lock() = Some(channel);
        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.meeting_id = Some(meeting_id.to_string());
            state.user_id = Some(user_id.to_string());
            state.user_name = Some(user_name.to_string());
        }

        // Read-Task erst danach, sonst ginge ein frühes Stream-Ende verloren
        let local_user_id = user_id.to_string();
        let read_state = Arc::clone(&self.state);
        let read_events = self.event_tx.clone();
        let read_task = tokio::spawn(async move {
            for event in early_events {
                Self::handle_channel_event(event, &local_user_id, &read_state, &read_events);
            }
            while let Some(event) = events.recv().await {
                if !Self::handle_channel_event(event, &local_user_id, &read_state, &read_events) {
                    return;
                }
            }
            Self::mark_lost("event stream ended", &read_state, &read_events);
        });

        self.tasks.lock().extend([write_task, read_task]);

        tracing::info!("Connected to meeting {}", meeting_id);
        let _ = self.event_tx.send(SignalingEvent::Connected {
            meeting_id: meeting_id.to_string(),
        });

        Ok(())
    }

    /// Gleicher Zeitstempel nach einem Reconnect, damit andere Teilnehmer
    /// ihn nicht als neue Teilnahme werten
    fn presence_timestamp(&self, meeting_id: &str, user_id: &str) -> i64 {
        let mut since = self.presence_since.lock();
        match since.as_ref() {
            Some(s) if s.meeting_id == meeting_id && s.user_id == user_id => s.timestamp,
            _ => {
                let timestamp = Utc::now().timestamp_millis();
                *since = Some(PresenceSince {
                    meeting_id: meeting_id.to_string(),
                    user_id: user_id.to_string(),
                    timestamp,
                });
                timestamp
            }
        }
    }

    /// Verlässt den Channel. Fehler beim Abbau werden nur geloggt.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.presence_since.lock().take();

        let was_active = self.is_connected() || self.channel.lock().is_some();
        self.teardown().await;

        if was_active {
            tracing::info!("Disconnected from signaling channel");
            let _ = self.event_tx.send(SignalingEvent::Disconnected);
        }
    }

    async fn teardown(&self) {
        // Zuerst als getrennt markieren: ein `phx_close` während des Abbaus
        // ist dann kein Verbindungsverlust mehr
        *self.state.write() = ClientState::default();
        self.tx.write().take();

        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.untrack().await {
                tracing::warn!("Failed to untrack presence: {}", e);
            }
            if let Err(e) = channel.unsubscribe().await {
                tracing::warn!("Failed to leave channel: {}", e);
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Aktuelle Teilnehmer (ohne sich selbst), sortiert nach Beitritt
    pub fn participants(&self) -> Vec<PresenceRecord> {
        let Some(local) = self.user_id() else {
            return Vec::new();
        };
        let Some(channel) = self.channel.lock().clone() else {
            return Vec::new();
        };

        let mut records: Vec<PresenceRecord> = channel
            .presence_state()
            .into_iter()
            .filter(|(key, _)| *key != local)
            .map(|(key, metas)| presence_record(&key, &metas))
            .collect();
        records.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        records
    }

    // ========================================================================
    // SENDEN
    // ========================================================================

    /// Sendet ein SDP Offer
    pub fn send_offer(
        &self,
        sdp: SessionDescription,
        target_user_id: Option<&str>,
    ) -> Result<(), SignalingError> {
        let user_id = self.user_id().ok_or(SignalingError::NotConnected)?;
        self.send(SignalingMessage::Offer(DescriptionPayload {
            sdp,
            user_id,
            timestamp: Utc::now().timestamp_millis(),
            target_user_id: target_user_id.map(str::to_string),
        }))
    }

    /// Sendet ein SDP Answer
    pub fn send_answer(
        &self,
        sdp: SessionDescription,
        target_user_id: Option<&str>,
    ) -> Result<(), SignalingError> {
        let user_id = self.user_id().ok_or(SignalingError::NotConnected)?;
        self.send(SignalingMessage::Answer(DescriptionPayload {
            sdp,
            user_id,
            timestamp: Utc::now().timestamp_millis(),
            target_user_id: target_user_id.map(str::to_string),
        }))
    }

    /// Sendet einen ICE Candidate
    pub fn send_ice_candidate(
        &self,
        candidate: IceCandidate,
        target_user_id: Option<&str>,
    ) -> Result<(), SignalingError> {
        let user_id = self.user_id().ok_or(SignalingError::NotConnected)?;
        self.send(SignalingMessage::IceCandidate(IceCandidatePayload {
            candidate,
            user_id,
            target_user_id: target_user_id.map(str::to_string),
        }))
    }

    /// Stellt eine Nachricht in die Sende-Queue (blockiert nicht)
    pub fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let tx = self.tx.read();
        let tx = tx.as_ref().ok_or(SignalingError::NotConnected)?;
        tx.send(msg)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    // ========================================================================
    // EMPFANGEN
    // ========================================================================

    /// Verarbeitet ein Channel-Event. `false` beendet den Read-Task.
    fn handle_channel_event(
        event: ChannelEvent,
        local_user_id: &str,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
    ) -> bool {
        match event {
            ChannelEvent::Broadcast { event, payload } => {
                let msg = match SignalingMessage::from_broadcast(&event, payload) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        tracing::trace!("Ignoring broadcast event {}", event);
                        return true;
                    }
                    Err(e) => {
                        tracing::warn!("Malformed {} message: {}", event, e);
                        let _ = event_tx.send(SignalingEvent::Error(
                            SignalingError::InvalidMessage(e.to_string()),
                        ));
                        return true;
                    }
                };

                // Eigene Nachrichten nie zurückliefern
                if msg.sender() == local_user_id {
                    return true;
                }
                if let Some(target) = msg.target() {
                    if target != local_user_id {
                        return true;
                    }
                }

                let event = match msg {
                    SignalingMessage::Offer(p) => SignalingEvent::Offer {
                        from_user_id: p.user_id,
                        target_user_id: p.target_user_id,
                        sdp: p.sdp,
                        timestamp: p.timestamp,
                    },
                    SignalingMessage::Answer(p) => SignalingEvent::Answer {
                        from_user_id: p.user_id,
                        target_user_id: p.target_user_id,
                        sdp: p.sdp,
                        timestamp: p.timestamp,
                    },
                    SignalingMessage::IceCandidate(p) => SignalingEvent::IceCandidate {
                        from_user_id: p.user_id,
                        target_user_id: p.target_user_id,
                        candidate: p.candidate,
                    },
                };
                let _ = event_tx.send(event);
            }

            ChannelEvent::PresenceJoin { key, metas } => {
                if key == local_user_id {
                    return true;
                }
                let record = presence_record(&key, &metas);
                tracing::info!("Participant joined: {} ({})", record.user_name, record.user_id);
                let _ = event_tx.send(SignalingEvent::ParticipantJoined(record));
            }

            ChannelEvent::PresenceLeave { key, .. } => {
                if key == local_user_id {
                    return true;
                }
                tracing::info!("Participant left: {}", key);
                let _ = event_tx.send(SignalingEvent::ParticipantLeft { user_id: key });
            }

            ChannelEvent::Status(ChannelStatus::Subscribed) => {}

            ChannelEvent::Status(status) => {
                let reason = match status {
                    ChannelStatus::ChannelError(reason) => reason,
                    ChannelStatus::TimedOut => "channel timed out".to_string(),
                    _ => "channel closed".to_string(),
                };
                Self::mark_lost(&reason, state, event_tx);
                return false;
            }
        }
        true
    }

    fn mark_lost(
        reason: &str,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
    ) {
        let was_connected = {
            let mut s = state.write();
            std::mem::replace(&mut s.is_connected, false)
        };
        if was_connected {
            tracing::warn!("Signaling connection lost: {}", reason);
            let _ = event_tx.send(SignalingEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }
}

/// Wartet auf `Subscribed`; vorher eintreffende Events werden gesammelt
async fn wait_for_subscription(
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
) -> Result<Vec<ChannelEvent>, SignalingError> {
    let mut early = Vec::new();
    loop {
        match events.recv().await {
            Some(ChannelEvent::Status(ChannelStatus::Subscribed)) => return Ok(early),
            Some(ChannelEvent::Status(ChannelStatus::ChannelError(reason))) => {
                return Err(SignalingError::ChannelError(reason))
            }
            Some(ChannelEvent::Status(ChannelStatus::TimedOut)) => {
                return Err(SignalingError::ConnectionTimeout)
            }
            Some(ChannelEvent::Status(ChannelStatus::Closed)) | None => {
                return Err(SignalingError::ChannelError(
                    "channel closed before subscription".to_string(),
                ))
            }
            Some(other) => early.push(other),
        }
    }
}

async fn discard_channel(channel: &Arc<dyn RealtimeChannel>) {
    if let Err(e) = channel.unsubscribe().await {
        tracing::warn!("Failed to discard channel: {}", e);
    }
}

fn presence_record(key: &str, metas: &[serde_json::Value]) -> PresenceRecord {
    let meta = metas
        .first()
        .and_then(|m| serde_json::from_value::<PresenceMeta>(m.clone()).ok())
        .unwrap_or_else(|| PresenceMeta {
            user_id: key.to_string(),
            user_name: None,
            timestamp: Utc::now().timestamp_millis(),
        });
    let mut record = PresenceRecord::from_meta(&meta);
    record.user_id = key.to_string();
    record
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("join_timeout", &self.join_timeout)
            .field("state", &*self.state.read())
            .finish()
    }
}
