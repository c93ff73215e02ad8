//! Meeting Session - verbindet Signaling und CallEngine
//!
//! Presence steuert den Aufbau: bei einem neuen Teilnehmer initiiert nur
//! die Seite, deren ID zuerst sortiert. Offer/Answer/ICE aus dem Channel
//! gehen direkt in die Engine, lokale Signale der Engine zurück in den
//! Channel, adressiert an genau einen Teilnehmer. Geht der Channel
//! verloren, wird über den Circuit Breaker neu verbunden; bestehende Peer
//! Connections bleiben dabei erhalten. Wer während des Ausfalls gegangen
//! ist, wird nach einer Schonfrist über den Presence-Abgleich geschlossen.

use crate::call_engine::{
    CallEngine, CallEngineError, EngineConfig, EngineEvent, MediaDevices, PeerConnectionFactory,
    Signal, SignalCallback,
};
use crate::config::MeshConfig;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::signaling::{
    PresenceRecord, RealtimeBackend, SignalingClient, SignalingError, SignalingEvent,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Zustand der Meeting-Teilnahme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Joining,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone)]
struct Identity {
    meeting_id: String,
    user_id: String,
    user_name: String,
}

struct SessionInner {
    engine: CallEngine,
    signaling: Arc<SignalingClient>,
    breaker: Arc<CircuitBreaker>,
    breaker_config: CircuitBreakerConfig,
    presence_grace: Duration,
    state: RwLock<SessionState>,
    identity: RwLock<Option<Identity>>,
    /// Beitrittszeit je Teilnehmer, unterscheidet Reconnect von neuer Teilnahme
    remote_sessions: Mutex<HashMap<String, i64>>,
    /// Serialisiert Presence-Events und den Abgleich nach einem Reconnect
    presence: tokio::sync::Mutex<()>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    presence_sync: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Teilnahme an genau einem Meeting
#[derive(Clone)]
pub struct MeetingSession {
    inner: Arc<SessionInner>,
}

impl MeetingSession {
    pub fn new(config: &MeshConfig, engine: CallEngine, signaling: Arc<SignalingClient>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                engine,
                signaling,
                breaker: Arc::new(CircuitBreaker::new(
                    "signaling",
                    config.circuit_breaker.clone(),
                )),
                breaker_config: config.circuit_breaker.clone(),
                presence_grace: config.signaling.presence_grace(),
                state: RwLock::new(SessionState::Idle),
                identity: RwLock::new(None),
                remote_sessions: Mutex::new(HashMap::new()),
                presence: tokio::sync::Mutex::new(()),
                event_task: Mutex::new(None),
                presence_sync: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Baut Engine und Signaling Client aus der Konfiguration
    pub fn with_backend(
        config: &MeshConfig,
        backend: Arc<dyn RealtimeBackend>,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let engine = CallEngine::new(EngineConfig::from(config), factory, devices);
        let signaling = Arc::new(SignalingClient::new(backend, config.signaling.join_timeout()));
        Self::new(config, engine, signaling)
    }

    pub fn engine(&self) -> &CallEngine {
        &self.inner.engine
    }

    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.inner.signaling
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Andere Teilnehmer laut Presence
    pub fn participants(&self) -> Vec<PresenceRecord> {
        self.inner.signaling.participants()
    }

    /// Tritt dem Meeting bei. Der lokale Stream muss bereits gesetzt sein.
    pub async fn join(
        &self,
        meeting_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<(), CallEngineError> {
        let _guard = self.inner.lifecycle.lock().await;

        match self.state() {
            SessionState::Idle | SessionState::Disconnected => {}
            state => {
                tracing::warn!("join() ignored, session is {:?}", state);
                return Ok(());
            }
        }

        if self.inner.engine.local_stream().is_none() {
            return Err(CallEngineError::StreamNotInitialized);
        }

        self.inner.engine.set_local_user_id(user_id);
        self.inner.remote_sessions.lock().clear();
        *self.inner.identity.write() = Some(Identity {
            meeting_id: meeting_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
        });
        self.inner.set_state(SessionState::Joining);

        // Vor dem Connect abonnieren, sonst geht die Presence-Nachlieferung verloren
        let events = self.inner.signaling.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(run_session_events(weak, events));
        if let Some(old) = self.inner.event_task.lock().replace(task) {
            old.abort();
        }

        match self.inner.connect_signaling().await {
            Ok(()) => {
                self.inner.set_state(SessionState::Connected);
                tracing::info!("Joined meeting {} as {}", meeting_id, user_id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to join meeting {}: {}", meeting_id, e);
                if let Some(task) = self.inner.event_task.lock().take() {
                    task.abort();
                }
                self.inner.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Verlässt das Meeting: Peers schließen, Channel verlassen
    pub async fn leave(&self) {
        let _guard = self.inner.lifecycle.lock().await;

        if let Some(task) = self.inner.event_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.presence_sync.lock().take() {
            task.abort();
        }
        self.inner.remote_sessions.lock().clear();

        self.inner.engine.destroy().await;
        self.inner.signaling.disconnect().await;

        if self.state() != SessionState::Idle {
            self.inner.set_state(SessionState::Disconnected);
        }
        tracing::info!("Left meeting");
    }
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        let changed = {
            let mut current = self.state.write();
            std::mem::replace(&mut *current, state) != state
        };
        if changed {
            tracing::debug!("Session state: {:?}", state);
            self.engine.emit(EngineEvent::SessionStateChanged(state));
        }
    }

    async fn connect_signaling(&self) -> Result<(), CallEngineError> {
        let identity = self
            .identity
            .read()
            .clone()
            .ok_or(CallEngineError::LocalUserNotSet)?;
        let signaling = Arc::clone(&self.signaling);

        self.breaker
            .call(|| {
                let signaling = Arc::clone(&signaling);
                let identity = identity.clone();
                async move {
                    signaling
                        .connect(&identity.meeting_id, &identity.user_id, &identity.user_name)
                        .await
                }
            })
            .await
            .map_err(|e| match e {
                CircuitBreakerError::ServiceUnavailable(msg) => {
                    CallEngineError::ServiceUnavailable(msg)
                }
                CircuitBreakerError::Operation(e) => CallEngineError::Signaling(e),
            })
    }

    /// Verbindet neu, bis es klappt oder die Session beendet wird
    async fn reconnect(self: &Arc<Self>) {
        self.set_state(SessionState::Reconnecting);

        loop {
            match self.connect_signaling().await {
                Ok(()) => {
                    tracing::info!("Reconnected to signaling channel");
                    self.set_state(SessionState::Connected);
                    self.schedule_presence_sync();
                    return;
                }
                Err(CallEngineError::ServiceUnavailable(msg)) => {
                    tracing::warn!("Reconnect postponed: {}", msg);
                    tokio::time::sleep(self.breaker_config.reset_timeout()).await;
                }
                Err(e) => {
                    tracing::warn!("Reconnect failed: {}", e);
                    self.engine.emit(EngineEvent::Error {
                        user_id: None,
                        message: e.to_string(),
                    });
                    tokio::time::sleep(self.breaker_config.backoff_delay(0)).await;
                }
            }
        }
    }

    /// Gleicht die Peers nach der Schonfrist mit der Presence ab. Die Presence
    /// anderer Teilnehmer braucht nach einem gemeinsamen Ausfall etwas, bis
    /// sie wieder vollständig ist.
    fn schedule_presence_sync(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let grace = self.presence_grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = session.upgrade() {
                inner.sync_peers_with_presence().await;
            }
        });
        if let Some(old) = self.presence_sync.lock().replace(task) {
            old.abort();
        }
    }

    /// Schließt Peers, deren Teilnehmer nicht mehr in der Presence steht
    async fn sync_peers_with_presence(&self) {
        let _presence = self.presence.lock().await;

        // Erneut getrennt: der nächste Reconnect gleicht ab
        if !self.signaling.is_connected() {
            return;
        }

        let present: HashSet<String> = self
            .signaling
            .participants()
            .into_iter()
            .map(|p| p.user_id)
            .collect();

        for user_id in self.engine.peer_ids() {
            if present.contains(&user_id) {
                continue;
            }
            tracing::info!("{} left while signaling was down, closing peer connection", user_id);
            self.remote_sessions.lock().remove(&user_id);
            self.engine.close_peer_connection(&user_id).await;
            self.engine.emit(EngineEvent::ParticipantLeft { user_id });
        }
    }

    fn signal_callback(&self, remote_user_id: &str) -> SignalCallback {
        let signaling = Arc::clone(&self.signaling);
        let remote = remote_user_id.to_string();

        Arc::new(move |signal: Signal| {
            let kind = signal.kind();
            let result = match signal {
                Signal::Offer(sdp) => signaling.send_offer(sdp, Some(&remote)),
                Signal::Answer(sdp) => signaling.send_answer(sdp, Some(&remote)),
                Signal::Candidate(candidate) => signaling.send_ice_candidate(candidate, Some(&remote)),
            };
            if let Err(e) = result {
                tracing::warn!("Failed to send {} to {}: {}", kind, remote, e);
            }
        })
    }

    async fn handle_event(self: &Arc<Self>, event: SignalingEvent) {
        let engine = &self.engine;

        match event {
            SignalingEvent::Connected { meeting_id } => {
                tracing::debug!("Signaling connected to {}", meeting_id);
            }

            SignalingEvent::Disconnected => {
                tracing::debug!("Signaling disconnected");
            }

            SignalingEvent::ParticipantJoined(record) => {
                let _presence = self.presence.lock().await;
                engine.emit(EngineEvent::ParticipantJoined {
                    user_id: record.user_id.clone(),
                    user_name: record.user_name.clone(),
                });

                // Neue Beitrittszeit heißt neue Teilnahme: die alte Connection
                // wartet sonst ewig auf eine Gegenseite, die es nicht mehr gibt
                let previous = self
                    .remote_sessions
                    .lock()
                    .insert(record.user_id.clone(), record.joined_at);
                let rejoined = matches!(previous, Some(joined_at) if joined_at != record.joined_at);
                if rejoined && engine.connection_state(&record.user_id).is_some() {
                    tracing::info!("{} rejoined, replacing stale peer connection", record.user_id);
                    engine.close_peer_connection(&record.user_id).await;
                }

                if engine.should_initiate(&record.user_id) {
                    let callback = self.signal_callback(&record.user_id);
                    if let Err(e) = engine.create_peer_connection(&record.user_id, callback).await {
                        tracing::error!("Failed to connect to {}: {}", record.user_id, e);
                        engine.emit(EngineEvent::Error {
                            user_id: Some(record.user_id),
                            message: e.to_string(),
                        });
                    }
                } else {
                    tracing::debug!("Waiting for offer from {}", record.user_id);
                }
            }

            SignalingEvent::ParticipantLeft { user_id } => {
                let _presence = self.presence.lock().await;
                self.remote_sessions.lock().remove(&user_id);
                engine.close_peer_connection(&user_id).await;
                engine.emit(EngineEvent::ParticipantLeft { user_id });
            }

            SignalingEvent::Offer {
                from_user_id, sdp, ..
            } => {
                let callback = self.signal_callback(&from_user_id);
                if let Err(e) = engine.handle_offer(&from_user_id, sdp, callback).await {
                    tracing::error!("Failed to handle offer from {}: {}", from_user_id, e);
                    engine.emit(EngineEvent::Error {
                        user_id: Some(from_user_id),
                        message: e.to_string(),
                    });
                }
            }

            SignalingEvent::Answer {
                from_user_id, sdp, ..
            } => {
                if let Err(e) = engine.handle_answer(&from_user_id, sdp).await {
                    tracing::error!("Failed to handle answer from {}: {}", from_user_id, e);
                }
            }

            SignalingEvent::IceCandidate {
                from_user_id,
                candidate,
                ..
            } => {
                if let Err(e) = engine.handle_ice_candidate(&from_user_id, candidate).await {
                    tracing::debug!("Failed to add ICE candidate from {}: {}", from_user_id, e);
                }
            }

            SignalingEvent::ConnectionLost { reason } => {
                tracing::warn!("Signaling connection lost ({}), reconnecting", reason);
                self.reconnect().await;
            }

            SignalingEvent::Error(e) => {
                report_signaling_error(engine, e);
            }
        }
    }
}

fn report_signaling_error(engine: &CallEngine, error: SignalingError) {
    tracing::warn!("Signaling error: {}", error);
    engine.emit(EngineEvent::Error {
        user_id: None,
        message: error.to_string(),
    });
}

async fn run_session_events(
    session: Weak<SessionInner>,
    mut events: tokio::sync::broadcast::Receiver<SignalingEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("Session event loop lagged, {} signaling events dropped", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
}

impl std::fmt::Debug for MeetingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeetingSession")
            .field("state", &self.state())
            .field("identity", &*self.inner.identity.read())
            .field("breaker", &self.inner.breaker)
            .finish()
    }
}
