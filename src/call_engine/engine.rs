//! Peer Negotiation Engine
//!
//! Verwaltet eine Peer Connection pro Remote-Teilnehmer:
//! - Perfect Negotiation (Offer-Kollisionen deterministisch auflösen)
//! - ICE Candidates puffern, solange noch keine Connection existiert
//! - Verbindungsqualität periodisch aus den Stats ableiten
//! - Audio/Video des geteilten lokalen Streams schalten
//!
//! Alle Verhandlungs-Einstiegspunkte laufen nacheinander unter einem
//! gemeinsamen async Lock. Adapter-Events laufen pro Peer in einem eigenen
//! Task und werden verworfen, sobald die Connection ersetzt wurde.

use super::media::{LocalMediaStream, MediaConstraints, MediaDevices, MediaError, RemoteMediaStream};
use super::peer::{
    LexicographicTieBreaker, NegotiationState, PeerConnectionAdapter, PeerConnectionFactory,
    PeerEvent, PeerOptions, Signal, TieBreaker, TransportStats,
};
use super::quality::{self, ConnectionQuality, QualityThresholds};
use crate::config::{IceConfig, MeshConfig};
use crate::session::SessionState;
use crate::signaling::{IceCandidate, SessionDescription, SignalingError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("Permission to access camera/microphone denied: {0}")]
    PermissionDenied(String),

    #[error("No camera/microphone found: {0}")]
    DeviceNotFound(String),

    #[error("Media capture failed: {0}")]
    Media(String),

    #[error("Local media stream not initialized")]
    StreamNotInitialized,

    #[error("Local user id not set")]
    LocalUserNotSet,

    #[error("Peer connection failed: {0}")]
    PeerConnectionFailed(String),

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<MediaError> for CallEngineError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::NotAllowed(msg) => CallEngineError::PermissionDenied(msg),
            MediaError::NotFound(msg) => CallEngineError::DeviceNotFound(msg),
            MediaError::Other(msg) => CallEngineError::Media(msg),
        }
    }
}

// ============================================================================
// STATE & EVENTS
// ============================================================================

/// Zustand einer einzelnen Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Connection ist tot und darf ersetzt werden
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ParticipantJoined {
        user_id: String,
        user_name: String,
    },
    ParticipantLeft {
        user_id: String,
    },
    StreamUpdate {
        user_id: String,
        stream: RemoteMediaStream,
    },
    ParticipantUpdate {
        user_id: String,
        audio_enabled: bool,
        video_enabled: bool,
    },
    ConnectionStateChanged {
        user_id: String,
        state: ConnectionState,
    },
    ConnectionQualityChanged {
        user_id: String,
        quality: ConnectionQuality,
    },
    SessionStateChanged(SessionState),
    Error {
        user_id: Option<String>,
        message: String,
    },
}

/// Wird für jedes lokal erzeugte Signal eines Peers aufgerufen
pub type SignalCallback = Arc<dyn Fn(Signal) + Send + Sync>;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ice: IceConfig,
    pub stats_interval: Duration,
    pub thresholds: QualityThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&MeshConfig::default())
    }
}

impl From<&MeshConfig> for EngineConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            ice: config.ice.clone(),
            stats_interval: config.stats_interval(),
            thresholds: config.quality.clone(),
        }
    }
}

// ============================================================================
// PEER RECORD
// ============================================================================

struct PeerRecord {
    /// Generation; Events älterer Adapter werden daran erkannt
    epoch: u64,
    adapter: Arc<dyn PeerConnectionAdapter>,
    initiator: bool,
    state: ConnectionState,
    quality: Option<ConnectionQuality>,
    remote_stream: Option<RemoteMediaStream>,
    on_signal: SignalCallback,
    stats_task: Option<JoinHandle<()>>,
    event_task: Option<JoinHandle<()>>,
}

struct EngineInner {
    config: EngineConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    tie_breaker: Arc<dyn TieBreaker>,
    local_user_id: RwLock<Option<String>>,
    local_stream: RwLock<Option<LocalMediaStream>>,
    peers: Mutex<HashMap<String, PeerRecord>>,
    pending_candidates: Mutex<HashMap<String, Vec<IceCandidate>>>,
    negotiation: tokio::sync::Mutex<()>,
    next_epoch: AtomicU64,
    event_tx: broadcast::Sender<EngineEvent>,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Mesh Call Engine. Klone teilen denselben Zustand.
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<EngineInner>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine mit lexikographischem Tie-Break
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self::with_tie_breaker(config, factory, devices, Arc::new(LexicographicTieBreaker))
    }

    pub fn with_tie_breaker(
        config: EngineConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        tie_breaker: Arc<dyn TieBreaker>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(EngineInner {
                config,
                factory,
                devices,
                tie_breaker,
                local_user_id: RwLock::new(None),
                local_stream: RwLock::new(None),
                peers: Mutex::new(HashMap::new()),
                pending_candidates: Mutex::new(HashMap::new()),
                negotiation: tokio::sync::Mutex::new(()),
                next_epoch: AtomicU64::new(1),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Sendet ein Event an alle Subscriber
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn emit_error(&self, user_id: Option<&str>, message: impl Into<String>) {
        self.emit(EngineEvent::Error {
            user_id: user_id.map(str::to_string),
            message: message.into(),
        });
    }

    // ========================================================================
    // LOKALE IDENTITÄT & MEDIA
    // ========================================================================

    pub fn set_local_user_id(&self, user_id: impl Into<String>) {
        *self.inner.local_user_id.write() = Some(user_id.into());
    }

    pub fn local_user_id(&self) -> Option<String> {
        self.inner.local_user_id.read().clone()
    }

    /// Übernimmt einen bereits erzeugten lokalen Stream
    pub fn set_local_stream(&self, stream: LocalMediaStream) {
        tracing::debug!("Local stream set ({} tracks)", stream.tracks().len());
        *self.inner.local_stream.write() = Some(stream);
    }

    pub fn local_stream(&self) -> Option<LocalMediaStream> {
        self.inner.local_stream.read().clone()
    }

    /// Fordert Kamera/Mikrofon an und setzt den Stream als lokalen Stream
    pub async fn initialize_local_stream(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMediaStream, CallEngineError> {
        tracing::info!(
            "Requesting local media (audio: {}, video: {})",
            constraints.audio,
            constraints.video
        );

        let stream = match self.inner.devices.get_user_media(&constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Failed to acquire local media: {}", e);
                let err = CallEngineError::from(e);
                self.emit_error(None, err.to_string());
                return Err(err);
            }
        };

        let previous = self.inner.local_stream.write().replace(stream.clone());
        if let Some(previous) = previous {
            if !previous.ptr_eq(&stream) {
                previous.stop();
            }
        }

        Ok(stream)
    }

    // ========================================================================
    // ROLLEN
    // ========================================================================

    /// Höflicher Peer: die lokale ID sortiert zuerst
    pub fn is_polite(&self, remote_user_id: &str) -> Result<bool, CallEngineError> {
        let local = self.local_user_id().ok_or(CallEngineError::LocalUserNotSet)?;
        Ok(self.inner.tie_breaker.is_polite(&local, remote_user_id))
    }

    /// Ob die lokale Seite bei einem Presence-Join das Offer erstellt
    pub fn should_initiate(&self, remote_user_id: &str) -> bool {
        self.is_polite(remote_user_id).unwrap_or(false)
    }

    // ========================================================================
    // VERHANDLUNG
    // ========================================================================

    /// Startet eine Verbindung als Initiator. Existiert bereits eine lebende
    /// Connection, passiert nichts.
    pub async fn create_peer_connection(
        &self,
        user_id: &str,
        on_signal: SignalCallback,
    ) -> Result<(), CallEngineError> {
        let _guard = self.inner.negotiation.lock().await;

        if self.local_stream().is_none() {
            tracing::error!("Cannot connect to {}: local stream not initialized", user_id);
            return Err(CallEngineError::StreamNotInitialized);
        }

        let existing = self.record_state(user_id);
        match existing {
            Some(state) if !state.is_terminal() => {
                tracing::debug!("Peer connection to {} already exists ({:?})", user_id, state);
                return Ok(());
            }
            Some(_) => {
                if let Some(old) = self.take_record(user_id) {
                    self.shutdown_record(user_id, old, true).await;
                }
            }
            None => {}
        }

        tracing::info!("Creating peer connection to {} as initiator", user_id);
        let (_, adapter) = self.create_record(user_id, true, on_signal).await?;
        self.drain_pending_candidates(user_id, &adapter).await;

        Ok(())
    }

    /// Nimmt ein Offer an, ersetzt dabei eine eventuell vorhandene Connection
    pub async fn accept_peer_connection(
        &self,
        user_id: &str,
        offer: SessionDescription,
        on_signal: SignalCallback,
    ) -> Result<(), CallEngineError> {
        let _guard = self.inner.negotiation.lock().await;
        self.accept_locked(user_id, offer, on_signal).await
    }

    /// Verarbeitet ein eingehendes Offer nach den Perfect-Negotiation-Regeln
    pub async fn handle_offer(
        &self,
        from_user_id: &str,
        offer: SessionDescription,
        on_signal: SignalCallback,
    ) -> Result<(), CallEngineError> {
        let _guard = self.inner.negotiation.lock().await;

        let snapshot = {
            let peers = self.inner.peers.lock();
            peers
                .get(from_user_id)
                .map(|r| (r.state, Arc::clone(&r.adapter)))
        };

        // Wer auf ein Offer wartet, hat noch keinen Record: das ist der normale Accept
        let Some((state, adapter)) = snapshot else {
            tracing::info!("Accepting offer from {}", from_user_id);
            return self.accept_locked(from_user_id, offer, on_signal).await;
        };

        if state == ConnectionState::Connected {
            tracing::debug!("Ignoring duplicate offer from connected peer {}", from_user_id);
            return Ok(());
        }

        if state.is_terminal() {
            tracing::info!(
                "Replacing {:?} connection to {} with incoming offer",
                state,
                from_user_id
            );
            return self.accept_locked(from_user_id, offer, on_signal).await;
        }

        match adapter.negotiation_state() {
            NegotiationState::HaveLocalOffer => {
                let local = self.local_user_id().ok_or(CallEngineError::LocalUserNotSet)?;
                if self.inner.tie_breaker.is_polite(&local, from_user_id) {
                    tracing::info!(
                        "Offer collision with {}: rolling back own offer (polite)",
                        from_user_id
                    );
                    self.accept_locked(from_user_id, offer, on_signal).await
                } else {
                    tracing::info!(
                        "Offer collision with {}: ignoring incoming offer (impolite)",
                        from_user_id
                    );
                    Ok(())
                }
            }
            NegotiationState::Stable => {
                tracing::debug!("Ignoring duplicate offer from {} (stable)", from_user_id);
                Ok(())
            }
            other => {
                tracing::debug!("Ignoring offer from {} in state {:?}", from_user_id, other);
                Ok(())
            }
        }
    }

    /// Wendet ein Answer an, falls eines erwartet wird
    pub async fn handle_answer(
        &self,
        from_user_id: &str,
        answer: SessionDescription,
    ) -> Result<(), CallEngineError> {
        let _guard = self.inner.negotiation.lock().await;

        let target = {
            let peers = self.inner.peers.lock();
            peers
                .get(from_user_id)
                .map(|r| (r.state, r.epoch, Arc::clone(&r.adapter)))
        };

        let Some((state, epoch, adapter)) = target else {
            tracing::debug!("Discarding answer from {}: no connection", from_user_id);
            return Ok(());
        };
        if state == ConnectionState::Connected || state.is_terminal() {
            tracing::debug!("Discarding answer from {}: connection {:?}", from_user_id, state);
            return Ok(());
        }
        if adapter.negotiation_state() != NegotiationState::HaveLocalOffer {
            tracing::debug!("Discarding unexpected answer from {}", from_user_id);
            return Ok(());
        }

        tracing::debug!("Applying answer from {}", from_user_id);
        if let Err(e) = adapter.signal(Signal::Answer(answer)).await {
            tracing::error!("Failed to apply answer from {}: {}", from_user_id, e);
            self.mark_failed(from_user_id, epoch, e.to_string());
            return Err(CallEngineError::PeerConnectionFailed(e.to_string()));
        }

        Ok(())
    }

    /// Wendet einen ICE Candidate an oder puffert ihn, bis die Connection existiert
    pub async fn handle_ice_candidate(
        &self,
        from_user_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), CallEngineError> {
        let _guard = self.inner.negotiation.lock().await;

        let target = {
            let peers = self.inner.peers.lock();
            peers
                .get(from_user_id)
                .map(|r| (r.state, Arc::clone(&r.adapter)))
        };

        match target {
            Some((state, _)) if state.is_terminal() => {
                tracing::debug!("Discarding candidate from {}: connection {:?}", from_user_id, state);
            }
            Some((_, adapter)) => {
                if let Err(e) = adapter.signal(Signal::Candidate(candidate)).await {
                    tracing::debug!("Candidate from {} rejected: {}", from_user_id, e);
                }
            }
            None => {
                let mut pending = self.inner.pending_candidates.lock();
                let queue = pending.entry(from_user_id.to_string()).or_default();
                queue.push(candidate);
                tracing::debug!(
                    "Buffered ICE candidate from {} ({} pending)",
                    from_user_id,
                    queue.len()
                );
            }
        }

        Ok(())
    }

    /// Schließt die Connection zu einem Teilnehmer. Mehrfacher Aufruf ist ok.
    pub async fn close_peer_connection(&self, user_id: &str) {
        let _guard = self.inner.negotiation.lock().await;

        self.inner.pending_candidates.lock().remove(user_id);
        match self.take_record(user_id) {
            Some(record) => {
                self.shutdown_record(user_id, record, true).await;
                self.emit_state(user_id, ConnectionState::Closed);
            }
            None => tracing::debug!("No peer connection to {} to close", user_id),
        }
    }

    /// Stoppt alle lokalen Tracks und schließt alle Connections
    pub async fn destroy(&self) {
        let _guard = self.inner.negotiation.lock().await;

        if let Some(stream) = self.inner.local_stream.write().take() {
            stream.stop();
        }

        let records: Vec<(String, PeerRecord)> = self.inner.peers.lock().drain().collect();
        self.inner.pending_candidates.lock().clear();

        let count = records.len();
        for (user_id, record) in records {
            self.shutdown_record(&user_id, record, true).await;
            self.emit_state(&user_id, ConnectionState::Closed);
        }

        tracing::info!("Call engine destroyed ({} connections closed)", count);
    }

    // ========================================================================
    // AUDIO / VIDEO
    // ========================================================================

    /// Schaltet Audio um und gibt den neuen Zustand zurück
    pub fn toggle_audio(&self) -> Result<bool, CallEngineError> {
        let stream = self.local_stream().ok_or(CallEngineError::StreamNotInitialized)?;
        let enabled = !stream.is_audio_enabled();
        stream.set_audio_enabled(enabled);
        self.emit_local_update(&stream);
        Ok(enabled)
    }

    /// Schaltet Video um und gibt den neuen Zustand zurück
    pub fn toggle_video(&self) -> Result<bool, CallEngineError> {
        let stream = self.local_stream().ok_or(CallEngineError::StreamNotInitialized)?;
        let enabled = !stream.is_video_enabled();
        stream.set_video_enabled(enabled);
        self.emit_local_update(&stream);
        Ok(enabled)
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallEngineError> {
        let stream = self.local_stream().ok_or(CallEngineError::StreamNotInitialized)?;
        if stream.is_audio_enabled() != enabled {
            stream.set_audio_enabled(enabled);
            self.emit_local_update(&stream);
        }
        Ok(())
    }

    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), CallEngineError> {
        let stream = self.local_stream().ok_or(CallEngineError::StreamNotInitialized)?;
        if stream.is_video_enabled() != enabled {
            stream.set_video_enabled(enabled);
            self.emit_local_update(&stream);
        }
        Ok(())
    }

    fn emit_local_update(&self, stream: &LocalMediaStream) {
        let Some(user_id) = self.local_user_id() else {
            return;
        };
        self.emit(EngineEvent::ParticipantUpdate {
            user_id,
            audio_enabled: stream.is_audio_enabled(),
            video_enabled: stream.is_video_enabled(),
        });
    }

    // ========================================================================
    // ABFRAGEN
    // ========================================================================

    pub fn connection_state(&self, user_id: &str) -> Option<ConnectionState> {
        self.record_state(user_id)
    }

    pub fn connection_quality(&self, user_id: &str) -> Option<ConnectionQuality> {
        self.inner.peers.lock().get(user_id).and_then(|r| r.quality)
    }

    /// Schlechteste Qualität über alle gemessenen Connections
    pub fn overall_quality(&self) -> ConnectionQuality {
        let peers = self.inner.peers.lock();
        quality::overall(peers.values().filter_map(|r| r.quality))
    }

    pub fn remote_stream(&self, user_id: &str) -> Option<RemoteMediaStream> {
        self.inner
            .peers
            .lock()
            .get(user_id)
            .and_then(|r| r.remote_stream.clone())
    }

    pub fn remote_streams(&self) -> HashMap<String, RemoteMediaStream> {
        self.inner
            .peers
            .lock()
            .iter()
            .filter_map(|(id, r)| r.remote_stream.clone().map(|s| (id.clone(), s)))
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ob die Connection zu `user_id` von uns initiiert wurde
    pub fn is_initiator(&self, user_id: &str) -> Option<bool> {
        self.inner.peers.lock().get(user_id).map(|r| r.initiator)
    }

    pub fn pending_candidate_count(&self, user_id: &str) -> usize {
        self.inner
            .pending_candidates
            .lock()
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn record_state(&self, user_id: &str) -> Option<ConnectionState> {
        self.inner.peers.lock().get(user_id).map(|r| r.state)
    }

    /// Führt `f` auf dem Record aus, falls er noch zur Generation `epoch` gehört
    fn with_record<R>(
        &self,
        user_id: &str,
        epoch: u64,
        f: impl FnOnce(&mut PeerRecord) -> R,
    ) -> Option<R> {
        let mut peers = self.inner.peers.lock();
        peers
            .get_mut(user_id)
            .filter(|r| r.epoch == epoch)
            .map(f)
    }

    fn is_current(&self, user_id: &str, epoch: u64) -> bool {
        self.with_record(user_id, epoch, |_| ()).is_some()
    }

    fn take_record(&self, user_id: &str) -> Option<PeerRecord> {
        self.inner.peers.lock().remove(user_id)
    }

    /// Räumt einen bereits entfernten Record ab. `abort_events` ist false,
    /// wenn der Aufruf aus dem Event-Task des Records selbst kommt.
    async fn shutdown_record(&self, user_id: &str, mut record: PeerRecord, abort_events: bool) {
        if let Some(task) = record.stats_task.take() {
            task.abort();
        }
        if abort_events {
            if let Some(task) = record.event_task.take() {
                task.abort();
            }
        }
        record.adapter.close().await;
        tracing::info!("Closed peer connection to {}", user_id);
    }

    async fn create_record(
        &self,
        user_id: &str,
        initiator: bool,
        on_signal: SignalCallback,
    ) -> Result<(u64, Arc<dyn PeerConnectionAdapter>), CallEngineError> {
        let local_stream = self.local_stream().ok_or(CallEngineError::StreamNotInitialized)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let adapter = match self
            .inner
            .factory
            .create(PeerOptions {
                remote_user_id: user_id.to_string(),
                initiator,
                local_stream,
                ice: self.inner.config.ice.clone(),
                events: events_tx,
            })
            .await
        {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::error!("Failed to create peer connection to {}: {}", user_id, e);
                self.emit_error(Some(user_id), e.to_string());
                return Err(CallEngineError::PeerConnectionFailed(e.to_string()));
            }
        };

        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        self.inner.peers.lock().insert(
            user_id.to_string(),
            PeerRecord {
                epoch,
                adapter: Arc::clone(&adapter),
                initiator,
                state: ConnectionState::Connecting,
                quality: None,
                remote_stream: None,
                on_signal,
                stats_task: None,
                event_task: None,
            },
        );

        let task = tokio::spawn(self.clone().run_peer_events(
            user_id.to_string(),
            epoch,
            events_rx,
        ));
        if let Some(task) = self.with_record(user_id, epoch, |r| r.event_task.replace(task)).flatten() {
            task.abort();
        }

        self.emit_state(user_id, ConnectionState::Connecting);
        Ok((epoch, adapter))
    }

    /// Neue Connection als Nicht-Initiator; Aufrufer hält den Verhandlungs-Lock
    async fn accept_locked(
        &self,
        user_id: &str,
        offer: SessionDescription,
        on_signal: SignalCallback,
    ) -> Result<(), CallEngineError> {
        if self.local_stream().is_none() {
            tracing::error!("Cannot accept offer from {}: local stream not initialized", user_id);
            return Err(CallEngineError::StreamNotInitialized);
        }

        if let Some(old) = self.take_record(user_id) {
            self.shutdown_record(user_id, old, true).await;
        }

        let (epoch, adapter) = self.create_record(user_id, false, on_signal).await?;
        self.apply_offer(user_id, epoch, &adapter, offer).await?;
        self.drain_pending_candidates(user_id, &adapter).await;

        Ok(())
    }

    async fn apply_offer(
        &self,
        user_id: &str,
        epoch: u64,
        adapter: &Arc<dyn PeerConnectionAdapter>,
        offer: SessionDescription,
    ) -> Result<(), CallEngineError> {
        if let Err(e) = adapter.signal(Signal::Offer(offer)).await {
            tracing::error!("Failed to apply offer from {}: {}", user_id, e);
            self.mark_failed(user_id, epoch, e.to_string());
            return Err(CallEngineError::PeerConnectionFailed(e.to_string()));
        }
        Ok(())
    }

    /// Gepufferte Candidates in Ankunftsreihenfolge anwenden
    async fn drain_pending_candidates(&self, user_id: &str, adapter: &Arc<dyn PeerConnectionAdapter>) {
        let queued = self
            .inner
            .pending_candidates
            .lock()
            .remove(user_id)
            .unwrap_or_default();
        if queued.is_empty() {
            return;
        }

        tracing::debug!("Applying {} buffered candidates from {}", queued.len(), user_id);
        for candidate in queued {
            if let Err(e) = adapter.signal(Signal::Candidate(candidate)).await {
                tracing::warn!("Buffered candidate from {} rejected: {}", user_id, e);
            }
        }
    }

    fn mark_failed(&self, user_id: &str, epoch: u64, message: String) {
        if let Some(Some(task)) = self.with_record(user_id, epoch, |r| r.stats_task.take()) {
            task.abort();
        }
        self.set_connection_state(user_id, epoch, ConnectionState::Failed);
        self.emit_error(Some(user_id), message);
    }

    fn emit_state(&self, user_id: &str, state: ConnectionState) {
        self.emit(EngineEvent::ConnectionStateChanged {
            user_id: user_id.to_string(),
            state,
        });
    }

    fn set_connection_state(&self, user_id: &str, epoch: u64, state: ConnectionState) {
        let changed = self
            .with_record(user_id, epoch, |r| {
                if r.state == state {
                    false
                } else {
                    r.state = state;
                    true
                }
            })
            .unwrap_or(false);

        if changed {
            tracing::info!("Peer {} connection state: {:?}", user_id, state);
            self.emit_state(user_id, state);
        }
    }

    /// Verarbeitet die Events eines Adapters, bis er ersetzt oder geschlossen wird
    async fn run_peer_events(
        self,
        user_id: String,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.is_current(&user_id, epoch) {
                tracing::debug!("Dropping {:?} from stale connection to {}", event, user_id);
                break;
            }

            match event {
                PeerEvent::Signal(signal) => {
                    let callback = self.with_record(&user_id, epoch, |r| Arc::clone(&r.on_signal));
                    if let Some(callback) = callback {
                        tracing::trace!("Local {} for {}", signal.kind(), user_id);
                        callback(signal);
                    }
                }
                PeerEvent::Stream(stream) => {
                    let stored = self
                        .with_record(&user_id, epoch, |r| r.remote_stream = Some(stream.clone()))
                        .is_some();
                    if stored {
                        self.emit(EngineEvent::StreamUpdate {
                            user_id: user_id.clone(),
                            stream,
                        });
                    }
                }
                PeerEvent::Connect => {
                    self.set_connection_state(&user_id, epoch, ConnectionState::Connected);
                    self.start_stats_polling(&user_id, epoch);
                }
                PeerEvent::Interrupted => {
                    self.set_connection_state(&user_id, epoch, ConnectionState::Reconnecting);
                }
                PeerEvent::Close => {
                    self.finish_peer(&user_id, epoch).await;
                    break;
                }
                PeerEvent::Error(message) => {
                    tracing::error!("Peer connection to {} failed: {}", user_id, message);
                    self.mark_failed(&user_id, epoch, message);
                }
            }
        }
    }

    /// Adapter hat geschlossen: Record entfernen, falls er noch aktuell ist
    async fn finish_peer(&self, user_id: &str, epoch: u64) {
        let _guard = self.inner.negotiation.lock().await;

        let record = {
            let mut peers = self.inner.peers.lock();
            match peers.get(user_id) {
                Some(r) if r.epoch == epoch => peers.remove(user_id),
                _ => None,
            }
        };

        if let Some(record) = record {
            self.inner.pending_candidates.lock().remove(user_id);
            self.shutdown_record(user_id, record, false).await;
            self.emit_state(user_id, ConnectionState::Closed);
        }
    }

    // ========================================================================
    // QUALITÄT
    // ========================================================================

    fn start_stats_polling(&self, user_id: &str, epoch: u64) {
        let mut peers = self.inner.peers.lock();
        let Some(record) = peers.get_mut(user_id).filter(|r| r.epoch == epoch) else {
            return;
        };
        if record.stats_task.is_some() {
            return;
        }

        let engine = self.clone();
        let user_id = user_id.to_string();
        let interval = self.inner.config.stats_interval;

        record.stats_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(adapter) = engine.with_record(&user_id, epoch, |r| Arc::clone(&r.adapter))
                else {
                    break;
                };
                match adapter.get_stats().await {
                    Ok(stats) => engine.apply_stats(&user_id, epoch, stats),
                    Err(e) => tracing::debug!("Stats for {} unavailable: {}", user_id, e),
                }
            }
        }));
    }

    fn apply_stats(&self, user_id: &str, epoch: u64, stats: TransportStats) {
        let Some(rtt_ms) = stats.rtt_ms else {
            tracing::trace!("No RTT sample for {} yet", user_id);
            return;
        };
        let loss_pct = stats.packet_loss_pct.unwrap_or(0.0);
        let quality = self.inner.config.thresholds.classify(rtt_ms, loss_pct);

        let changed = self
            .with_record(user_id, epoch, |r| {
                if r.quality == Some(quality) {
                    false
                } else {
                    r.quality = Some(quality);
                    true
                }
            })
            .unwrap_or(false);

        if changed {
            tracing::debug!(
                "Connection quality to {}: {:?} (rtt {:.0} ms, loss {:.1}%)",
                user_id,
                quality,
                rtt_ms,
                loss_pct
            );
            self.emit(EngineEvent::ConnectionQualityChanged {
                user_id: user_id.to_string(),
                quality,
            });
        }
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("local_user_id", &self.local_user_id())
            .field("peers", &self.peer_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::media::MediaError;
    use crate::call_engine::testing::*;
    use std::cmp::Ordering as CmpOrdering;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.1 5000{} typ host", n, n))
    }

    #[tokio::test]
    async fn test_create_without_local_stream_fails() {
        let factory = FakePeerFactory::new();
        let engine = bare_engine("alice", factory.clone());
        let (callback, _rx) = recording_callback();

        let result = engine.create_peer_connection("bob", callback.clone()).await;
        assert!(matches!(result, Err(CallEngineError::StreamNotInitialized)));

        let result = engine
            .handle_offer("bob", SessionDescription::offer("v=0"), callback)
            .await;
        assert!(matches!(result, Err(CallEngineError::StreamNotInitialized)));

        assert!(engine.peer_ids().is_empty());
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_initiator_sends_offer_and_connects() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let mut events = engine.subscribe();
        let (callback, mut signals) = recording_callback();

        engine.create_peer_connection("bob", callback).await.unwrap();

        assert!(matches!(next_signal(&mut signals).await, Signal::Offer(_)));
        assert_eq!(engine.connection_state("bob"), Some(ConnectionState::Connecting));
        assert_eq!(engine.is_initiator("bob"), Some(true));

        factory.latest("bob").emit(PeerEvent::Connect);
        wait_until(|| engine.connection_state("bob") == Some(ConnectionState::Connected)).await;

        let states: Vec<ConnectionState> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::ConnectionStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);
    }

    #[tokio::test]
    async fn test_second_create_is_noop() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback.clone()).await.unwrap();
        engine.create_peer_connection("bob", callback).await.unwrap();

        assert_eq!(factory.created(), 1);
        assert_eq!(engine.peer_ids(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_accept_applies_offer_and_answers() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("bob", factory.clone());
        let (callback, mut signals) = recording_callback();

        engine
            .handle_offer("alice", SessionDescription::offer("offer-from-alice"), callback)
            .await
            .unwrap();

        let peer = factory.latest("alice");
        assert!(!peer.initiator);
        assert_eq!(
            peer.applied(),
            vec![Signal::Offer(SessionDescription::offer("offer-from-alice"))]
        );
        assert!(matches!(next_signal(&mut signals).await, Signal::Answer(_)));
        assert_eq!(engine.is_initiator("alice"), Some(false));
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_record_exists() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("bob", factory.clone());
        let (callback, _rx) = recording_callback();

        for n in 1..=3 {
            engine.handle_ice_candidate("alice", candidate(n)).await.unwrap();
        }
        assert_eq!(engine.pending_candidate_count("alice"), 3);
        assert!(engine.peer_ids().is_empty());

        engine
            .handle_offer("alice", SessionDescription::offer("offer"), callback)
            .await
            .unwrap();

        let peer = factory.latest("alice");
        let applied = peer.applied();
        assert!(matches!(applied[0], Signal::Offer(_)));
        assert_eq!(
            peer.applied_candidates(),
            vec![candidate(1).candidate, candidate(2).candidate, candidate(3).candidate]
        );
        assert_eq!(engine.pending_candidate_count("alice"), 0);

        // Mit bestehender Connection wird direkt angewendet
        engine.handle_ice_candidate("alice", candidate(4)).await.unwrap();
        assert_eq!(peer.applied_candidates().len(), 4);
        assert_eq!(engine.pending_candidate_count("alice"), 0);
    }

    #[tokio::test]
    async fn test_buffered_candidates_drained_for_initiator() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();

        engine.handle_ice_candidate("bob", candidate(1)).await.unwrap();
        engine.create_peer_connection("bob", callback).await.unwrap();

        assert_eq!(factory.latest("bob").applied_candidates(), vec![candidate(1).candidate]);
        assert_eq!(engine.pending_candidate_count("bob"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_offer_ignored_when_stable() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("bob", factory.clone());
        let (callback, _rx) = recording_callback();

        engine
            .handle_offer("alice", SessionDescription::offer("first"), callback.clone())
            .await
            .unwrap();
        engine
            .handle_offer("alice", SessionDescription::offer("second"), callback)
            .await
            .unwrap();

        assert_eq!(factory.created(), 1);
        assert_eq!(factory.latest("alice").applied().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_offer_ignored_when_connected() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback.clone()).await.unwrap();
        factory.latest("bob").emit(PeerEvent::Connect);
        wait_until(|| engine.connection_state("bob") == Some(ConnectionState::Connected)).await;

        engine
            .handle_offer("bob", SessionDescription::offer("late"), callback)
            .await
            .unwrap();

        assert_eq!(factory.created(), 1);
        assert!(factory.latest("bob").applied().is_empty());
        assert_eq!(engine.connection_state("bob"), Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_late_answer_ignored_when_connected() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let mut events = engine.subscribe();
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback).await.unwrap();
        factory.latest("bob").emit(PeerEvent::Connect);
        wait_until(|| engine.connection_state("bob") == Some(ConnectionState::Connected)).await;
        drain(&mut events);

        engine
            .handle_answer("bob", SessionDescription::answer("late"))
            .await
            .unwrap();

        assert_eq!(factory.created(), 1);
        assert!(factory.latest("bob").applied().is_empty());
        assert_eq!(engine.connection_state("bob"), Some(ConnectionState::Connected));
        assert_eq!(engine.peer_ids(), vec!["bob".to_string()]);
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, EngineEvent::ConnectionStateChanged { .. })));
    }

    #[tokio::test]
    async fn test_collision_polite_side_rolls_back() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, mut signals) = recording_callback();

        engine.create_peer_connection("bob", callback.clone()).await.unwrap();
        assert!(matches!(next_signal(&mut signals).await, Signal::Offer(_)));

        engine
            .handle_offer("bob", SessionDescription::offer("offer-from-bob"), callback)
            .await
            .unwrap();

        let peers = factory.peers_for("bob");
        assert_eq!(peers.len(), 2);
        assert!(peers[0].is_closed());
        assert!(!peers[1].initiator);
        assert_eq!(engine.is_initiator("bob"), Some(false));
        assert_eq!(engine.peer_ids().len(), 1);
        assert!(matches!(next_signal(&mut signals).await, Signal::Answer(_)));
    }

    #[tokio::test]
    async fn test_collision_impolite_side_ignores_offer() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("bob", factory.clone());
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("alice", callback.clone()).await.unwrap();
        engine
            .handle_offer("alice", SessionDescription::offer("offer-from-alice"), callback)
            .await
            .unwrap();

        assert_eq!(factory.created(), 1);
        let peer = factory.latest("alice");
        assert!(!peer.is_closed());
        assert!(peer.applied().is_empty());
        assert_eq!(engine.is_initiator("alice"), Some(true));
    }

    #[tokio::test]
    async fn test_injected_tie_breaker_flips_roles() {
        let factory = FakePeerFactory::new();
        let engine = CallEngine::with_tie_breaker(
            test_config(),
            factory.clone(),
            Arc::new(crate::call_engine::VirtualMediaDevices),
            Arc::new(|a: &str, b: &str| -> CmpOrdering { b.cmp(a) }),
        );
        engine.set_local_user_id("bob");
        engine.set_local_stream(crate::call_engine::LocalMediaStream::new(vec![
            crate::call_engine::MediaTrack::audio("mic"),
        ]));
        let (callback, _rx) = recording_callback();

        assert!(engine.should_initiate("alice"));
        engine.create_peer_connection("alice", callback.clone()).await.unwrap();
        engine
            .handle_offer("alice", SessionDescription::offer("offer-from-alice"), callback)
            .await
            .unwrap();

        assert_eq!(engine.is_initiator("alice"), Some(false));
    }

    /// Zwei Engines, deren Signale über Kanäle zugestellt werden
    async fn deliver(engine: &CallEngine, from: &str, signal: Signal, callback: SignalCallback) {
        match signal {
            Signal::Offer(sdp) => engine.handle_offer(from, sdp, callback).await.unwrap(),
            Signal::Answer(sdp) => engine.handle_answer(from, sdp).await.unwrap(),
            Signal::Candidate(c) => engine.handle_ice_candidate(from, c).await.unwrap(),
        }
    }

    async fn pump(
        engine: &CallEngine,
        from: &str,
        rx: &mut mpsc::UnboundedReceiver<Signal>,
        callback: &SignalCallback,
    ) -> usize {
        let mut delivered = 0;
        while let Ok(signal) = rx.try_recv() {
            deliver(engine, from, signal, callback.clone()).await;
            delivered += 1;
        }
        delivered
    }

    #[tokio::test]
    async fn test_simultaneous_initiate_converges_to_one_connection() {
        let alice_factory = FakePeerFactory::new();
        let bob_factory = FakePeerFactory::new();
        let alice = engine_for("alice", alice_factory.clone());
        let bob = engine_for("bob", bob_factory.clone());
        let (alice_cb, mut alice_out) = recording_callback();
        let (bob_cb, mut bob_out) = recording_callback();

        alice.create_peer_connection("bob", alice_cb.clone()).await.unwrap();
        bob.create_peer_connection("alice", bob_cb.clone()).await.unwrap();

        let alice_offer = next_signal(&mut alice_out).await;
        let bob_offer = next_signal(&mut bob_out).await;

        // Offers kreuzen sich
        deliver(&alice, "bob", bob_offer, alice_cb.clone()).await;
        deliver(&bob, "alice", alice_offer, bob_cb.clone()).await;

        // Alice (höflich) antwortet, Bob wendet das Answer an
        let answer = next_signal(&mut alice_out).await;
        assert!(matches!(answer, Signal::Answer(_)));
        deliver(&bob, "alice", answer, bob_cb.clone()).await;
        pump(&bob, "alice", &mut alice_out, &bob_cb).await;
        pump(&alice, "bob", &mut bob_out, &alice_cb).await;

        assert_eq!(alice.peer_ids(), vec!["bob".to_string()]);
        assert_eq!(bob.peer_ids(), vec!["alice".to_string()]);
        assert_eq!(alice.is_initiator("bob"), Some(false));
        assert_eq!(bob.is_initiator("alice"), Some(true));

        let bob_peer = bob_factory.latest("alice");
        assert_eq!(bob_peer.negotiation_state(), NegotiationState::Stable);
        assert_eq!(bob_factory.created(), 1);

        alice_factory.latest("bob").emit(PeerEvent::Connect);
        bob_peer.emit(PeerEvent::Connect);
        wait_until(|| {
            alice.connection_state("bob") == Some(ConnectionState::Connected)
                && bob.connection_state("alice") == Some(ConnectionState::Connected)
        })
        .await;
    }

    #[tokio::test]
    async fn test_answer_discarded_without_expectation() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("bob", factory.clone());
        let (callback, _rx) = recording_callback();

        // Kein Record
        engine
            .handle_answer("alice", SessionDescription::answer("stray"))
            .await
            .unwrap();
        assert!(engine.peer_ids().is_empty());

        // Record ist stabil, erwartet kein Answer
        engine
            .handle_offer("alice", SessionDescription::offer("offer"), callback)
            .await
            .unwrap();
        engine
            .handle_answer("alice", SessionDescription::answer("stray"))
            .await
            .unwrap();
        assert_eq!(factory.latest("alice").applied().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_adapter_events_are_dropped() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback.clone()).await.unwrap();
        engine
            .handle_offer("bob", SessionDescription::offer("offer-from-bob"), callback)
            .await
            .unwrap();

        let old = &factory.peers_for("bob")[0];
        old.emit(PeerEvent::Connect);
        old.emit(PeerEvent::Close);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(engine.connection_state("bob"), Some(ConnectionState::Connecting));
        assert_eq!(engine.peer_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_toggles_act_on_shared_stream() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();
        engine.create_peer_connection("bob", callback.clone()).await.unwrap();
        engine.create_peer_connection("carol", callback).await.unwrap();

        assert_eq!(engine.toggle_audio().unwrap(), false);
        assert!(!factory.latest("bob").local_stream.is_audio_enabled());
        assert!(!factory.latest("carol").local_stream.is_audio_enabled());
        assert!(factory.latest("carol").local_stream.is_video_enabled());

        assert_eq!(engine.toggle_audio().unwrap(), true);
        assert!(factory.latest("bob").local_stream.is_audio_enabled());

        assert_eq!(engine.toggle_video().unwrap(), false);
        assert_eq!(engine.toggle_video().unwrap(), true);
    }

    #[tokio::test]
    async fn test_set_enabled_is_idempotent() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory);
        let mut events = engine.subscribe();

        engine.set_audio_enabled(false).unwrap();
        engine.set_audio_enabled(false).unwrap();
        assert!(!engine.local_stream().unwrap().is_audio_enabled());

        let updates = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::ParticipantUpdate { .. }))
            .count();
        assert_eq!(updates, 1);
    }

    #[tokio::test]
    async fn test_toggle_without_stream_fails() {
        let engine = bare_engine("alice", FakePeerFactory::new());
        assert!(matches!(engine.toggle_audio(), Err(CallEngineError::StreamNotInitialized)));
        assert!(matches!(
            engine.set_video_enabled(true),
            Err(CallEngineError::StreamNotInitialized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_events_only_on_transition() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let mut events = engine.subscribe();
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback).await.unwrap();
        let peer = factory.latest("bob");
        peer.set_stats(Some(50.0), Some(0.5));
        peer.emit(PeerEvent::Connect);
        wait_until(|| engine.connection_state("bob") == Some(ConnectionState::Connected)).await;

        tokio::time::sleep(STATS_INTERVAL + Duration::from_millis(500)).await;
        assert_eq!(engine.connection_quality("bob"), Some(ConnectionQuality::Excellent));

        // Gleiche Messung: kein neues Event
        tokio::time::sleep(STATS_INTERVAL).await;

        peer.set_stats(Some(200.0), Some(3.0));
        tokio::time::sleep(STATS_INTERVAL).await;
        assert_eq!(engine.connection_quality("bob"), Some(ConnectionQuality::Good));

        peer.set_stats(Some(500.0), Some(10.0));
        tokio::time::sleep(STATS_INTERVAL).await;
        assert_eq!(engine.connection_quality("bob"), Some(ConnectionQuality::Poor));

        let qualities: Vec<ConnectionQuality> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::ConnectionQualityChanged { quality, .. } => Some(quality),
                _ => None,
            })
            .collect();
        assert_eq!(
            qualities,
            vec![
                ConnectionQuality::Excellent,
                ConnectionQuality::Good,
                ConnectionQuality::Poor
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_rtt_sample_is_skipped() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback).await.unwrap();
        let peer = factory.latest("bob");
        peer.set_stats(None, Some(0.0));
        peer.emit(PeerEvent::Connect);
        wait_until(|| engine.connection_state("bob") == Some(ConnectionState::Connected)).await;

        tokio::time::sleep(STATS_INTERVAL * 3).await;
        assert_eq!(engine.connection_quality("bob"), None);
        assert_eq!(engine.overall_quality(), ConnectionQuality::Excellent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_quality_is_worst_peer() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();

        for (user, rtt) in [("bob", 50.0), ("carol", 250.0)] {
            engine.create_peer_connection(user, callback.clone()).await.unwrap();
            let peer = factory.latest(user);
            peer.set_stats(Some(rtt), Some(0.0));
            peer.emit(PeerEvent::Connect);
        }
        wait_until(|| {
            engine.connection_state("bob") == Some(ConnectionState::Connected)
                && engine.connection_state("carol") == Some(ConnectionState::Connected)
        })
        .await;

        tokio::time::sleep(STATS_INTERVAL + Duration::from_millis(500)).await;
        assert_eq!(engine.overall_quality(), ConnectionQuality::Good);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let mut events = engine.subscribe();
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback).await.unwrap();
        engine.close_peer_connection("bob").await;
        engine.close_peer_connection("bob").await;

        assert!(factory.latest("bob").is_closed());
        assert!(engine.peer_ids().is_empty());
        let closed = drain(&mut events)
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    EngineEvent::ConnectionStateChanged { state: ConnectionState::Closed, .. }
                )
            })
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_close_drops_buffered_candidates() {
        let engine = engine_for("alice", FakePeerFactory::new());
        engine.handle_ice_candidate("bob", candidate(1)).await.unwrap();
        engine.close_peer_connection("bob").await;
        assert_eq!(engine.pending_candidate_count("bob"), 0);
    }

    #[tokio::test]
    async fn test_adapter_close_removes_record() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback).await.unwrap();
        factory.latest("bob").emit(PeerEvent::Close);

        wait_until(|| engine.peer_ids().is_empty()).await;
        assert!(factory.latest("bob").is_closed());
    }

    #[tokio::test]
    async fn test_adapter_error_fails_only_that_peer() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let mut events = engine.subscribe();
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback.clone()).await.unwrap();
        engine.create_peer_connection("carol", callback.clone()).await.unwrap();
        factory.latest("bob").emit(PeerEvent::Error("ice failed".to_string()));

        wait_until(|| engine.connection_state("bob") == Some(ConnectionState::Failed)).await;
        assert_eq!(engine.connection_state("carol"), Some(ConnectionState::Connecting));
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            EngineEvent::Error { user_id: Some(id), .. } if id == "bob"
        )));

        // Ein neues Offer ersetzt die fehlgeschlagene Connection
        engine
            .handle_offer("bob", SessionDescription::offer("retry"), callback)
            .await
            .unwrap();
        assert_eq!(engine.connection_state("bob"), Some(ConnectionState::Connecting));
        assert_eq!(factory.peers_for("bob").len(), 2);
    }

    #[tokio::test]
    async fn test_factory_failure_surfaces_error() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();

        factory.fail_next();
        let result = engine.create_peer_connection("bob", callback).await;

        assert!(matches!(result, Err(CallEngineError::PeerConnectionFailed(_))));
        assert!(engine.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_remote_stream_is_surfaced() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let mut events = engine.subscribe();
        let (callback, _rx) = recording_callback();

        engine.create_peer_connection("bob", callback).await.unwrap();
        let mut stream = RemoteMediaStream::new("bob-stream");
        stream.add_track("a1", crate::call_engine::TrackKind::Audio);
        factory.latest("bob").emit(PeerEvent::Stream(stream.clone()));

        wait_until(|| engine.remote_stream("bob").is_some()).await;
        assert_eq!(engine.remote_streams().get("bob"), Some(&stream));
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, EngineEvent::StreamUpdate { user_id, .. } if user_id == "bob")));
    }

    #[tokio::test]
    async fn test_destroy_releases_everything() {
        let factory = FakePeerFactory::new();
        let engine = engine_for("alice", factory.clone());
        let (callback, _rx) = recording_callback();
        let stream = engine.local_stream().unwrap();

        engine.create_peer_connection("bob", callback.clone()).await.unwrap();
        engine.create_peer_connection("carol", callback).await.unwrap();
        engine.handle_ice_candidate("dave", candidate(1)).await.unwrap();

        engine.destroy().await;
        engine.destroy().await;

        assert!(stream.is_stopped());
        assert!(engine.local_stream().is_none());
        assert!(engine.peer_ids().is_empty());
        assert_eq!(engine.pending_candidate_count("dave"), 0);
        assert!(factory.latest("bob").is_closed());
        assert!(factory.latest("carol").is_closed());
    }

    #[tokio::test]
    async fn test_destroy_on_empty_engine() {
        let engine = bare_engine("alice", FakePeerFactory::new());
        engine.destroy().await;
        assert!(engine.peer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_local_stream_classifies_errors() {
        let denied = CallEngine::new(
            test_config(),
            FakePeerFactory::new(),
            Arc::new(FailingDevices(MediaError::NotAllowed("user dismissed".into()))),
        );
        assert!(matches!(
            denied.initialize_local_stream(MediaConstraints::default()).await,
            Err(CallEngineError::PermissionDenied(_))
        ));

        let missing = CallEngine::new(
            test_config(),
            FakePeerFactory::new(),
            Arc::new(FailingDevices(MediaError::NotFound("no camera".into()))),
        );
        assert!(matches!(
            missing.initialize_local_stream(MediaConstraints::default()).await,
            Err(CallEngineError::DeviceNotFound(_))
        ));
        assert!(missing.local_stream().is_none());
    }

    #[tokio::test]
    async fn test_initialize_local_stream_replaces_previous() {
        let engine = engine_for("alice", FakePeerFactory::new());
        let previous = engine.local_stream().unwrap();

        let stream = engine
            .initialize_local_stream(MediaConstraints::audio_only())
            .await
            .unwrap();

        assert!(previous.is_stopped());
        assert!(engine.local_stream().unwrap().ptr_eq(&stream));
    }
}
