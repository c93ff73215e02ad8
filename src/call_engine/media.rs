//! Lokale und entfernte Media-Streams
//!
//! Ein `LocalMediaStream` ist ein geteiltes Handle: alle Peer Connections
//! halten dieselbe Referenz, ein Mute wirkt daher sofort auf alle Peers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Rohe Fehler beim Zugriff auf Kamera/Mikrofon
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Access to media device not allowed: {0}")]
    NotAllowed(String),

    #[error("Media device not found: {0}")]
    NotFound(String),

    #[error("Media capture failed: {0}")]
    Other(String),
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Lokaler Audio- oder Video-Track
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn audio(label: impl Into<String>) -> Self {
        Self::new(TrackKind::Audio, label)
    }

    pub fn video(label: impl Into<String>) -> Self {
        Self::new(TrackKind::Video, label)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

// ============================================================================
// LOCAL STREAM
// ============================================================================

type StopHook = Box<dyn FnOnce() + Send>;

struct StreamInner {
    id: String,
    tracks: Vec<MediaTrack>,
    /// Gibt die Capture-Ressourcen frei (z.B. den Mikrofon-Stream)
    on_stop: Mutex<Option<StopHook>>,
}

/// Lokale Kamera-/Mikrofon-Aufnahme
#[derive(Clone)]
pub struct LocalMediaStream {
    inner: Arc<StreamInner>,
}

impl LocalMediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: uuid::Uuid::new_v4().to_string(),
                tracks,
                on_stop: Mutex::new(None),
            }),
        }
    }

    /// Registriert einen Hook, der beim ersten `stop()` läuft
    pub fn with_stop_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.inner.on_stop.lock() = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.inner.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.inner.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.audio_tracks().any(MediaTrack::is_enabled)
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_tracks().any(MediaTrack::is_enabled)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_tracks().for_each(|t| t.set_enabled(enabled));
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_tracks().for_each(|t| t.set_enabled(enabled));
    }

    /// Stoppt alle Tracks und gibt die Capture frei
    pub fn stop(&self) {
        for track in &self.inner.tracks {
            track.stop();
        }
        if let Some(hook) = self.inner.on_stop.lock().take() {
            hook();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.tracks.iter().all(MediaTrack::is_stopped)
    }

    /// Prüft, ob beide Handles denselben Stream teilen
    pub fn ptr_eq(&self, other: &LocalMediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks)
            .finish()
    }
}

// ============================================================================
// REMOTE STREAM
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Media eines entfernten Teilnehmers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteMediaStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteMediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Fügt einen Track hinzu; doppelte IDs werden ignoriert
    pub fn add_track(&mut self, id: impl Into<String>, kind: TrackKind) -> bool {
        let id = id.into();
        if self.tracks.iter().any(|t| t.id == id) {
            return false;
        }
        self.tracks.push(RemoteTrack { id, kind });
        true
    }
}

// ============================================================================
// DEVICES
// ============================================================================

/// Welche Geräte angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// Zugriff auf Kamera und Mikrofon
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError>;
}

/// Geräte ohne echte Capture (Loopback, Headless-Betrieb)
#[derive(Debug, Default, Clone)]
pub struct VirtualMediaDevices;

#[async_trait]
impl MediaDevices for VirtualMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::audio("virtual microphone"));
        }
        if constraints.video {
            tracks.push(MediaTrack::video("virtual camera"));
        }
        if tracks.is_empty() {
            return Err(MediaError::Other("no tracks requested".to_string()));
        }
        Ok(LocalMediaStream::new(tracks))
    }
}
