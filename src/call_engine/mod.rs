//! Call Engine Module - Mesh aus WebRTC Peer Connections
//!
//! Dieses Modul verwaltet:
//! - Eine Peer Connection pro Remote-Teilnehmer (Perfect Negotiation)
//! - Lokale Media (Audio/Video Tracks, optional natives Mikrofon)
//! - Verbindungsqualität aus Transport-Statistiken

#[cfg(feature = "native-audio")]
mod audio;
mod engine;
mod media;
mod peer;
mod quality;
mod webrtc_peer;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "native-audio")]
pub use audio::{AudioError, CaptureTap, NativeMediaDevices, FRAME_SIZE, SAMPLE_RATE};
pub use engine::{
    CallEngine, CallEngineError, ConnectionState, EngineConfig, EngineEvent, SignalCallback,
};
pub use media::{
    LocalMediaStream, MediaConstraints, MediaDevices, MediaError, MediaTrack, RemoteMediaStream,
    RemoteTrack, TrackKind, VirtualMediaDevices,
};
pub use peer::{
    LexicographicTieBreaker, NegotiationState, PeerConnectionAdapter, PeerConnectionFactory,
    PeerEvent, PeerOptions, Signal, TieBreaker, TransportStats,
};
pub use quality::{overall as overall_quality, ConnectionQuality, QualityThresholds};
pub use webrtc_peer::{rtc_ice_servers, WebRtcPeer, WebRtcPeerFactory};
