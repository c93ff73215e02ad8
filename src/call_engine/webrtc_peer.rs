//! WebRTC Peer Connection auf Basis von webrtc-rs
//!
//! Jede Connection bekommt eine eigene API-Instanz mit Standard-Codecs und
//! Interceptors (RTCP, NACK). Remote ICE Candidates werden gehalten, bis
//! die Remote Description gesetzt ist.

use super::engine::CallEngineError;
use super::media::{LocalMediaStream, RemoteMediaStream, TrackKind};
use super::peer::{
    NegotiationState, PeerConnectionAdapter, PeerConnectionFactory, PeerEvent, PeerOptions,
    Signal, TransportStats,
};
use crate::config::IceConfig;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const AUDIO_CLOCK_RATE: u32 = 48000;
const VIDEO_CLOCK_RATE: u32 = 90000;

fn webrtc_err(e: impl std::fmt::Display) -> CallEngineError {
    CallEngineError::WebRTC(e.to_string())
}

/// ICE Server für die RTCConfiguration
pub fn rtc_ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    ice.ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erstellt echte WebRTC Peer Connections.
///
/// Die Factory kennt die lokalen Audio-Tracks aller erzeugten Connections.
/// Kodierte Opus-Frames (z.B. aus `CaptureTap::read_frame` plus Encoder)
/// gehen über `write_audio_sample` an alle Peers gleichzeitig.
#[derive(Default, Clone)]
pub struct WebRtcPeerFactory {
    audio_tracks: Arc<Mutex<Vec<Weak<TrackLocalStaticSample>>>>,
}

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schreibt ein kodiertes Audio-Sample in jeden noch lebenden Audio-Track.
    /// Gibt die Anzahl der beschriebenen Tracks zurück.
    pub async fn write_audio_sample(&self, sample: &Sample) -> usize {
        let tracks: Vec<Arc<TrackLocalStaticSample>> = {
            let mut tracks = self.audio_tracks.lock();
            tracks.retain(|t| t.strong_count() > 0);
            tracks.iter().filter_map(Weak::upgrade).collect()
        };

        let mut written = 0;
        for track in tracks {
            match track.write_sample(sample).await {
                Ok(()) => written += 1,
                Err(e) => tracing::debug!("Failed to write audio sample to {}: {}", track.id(), e),
            }
        }
        written
    }

    async fn new_peer_connection(ice: &IceConfig) -> Result<Arc<RTCPeerConnection>, CallEngineError> {
        // Media Engine mit Opus/VP8 usw.
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice),
            ice_candidate_pool_size: ice.candidate_pool_size,
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }

    /// Ein lokaler Track pro Track des geteilten Streams
    async fn add_local_tracks(
        &self,
        pc: &Arc<RTCPeerConnection>,
        stream: &LocalMediaStream,
    ) -> Result<(), CallEngineError> {
        for track in stream.tracks() {
            let codec = match track.kind() {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: AUDIO_CLOCK_RATE,
                    channels: 2,
                    ..Default::default()
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    ..Default::default()
                },
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                codec,
                track.id().to_string(),
                stream.id().to_string(),
            ));
            if track.kind() == TrackKind::Audio {
                self.audio_tracks.lock().push(Arc::downgrade(&local));
            }
            pc.add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WebRtcPeerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeerFactory")
            .field("audio_tracks", &self.audio_tracks.lock().len())
            .finish()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        options: PeerOptions,
    ) -> Result<Arc<dyn PeerConnectionAdapter>, CallEngineError> {
        let pc = Self::new_peer_connection(&options.ice).await?;
        self.add_local_tracks(&pc, &options.local_stream).await?;

        let peer = Arc::new(WebRtcPeer {
            remote_user_id: options.remote_user_id,
            pc,
            events: options.events,
            pending_candidates: Mutex::new(Vec::new()),
            has_remote_description: AtomicBool::new(false),
            loss_counters: Mutex::new(LossCounters::default()),
        });
        peer.setup_handlers();

        if options.initiator {
            let offer = peer.pc.create_offer(None).await.map_err(webrtc_err)?;
            peer.pc
                .set_local_description(offer.clone())
                .await
                .map_err(webrtc_err)?;
            peer.emit(PeerEvent::Signal(Signal::Offer(SessionDescription::offer(offer.sdp))));
        }

        Ok(peer)
    }
}

// ============================================================================
// PEER
// ============================================================================

#[derive(Debug, Default)]
struct LossCounters {
    packets_sent: u64,
    packets_lost: i64,
}

/// Eine webrtc-rs Peer Connection zu einem Remote-Teilnehmer
pub struct WebRtcPeer {
    remote_user_id: String,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    has_remote_description: AtomicBool,
    loss_counters: Mutex<LossCounters>,
}

impl WebRtcPeer {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(&self) {
        // Connection State Handler
        let events = self.events.clone();
        let remote = self.remote_user_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state ({}): {:?}", remote, s);

                let event = match s {
                    RTCPeerConnectionState::Connected => Some(PeerEvent::Connect),
                    RTCPeerConnectionState::Disconnected => Some(PeerEvent::Interrupted),
                    RTCPeerConnectionState::Failed => {
                        Some(PeerEvent::Error("ICE/DTLS transport failed".to_string()))
                    }
                    RTCPeerConnectionState::Closed => Some(PeerEvent::Close),
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = events.send(event);
                }

                Box::pin(async {})
            }));

        // ICE Candidate Handler
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            let _ = events.send(PeerEvent::Signal(Signal::Candidate(
                                from_candidate_init(init),
                            )));
                        }
                        Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        // Track Handler: Remote-Tracks pro Stream sammeln
        let events = self.events.clone();
        let streams: Arc<Mutex<HashMap<String, RemoteMediaStream>>> = Arc::default();
        self.pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            tracing::info!("Received remote {:?} track: {:?}", kind, track.codec());

            let snapshot = {
                let mut streams = streams.lock();
                let stream = streams
                    .entry(track.stream_id())
                    .or_insert_with(|| RemoteMediaStream::new(track.stream_id()));
                stream.add_track(track.id(), kind);
                stream.clone()
            };
            let _ = events.send(PeerEvent::Stream(snapshot));

            Box::pin(async {})
        }));
    }

    async fn add_candidate(&self, init: RTCIceCandidateInit) -> Result<(), CallEngineError> {
        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    /// Remote Description ist gesetzt: wartende Candidates anwenden
    async fn flush_pending_candidates(&self) {
        self.has_remote_description.store(true, Ordering::Release);
        let pending: Vec<RTCIceCandidateInit> = self.pending_candidates.lock().drain(..).collect();
        for init in pending {
            if let Err(e) = self.add_candidate(init).await {
                tracing::warn!("Queued candidate for {} rejected: {}", self.remote_user_id, e);
            }
        }
    }

    /// Verwirft das eigene offene Offer
    async fn rollback(&self) -> Result<(), CallEngineError> {
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
                .map_err(|e| CallEngineError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(webrtc_err)
    }

    async fn apply_offer(&self, offer: SessionDescription) -> Result<(), CallEngineError> {
        if self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            tracing::info!("Rolling back local offer to {}", self.remote_user_id);
            self.rollback().await?;
        }

        let offer = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| CallEngineError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(webrtc_err)?;
        self.flush_pending_candidates().await;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;

        self.emit(PeerEvent::Signal(Signal::Answer(SessionDescription::answer(answer.sdp))));
        Ok(())
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), CallEngineError> {
        let answer = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| CallEngineError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(webrtc_err)?;
        self.flush_pending_candidates().await;
        Ok(())
    }
}

#[async_trait]
impl PeerConnectionAdapter for WebRtcPeer {
    async fn signal(&self, signal: Signal) -> Result<(), CallEngineError> {
        match signal {
            Signal::Offer(offer) => self.apply_offer(offer).await,
            Signal::Answer(answer) => self.apply_answer(answer).await,
            Signal::Candidate(candidate) => {
                let init = to_candidate_init(candidate);
                if self.has_remote_description.load(Ordering::Acquire) {
                    self.add_candidate(init).await
                } else {
                    self.pending_candidates.lock().push(init);
                    Ok(())
                }
            }
        }
    }

    fn negotiation_state(&self) -> NegotiationState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                NegotiationState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                NegotiationState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => NegotiationState::Closed,
            _ => NegotiationState::Stable,
        }
    }

    async fn get_stats(&self) -> Result<TransportStats, CallEngineError> {
        let report = self.pc.get_stats().await;

        let mut rtt_ms = None;
        let mut remote_rtt_ms = None;
        let mut packets_sent: u64 = 0;
        let mut packets_lost: i64 = 0;

        for stat in report.reports.values() {
            match stat {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    rtt_ms = Some(pair.current_round_trip_time * 1000.0);
                }
                StatsReportType::OutboundRTP(rtp) => {
                    packets_sent += rtp.packets_sent as u64;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    packets_lost += remote.packets_lost as i64;
                    if let Some(rtt) = remote.round_trip_time {
                        remote_rtt_ms = Some(rtt * 1000.0);
                    }
                }
                _ => {}
            }
        }

        // Verlust im letzten Intervall, nicht seit Beginn
        let packet_loss_pct = {
            let mut counters = self.loss_counters.lock();
            let sent = packets_sent.saturating_sub(counters.packets_sent);
            let lost = packets_lost.saturating_sub(counters.packets_lost).max(0);
            counters.packets_sent = packets_sent;
            counters.packets_lost = packets_lost;
            (sent > 0).then(|| lost as f64 / (sent as f64 + lost as f64) * 100.0)
        };

        Ok(TransportStats {
            rtt_ms: rtt_ms.filter(|rtt| *rtt > 0.0).or(remote_rtt_ms),
            packet_loss_pct,
        })
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection to {}: {}", self.remote_user_id, e);
        }
    }
}
