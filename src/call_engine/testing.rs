//! Test-Doubles für Adapter, Factory und Geräte

use super::engine::{CallEngine, CallEngineError, EngineConfig, SignalCallback};
use super::media::{
    LocalMediaStream, MediaConstraints, MediaDevices, MediaError, MediaTrack, VirtualMediaDevices,
};
use super::peer::{
    NegotiationState, PeerConnectionAdapter, PeerConnectionFactory, PeerEvent, PeerOptions,
    Signal, TransportStats,
};
use crate::config::IceConfig;
use crate::signaling::SessionDescription;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Adapter ohne Netzwerk: merkt sich angewendete Signale
pub(crate) struct FakePeer {
    pub remote_user_id: String,
    pub initiator: bool,
    pub local_stream: LocalMediaStream,
    state: Mutex<NegotiationState>,
    applied: Mutex<Vec<Signal>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    stats: Mutex<TransportStats>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn applied(&self) -> Vec<Signal> {
        self.applied.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .filter_map(|s| match s {
                Signal::Candidate(c) => Some(c.candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_stats(&self, rtt_ms: Option<f64>, packet_loss_pct: Option<f64>) {
        *self.stats.lock() = TransportStats {
            rtt_ms,
            packet_loss_pct,
        };
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnectionAdapter for FakePeer {
    async fn signal(&self, signal: Signal) -> Result<(), CallEngineError> {
        if self.is_closed() {
            return Err(CallEngineError::WebRTC("connection closed".to_string()));
        }
        self.applied.lock().push(signal.clone());

        match signal {
            Signal::Offer(_) => {
                *self.state.lock() = NegotiationState::Stable;
                self.emit(PeerEvent::Signal(Signal::Answer(SessionDescription::answer(
                    format!("answer-to-{}", self.remote_user_id),
                ))));
            }
            Signal::Answer(_) => *self.state.lock() = NegotiationState::Stable,
            Signal::Candidate(_) => {}
        }
        Ok(())
    }

    fn negotiation_state(&self) -> NegotiationState {
        *self.state.lock()
    }

    async fn get_stats(&self) -> Result<TransportStats, CallEngineError> {
        Ok(*self.stats.lock())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = NegotiationState::Closed;
    }
}

#[derive(Default)]
pub(crate) struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail_next: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peers_for(&self, user_id: &str) -> Vec<Arc<FakePeer>> {
        self.peers
            .lock()
            .iter()
            .filter(|p| p.remote_user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn latest(&self, user_id: &str) -> Arc<FakePeer> {
        self.peers_for(user_id)
            .pop()
            .unwrap_or_else(|| panic!("no fake peer for {}", user_id))
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        options: PeerOptions,
    ) -> Result<Arc<dyn PeerConnectionAdapter>, CallEngineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CallEngineError::WebRTC("factory failure".to_string()));
        }

        let state = if options.initiator {
            NegotiationState::HaveLocalOffer
        } else {
            NegotiationState::Stable
        };
        let peer = Arc::new(FakePeer {
            remote_user_id: options.remote_user_id.clone(),
            initiator: options.initiator,
            local_stream: options.local_stream,
            state: Mutex::new(state),
            applied: Mutex::new(Vec::new()),
            events: options.events,
            stats: Mutex::new(TransportStats::default()),
            closed: AtomicBool::new(false),
        });

        if options.initiator {
            peer.emit(PeerEvent::Signal(Signal::Offer(SessionDescription::offer(
                format!("offer-to-{}", options.remote_user_id),
            ))));
        }

        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Geräte, die immer mit dem gleichen Fehler scheitern
pub(crate) struct FailingDevices(pub MediaError);

#[async_trait]
impl MediaDevices for FailingDevices {
    async fn get_user_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        Err(self.0.clone())
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        ice: IceConfig::host_only(),
        stats_interval: STATS_INTERVAL,
        thresholds: Default::default(),
    }
}

/// Engine ohne lokalen Stream
pub(crate) fn bare_engine(user_id: &str, factory: Arc<FakePeerFactory>) -> CallEngine {
    let engine = CallEngine::new(test_config(), factory, Arc::new(VirtualMediaDevices));
    engine.set_local_user_id(user_id);
    engine
}

/// Engine mit Audio+Video Stream
pub(crate) fn engine_for(user_id: &str, factory: Arc<FakePeerFactory>) -> CallEngine {
    let engine = bare_engine(user_id, factory);
    engine.set_local_stream(LocalMediaStream::new(vec![
        MediaTrack::audio("mic"),
        MediaTrack::video("cam"),
    ]));
    engine
}

/// Callback, der alle Signale in einen Kanal schreibt
pub(crate) fn recording_callback() -> (SignalCallback, mpsc::UnboundedReceiver<Signal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: SignalCallback = Arc::new(move |signal| {
        let _ = tx.send(signal);
    });
    (callback, rx)
}

pub(crate) async fn next_signal(rx: &mut mpsc::UnboundedReceiver<Signal>) -> Signal {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for signal")
        .expect("signal channel closed")
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
