//! Schnittstelle zwischen Engine und WebRTC-Implementierung
//!
//! Die Engine spricht nie direkt mit einer Peer Connection, sondern über
//! einen `PeerConnectionAdapter`. Der Adapter meldet alles Asynchrone
//! (lokale Signale, Remote-Streams, Connect/Close/Fehler) als `PeerEvent`
//! über den Kanal aus den `PeerOptions`.

use super::engine::CallEngineError;
use super::media::{LocalMediaStream, RemoteMediaStream};
use crate::config::IceConfig;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Ein Signal, das zwischen zwei Peers ausgetauscht wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::Candidate(_) => "candidate",
        }
    }
}

/// Events die ein Adapter an die Engine meldet
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokal erzeugtes Signal, muss an den Remote-Peer
    Signal(Signal),
    /// Remote-Media ist eingetroffen oder hat sich geändert
    Stream(RemoteMediaStream),
    /// Transport steht
    Connect,
    /// Transport unterbrochen, erholt sich eventuell wieder
    Interrupted,
    /// Verbindung geschlossen
    Close,
    /// Nicht behebbarer Fehler
    Error(String),
}

/// Signaling-Zustand der Offer/Answer-Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Momentaufnahme der Transport-Statistiken
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub rtt_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
}

/// Parameter für eine neue Peer Connection
pub struct PeerOptions {
    pub remote_user_id: String,
    pub initiator: bool,
    pub local_stream: LocalMediaStream,
    pub ice: IceConfig,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

/// Eine Peer Connection zu genau einem Remote-Teilnehmer
#[async_trait]
pub trait PeerConnectionAdapter: Send + Sync {
    /// Wendet ein Remote-Signal an
    async fn signal(&self, signal: Signal) -> Result<(), CallEngineError>;

    fn negotiation_state(&self) -> NegotiationState;

    async fn get_stats(&self) -> Result<TransportStats, CallEngineError>;

    async fn close(&self);
}

/// Erstellt Adapter. Ein Initiator erzeugt sein Offer selbst und meldet es
/// als `PeerEvent::Signal`.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        options: PeerOptions,
    ) -> Result<Arc<dyn PeerConnectionAdapter>, CallEngineError>;
}

// ============================================================================
// TIE BREAKER
// ============================================================================

/// Vergleicht zwei User-IDs. Wer zuerst sortiert, ist bei einer
/// Offer-Kollision der höfliche Peer.
pub trait TieBreaker: Send + Sync {
    fn compare(&self, local: &str, remote: &str) -> Ordering;

    fn is_polite(&self, local: &str, remote: &str) -> bool {
        self.compare(local, remote) == Ordering::Less
    }
}

/// Byteweiser Vergleich der IDs
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicographicTieBreaker;

impl TieBreaker for LexicographicTieBreaker {
    fn compare(&self, local: &str, remote: &str) -> Ordering {
        local.cmp(remote)
    }
}

impl<F> TieBreaker for F
where
    F: Fn(&str, &str) -> Ordering + Send + Sync,
{
    fn compare(&self, local: &str, remote: &str) -> Ordering {
        self(local, remote)
    }
}
