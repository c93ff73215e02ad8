//! Pulse Mesh - P2P Meetings über WebRTC
//!
//! Ein Mesh aus direkten Peer Connections zwischen allen Teilnehmern:
//! - Realtime-Channel pro Meeting für Presence und Offer/Answer/ICE
//! - Perfect Negotiation mit deterministischer Kollisionsauflösung
//! - Verbindungsqualität pro Peer aus Transport-Statistiken
//! - Circuit Breaker für den Signaling-Dienst

pub mod call_engine;
pub mod config;
pub mod resilience;
pub mod session;
pub mod signaling;

pub use call_engine::{CallEngine, CallEngineError, ConnectionQuality, ConnectionState, EngineEvent};
pub use config::MeshConfig;
pub use resilience::{CircuitBreaker, CircuitBreakerConfig};
pub use session::{MeetingSession, SessionState};
pub use signaling::{SignalingClient, SignalingError, SignalingEvent};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

const DEFAULT_DIRECTIVES: &str = "pulse_mesh=debug,webrtc=warn";

/// Initialisiert Logging genau einmal. `RUST_LOG` hat Vorrang.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

        // Ein bereits gesetzter globaler Subscriber ist kein Fehler
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        tracing::info!("Initializing Pulse Mesh...");
    });
}
