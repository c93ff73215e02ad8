//! Verbindungsqualität aus Transport-Statistiken

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
}

/// Grenzwerte für die Einstufung (RTT in ms, Verlust in Prozent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QualityThresholds {
    pub excellent_rtt_ms: f64,
    pub excellent_loss_pct: f64,
    pub good_rtt_ms: f64,
    pub good_loss_pct: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_rtt_ms: 100.0,
            excellent_loss_pct: 1.0,
            good_rtt_ms: 300.0,
            good_loss_pct: 5.0,
        }
    }
}

impl QualityThresholds {
    /// Stuft eine Messung ein. Beide Werte müssen unter der Grenze liegen.
    pub fn classify(&self, rtt_ms: f64, loss_pct: f64) -> ConnectionQuality {
        if rtt_ms < self.excellent_rtt_ms && loss_pct < self.excellent_loss_pct {
            ConnectionQuality::Excellent
        } else if rtt_ms < self.good_rtt_ms && loss_pct < self.good_loss_pct {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Poor
        }
    }
}

/// Gesamtqualität über alle Peers: die schlechteste Einzelverbindung.
/// Ohne Messungen gilt `Excellent`.
pub fn overall<I>(qualities: I) -> ConnectionQuality
where
    I: IntoIterator<Item = ConnectionQuality>,
{
    qualities
        .into_iter()
        .max()
        .unwrap_or(ConnectionQuality::Excellent)
}
