//! Signaling Module - Meeting-Channel über einen Realtime-Dienst
//!
//! Dieses Modul verwaltet die Kommunikation zwischen den Teilnehmern:
//! - Channel pro Meeting beitreten und verlassen
//! - Presence (Join/Leave) verfolgen
//! - Offer/Answer/ICE als Broadcast senden und empfangen
//!

mod client;
mod memory;
mod messages;
mod phoenix;
mod realtime;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use memory::{JoinBehavior, MemoryHub};
pub use messages::*;
pub use phoenix::PhoenixBackend;
pub use realtime::{
    ChannelEvent, ChannelStatus, JoinOptions, PresenceState, RealtimeBackend, RealtimeChannel,
    Subscription,
};
